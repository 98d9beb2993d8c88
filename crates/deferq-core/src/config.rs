//! Pipeline configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//!
//! ```toml
//! [worker]
//! concurrency = 5
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//!
//! [capture]
//! delay_secs = 3600
//!
//! [sweep]
//! interval_secs = 3600
//! safety_buffer_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub capture: CaptureConfig,
    pub sweep: SweepConfig,
    pub timeouts: TimeoutConfig,
    pub dlq: DlqConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Jobs processed in parallel per process.
    pub concurrency: usize,
    /// Sleep between claim attempts when every queue is empty.
    pub poll_interval_ms: u64,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval_ms: 250,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Order modification window; capture runs after it.
    pub delay_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { delay_secs: 3_600 }
    }
}

impl CaptureConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub interval_secs: u64,
    /// Added to the capture delay before an order counts as stale.
    pub safety_buffer_secs: u64,
    /// Max orders fetched per query.
    pub batch_limit: usize,
    /// Run once immediately when the loop starts.
    pub run_on_start: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            safety_buffer_secs: 300,
            batch_limit: 500,
            run_on_start: false,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn safety_buffer(&self) -> Duration {
        Duration::from_secs(self.safety_buffer_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Bound on every job-store call.
    pub store_ms: u64,
    /// Bound on every payment/email provider call.
    pub service_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            store_ms: 3_000,
            service_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn store(&self) -> Duration {
        Duration::from_millis(self.store_ms)
    }

    pub fn service(&self) -> Duration {
        Duration::from_millis(self.service_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DlqConfig {
    /// Lists are stored under `{key_prefix}:{job_type}`.
    pub key_prefix: String,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            key_prefix: "dlq".into(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.worker.concurrency == 0 {
            return invalid("worker.concurrency must be at least 1");
        }
        if self.worker.poll_interval_ms == 0 {
            return invalid("worker.poll_interval_ms must be positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be a finite number >= 1.0");
        }
        if self.sweep.interval_secs == 0 {
            return invalid("sweep.interval_secs must be positive");
        }
        if self.sweep.batch_limit == 0 {
            return invalid("sweep.batch_limit must be at least 1");
        }
        if self.timeouts.store_ms == 0 || self.timeouts.service_ms == 0 {
            return invalid("timeouts must be positive");
        }
        if self.dlq.key_prefix.trim().is_empty() {
            return invalid("dlq.key_prefix must not be empty");
        }
        Ok(())
    }

    /// Capture delay plus safety buffer: orders older than this are stale.
    pub fn stale_after(&self) -> Duration {
        self.capture.delay() + self.sweep.safety_buffer()
    }
}
