//! deferq: operator CLI for the delayed-action pipeline
//!
//! Subcommands:
//! - `simulate`: run an in-memory pipeline end-to-end with injected failures
//! - `sweep`: seed stale/flagged orders against an empty store and run one sweep
//! - `mask`: mask an email address the way logs and DLQ entries do
//! - `classify`: show how a provider error would be handled

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use deferq_core::PipelineConfig;
use deferq_core::domain::{ClassifiedError, Disposition, mask_email};

mod simulate;

/// Accepts "1", "true", "yes", "on" and "0", "false", "no", "off", "" (case-insensitive).
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{s}', expected 1/true/yes/on or 0/false/no/off"
        )),
    }
}

#[derive(Parser)]
#[command(name = "deferq")]
#[command(about = "Delayed-action reliability pipeline", long_about = None)]
struct Cli {
    /// Pipeline config file (TOML). Defaults apply for anything it leaves out.
    #[arg(long, global = true, env = "DEFERQ_CONFIG")]
    config: Option<PathBuf>,

    /// Log as JSON lines instead of human-readable text
    #[arg(long, global = true, env = "DEFERQ_LOG_JSON", value_parser = parse_bool_env, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place orders against an in-memory pipeline and let workers and the sweep run
    Simulate {
        /// Orders to place
        #[arg(long, default_value = "20")]
        orders: usize,

        /// Orders whose capture is declined (dead-lettered on the first attempt)
        #[arg(long, default_value = "2")]
        permanent_failures: usize,

        /// Orders whose first two captures hit a provider outage
        #[arg(long, default_value = "3")]
        transient_failures: usize,

        /// How long to run workers and the sweep loop
        #[arg(long, default_value = "10")]
        run_for_secs: u64,

        /// Overrides capture.delay_secs
        #[arg(long, env = "DEFERQ_CAPTURE_DELAY_SECS", default_value = "2")]
        capture_delay_secs: u64,

        /// Overrides worker.concurrency
        #[arg(long, env = "DEFERQ_WORKER_CONCURRENCY")]
        concurrency: Option<usize>,
    },

    /// Run one reconciliation sweep over seeded orders and an empty job store
    Sweep {
        /// Stale orders (placed past capture delay + safety buffer)
        #[arg(long, default_value = "10")]
        orders: usize,

        /// Fresh orders carrying a recovery flag
        #[arg(long, default_value = "3")]
        flagged: usize,
    },

    /// Mask an email address
    Mask {
        address: String,
    },

    /// Classify a provider error
    Classify {
        /// HTTP status returned by the provider, if any
        #[arg(long)]
        status: Option<u16>,

        message: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    // stdout is reserved for command output
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct Classification<'a> {
    kind: &'static str,
    status: Option<u16>,
    disposition: Disposition,
    retryable: bool,
    message: &'a str,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Simulate {
            orders,
            permanent_failures,
            transient_failures,
            run_for_secs,
            capture_delay_secs,
            concurrency,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            config.capture.delay_secs = capture_delay_secs;
            if let Some(concurrency) = concurrency {
                config.worker.concurrency = concurrency;
            }
            let report = simulate::run_simulation(
                config,
                simulate::Scenario {
                    orders,
                    permanent_failures,
                    transient_failures,
                    run_for: std::time::Duration::from_secs(run_for_secs),
                },
            )
            .await?;
            print_json(&report)?;
        }
        Commands::Sweep { orders, flagged } => {
            let config = load_config(cli.config.as_deref())?;
            let report = simulate::run_sweep(config, orders, flagged).await?;
            print_json(&report)?;
        }
        Commands::Mask { address } => {
            println!("{}", mask_email(Some(&address)));
        }
        Commands::Classify { status, message } => {
            let err = ClassifiedError::from_provider(status, message.clone());
            print_json(&Classification {
                kind: err.kind(),
                status: err.status(),
                disposition: err.disposition(),
                retryable: err.is_retryable(),
                message: &message,
            })?;
        }
    }

    Ok(())
}
