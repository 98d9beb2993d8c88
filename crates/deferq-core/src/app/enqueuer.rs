//! Enqueuer: the single entry point business logic uses to schedule work.
//!
//! Never surfaces job-store failures to the caller. When a payment capture
//! cannot be scheduled because the store is unreachable, the order gets a
//! recovery flag so the sweep can pick it up later.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::domain::{
    CapturePayload, EmailPayload, JobId, JobPayload, JobSource, JobType, RecoveryFlag,
};
use crate::error::{PipelineError, StoreError};
use crate::observability::metric;
use crate::ports::{Clock, OrderRepository, with_repo_timeout};
use crate::store::{EnqueueRequest, JobHandle, JobOptions, JobStore, RetryPolicy, with_timeout};

#[derive(Debug, Clone, Copy)]
pub struct EnqueuerSettings {
    pub max_attempts: u32,
    pub backoff: RetryPolicy,
    pub capture_delay: Duration,
    pub store_timeout: Duration,
}

impl Default for EnqueuerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: RetryPolicy::default(),
            capture_delay: Duration::from_secs(3_600),
            store_timeout: Duration::from_secs(3),
        }
    }
}

pub struct Enqueuer {
    store: Arc<dyn JobStore>,
    orders: Arc<dyn OrderRepository>,
    clock: Arc<dyn Clock>,
    settings: EnqueuerSettings,
}

impl Enqueuer {
    pub fn new(
        store: Arc<dyn JobStore>,
        orders: Arc<dyn OrderRepository>,
        clock: Arc<dyn Clock>,
        settings: EnqueuerSettings,
    ) -> Self {
        Self {
            store,
            orders,
            clock,
            settings,
        }
    }

    pub fn capture_delay(&self) -> Duration {
        self.settings.capture_delay
    }

    /// Schedules `payload` for `entity_id` after `delay`.
    ///
    /// `Ok(None)` means the job store failed; the failure is logged. `Err`
    /// is reserved for caller mistakes (invalid or mismatched payload).
    pub async fn enqueue(
        &self,
        job_type: JobType,
        entity_id: &str,
        payload: JobPayload,
        delay: Duration,
    ) -> Result<Option<JobHandle>, PipelineError> {
        match self.submit(job_type, entity_id, payload, delay).await {
            Ok(handle) => Ok(Some(handle)),
            Err(PipelineError::Store(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Schedules the capture of `payment_intent_id` after `delay`
    /// (normally the modification window).
    pub async fn schedule_capture(
        &self,
        order_id: &str,
        payment_intent_id: &str,
        delay: Duration,
    ) -> Result<Option<JobHandle>, PipelineError> {
        self.schedule_capture_from(order_id, payment_intent_id, delay, JobSource::Scheduled)
            .await
    }

    pub async fn schedule_capture_from(
        &self,
        order_id: &str,
        payment_intent_id: &str,
        delay: Duration,
        source: JobSource,
    ) -> Result<Option<JobHandle>, PipelineError> {
        let payload = JobPayload::PaymentCapture(CapturePayload {
            order_id: order_id.to_string(),
            payment_intent_id: payment_intent_id.to_string(),
            source,
        });

        match self
            .submit(JobType::PaymentCapture, order_id, payload, delay)
            .await
        {
            Ok(handle) => Ok(Some(handle)),
            Err(PipelineError::Store(e)) => {
                if e.is_connectivity() {
                    self.flag_for_recovery(order_id, &e).await;
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Schedules a transactional email, sent as soon as a worker is free.
    ///
    /// The job is keyed on entity, template and a hash of the recipient, so
    /// scheduling the same email twice sends it once.
    pub async fn enqueue_email(
        &self,
        entity_id: &str,
        template: &str,
        recipient: &str,
        data: Value,
    ) -> Result<Option<JobHandle>, PipelineError> {
        let key = email_entity_key(entity_id, template, recipient);
        let payload = JobPayload::EmailDelivery(EmailPayload {
            entity_id: entity_id.to_string(),
            recipient: recipient.to_string(),
            template: template.to_string(),
            data,
            source: JobSource::Scheduled,
        });
        self.enqueue(JobType::EmailDelivery, &key, payload, Duration::ZERO)
            .await
    }

    /// Store errors come back as `PipelineError::Store`, already logged.
    async fn submit(
        &self,
        job_type: JobType,
        entity_id: &str,
        payload: JobPayload,
        delay: Duration,
    ) -> Result<JobHandle, PipelineError> {
        if payload.job_type() != job_type {
            return Err(PipelineError::PayloadMismatch {
                expected: job_type,
                actual: payload.job_type(),
            });
        }
        if entity_id.trim().is_empty() {
            return Err(PipelineError::InvalidPayload("entity_id is empty".into()));
        }
        payload.validate()?;

        let source = payload.source();
        let request = EnqueueRequest {
            job_id: JobId::for_entity(job_type, entity_id),
            job_type,
            entity_id: entity_id.to_string(),
            payload: payload.to_json()?,
            options: JobOptions {
                delay,
                max_attempts: self.settings.max_attempts,
                backoff: self.settings.backoff,
            },
        };
        let job_id = request.job_id.clone();

        match with_timeout(self.settings.store_timeout, self.store.enqueue(request)).await {
            Ok(handle) => {
                info!(
                    job_id = %handle.job_id,
                    job_type = %job_type,
                    entity_id = %entity_id,
                    source = source.as_str(),
                    created = handle.created,
                    delay_secs = delay.as_secs(),
                    "job scheduled"
                );
                metric::record_enqueue(
                    job_type,
                    source,
                    if handle.created { "created" } else { "duplicate" },
                );
                Ok(handle)
            }
            Err(e) => {
                error!(
                    job_id = %job_id,
                    job_type = %job_type,
                    entity_id = %entity_id,
                    source = source.as_str(),
                    error = %e,
                    "failed to schedule job"
                );
                metric::record_enqueue(job_type, source, "failed");
                Err(PipelineError::Store(e))
            }
        }
    }

    async fn flag_for_recovery(&self, order_id: &str, cause: &StoreError) {
        let flag = RecoveryFlag::new(format!("capture not scheduled: {cause}"), self.clock.now());
        let flagged = with_repo_timeout(
            self.settings.store_timeout,
            self.orders.set_recovery_flag(order_id, Some(flag)),
        )
        .await;
        match flagged {
            Ok(()) => {
                warn!(order_id = %order_id, "order flagged for recovery");
                metric::record_recovery_flag("set");
            }
            Err(e) => {
                error!(
                    order_id = %order_id,
                    error = %e,
                    "failed to flag order for recovery; only the stale-order sweep can catch it"
                );
            }
        }
    }
}

/// `{entity_id}:{template}:{first 8 bytes of sha256(lowercased recipient), hex}`
pub fn email_entity_key(entity_id: &str, template: &str, recipient: &str) -> String {
    let digest = Sha256::digest(recipient.trim().to_lowercase().as_bytes());
    let fingerprint: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{entity_id}:{template}:{fingerprint}")
}
