//! Durable Job Store: contract, job state machine, retry policy and the
//! in-memory implementation.
//!
//! Design intent:
//! - The store owns job state and transitions (Waiting -> Active -> ...).
//! - Workers execute side effects and report back through the lease.
//! - A job id is unique per store: enqueueing an id that is still in flight
//!   returns the existing job instead of creating a second one.

mod memory;
mod record;
mod retry;
mod state;

pub use memory::InMemoryJobStore;
pub use record::JobRecord;
pub use retry::RetryPolicy;
pub use state::JobState;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::{JobId, JobType, LeaseId};
use crate::error::StoreError;
use crate::observability::QueueCounts;

/// Per-job options, fixed at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobOptions {
    pub delay: Duration,
    pub max_attempts: u32,
    pub backoff: RetryPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            max_attempts: 3,
            backoff: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub job_id: JobId,
    pub job_type: JobType,
    pub entity_id: String,
    pub payload: Value,
    pub options: JobOptions,
}

/// Result of an accepted enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub job_type: JobType,
    /// `false` when an in-flight job with the same id already existed.
    pub created: bool,
    pub state: JobState,
    pub available_at: DateTime<Utc>,
}

/// The job as handed to a worker for one attempt.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: JobId,
    pub job_type: JobType,
    pub entity_id: String,
    pub payload: Value,
    /// 1-indexed number of this attempt.
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: RetryPolicy,
}

impl ClaimedJob {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// A claimed job. The worker owns the lease and must ack, nack or discard it.
#[derive(Debug, Clone)]
pub struct JobLease {
    pub lease_id: LeaseId,
    pub job: ClaimedJob,
}

/// What the store did with a negatively acknowledged attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Another attempt is scheduled.
    Retrying {
        next_attempt: u32,
        available_at: DateTime<Utc>,
    },
    /// The attempt budget is spent; the job is now Failed.
    Exhausted { attempts: u32 },
}

/// Read model of a job for status pages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub job_type: JobType,
    pub entity_id: String,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Stored payload with the recipient masked.
    pub payload: Value,
}

/// Durable Job Store port.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Idempotent by `job_id`: an in-flight job with the same id is returned
    /// as is (`created = false`); a terminal one is replaced.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle, StoreError>;

    /// Claims the earliest due job of `job_type`, if any.
    async fn claim_next(&self, job_type: JobType) -> Result<Option<JobLease>, StoreError>;

    async fn ack(&self, lease: &JobLease) -> Result<(), StoreError>;

    /// Permanent failure: the job ends Discarded without further attempts.
    async fn discard(&self, lease: &JobLease, error: &str) -> Result<(), StoreError>;

    /// Transient failure: schedules a retry after `retry_after`, or ends the
    /// job as Failed when the attempt budget is spent.
    async fn nack(
        &self,
        lease: &JobLease,
        error: &str,
        retry_after: Duration,
    ) -> Result<NackOutcome, StoreError>;

    async fn get_state(&self, job_id: &JobId) -> Result<JobState, StoreError>;

    async fn list(
        &self,
        job_type: JobType,
        state: Option<JobState>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobSnapshot>, StoreError>;

    async fn counts(&self, job_type: JobType) -> Result<QueueCounts, StoreError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Append-only lists, used for dead letters.
#[async_trait]
pub trait ListStore: Send + Sync {
    async fn push(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Inclusive range with negative indices counting from the end
    /// (`0, -1` is the whole list).
    async fn range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError>;

    async fn len(&self, key: &str) -> Result<usize, StoreError>;
}

/// Bounds a store call. Elapsed calls become [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
