//! Job record: the store's single source of truth for one job.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{EnqueueRequest, JobSnapshot, JobState, RetryPolicy};
use crate::domain::{JobId, JobType, LeaseId, mask_payload};

/// All state transitions happen here; the store only picks which record to
/// touch.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: JobId,
    pub job_type: JobType,
    pub entity_id: String,
    pub payload: Value,
    pub state: JobState,

    /// Attempts started so far, including the current one while Active.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: RetryPolicy,

    /// Lease of the attempt in progress (Active only).
    pub lease: Option<LeaseId>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    /// When the job becomes claimable (Waiting/Delayed).
    pub available_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(request: EnqueueRequest, now: DateTime<Utc>) -> Self {
        let available_at = crate::ports::clock::after(now, request.options.delay);
        let state = if available_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        Self {
            job_id: request.job_id,
            job_type: request.job_type,
            entity_id: request.entity_id,
            payload: request.payload,
            state,
            attempts_made: 0,
            max_attempts: request.options.max_attempts.max(1),
            backoff: request.options.backoff,
            lease: None,
            last_error: None,
            created_at: now,
            available_at,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.available_at <= now
    }

    pub fn is_held_by(&self, lease: LeaseId) -> bool {
        self.state == JobState::Active && self.lease == Some(lease)
    }

    pub fn attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    pub fn start_attempt(&mut self, lease: LeaseId, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.lease = Some(lease);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.finish(JobState::Completed, now);
    }

    pub fn mark_discarded(&mut self, error: String, now: DateTime<Utc>) {
        self.last_error = Some(error);
        self.finish(JobState::Discarded, now);
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.last_error = Some(error);
        self.finish(JobState::Failed, now);
    }

    pub fn schedule_retry(&mut self, available_at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.state = if available_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        self.available_at = available_at;
        self.last_error = Some(error);
        self.lease = None;
        self.updated_at = now;
    }

    fn finish(&mut self, state: JobState, now: DateTime<Utc>) {
        self.state = state;
        self.lease = None;
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    /// Store-reported state at `now` (a Delayed job that is due reads as Waiting).
    pub fn state_at(&self, now: DateTime<Utc>) -> JobState {
        match self.state {
            JobState::Delayed if self.available_at <= now => JobState::Waiting,
            state => state,
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            job_type: self.job_type,
            entity_id: self.entity_id.clone(),
            state: self.state_at(now),
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            available_at: self.available_at,
            finished_at: self.finished_at,
            payload: mask_payload(&self.payload),
        }
    }
}
