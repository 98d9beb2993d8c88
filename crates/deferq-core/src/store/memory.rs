//! In-memory job store.
//!
//! Reference implementation of [`JobStore`] and [`ListStore`]. Used by tests
//! and the CLI simulation; `set_available(false)` simulates an outage.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    EnqueueRequest, JobHandle, JobLease, JobRecord, JobSnapshot, JobState, JobStore, ListStore,
    NackOutcome,
};
use crate::domain::{JobId, JobType};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::ports::{Clock, LeaseIdGenerator, UlidLeaseIds};
use crate::store::ClaimedJob;

#[derive(Default)]
struct StoreState {
    /// All job records (single source of truth).
    jobs: HashMap<JobId, JobRecord>,

    /// Named append-only lists.
    lists: HashMap<String, Vec<String>>,
}

pub struct InMemoryJobStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    lease_ids: Arc<dyn LeaseIdGenerator>,
    available: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let lease_ids = Arc::new(UlidLeaseIds::new(clock.clone()));
        Self::with_lease_ids(clock, lease_ids)
    }

    pub fn with_lease_ids(clock: Arc<dyn Clock>, lease_ids: Arc<dyn LeaseIdGenerator>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
            lease_ids,
            available: AtomicBool::new(true),
        }
    }

    /// While unavailable every call fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drops all jobs and lists, like a store that lost its data.
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        state.jobs.clear();
        state.lists.clear();
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn lease_lost(lease: &JobLease) -> StoreError {
        StoreError::LeaseLost {
            job_id: lease.job.job_id.to_string(),
            lease_id: lease.lease_id.to_string(),
        }
    }

    /// Record held by `lease`, or `LeaseLost`.
    fn held<'a>(
        jobs: &'a mut HashMap<JobId, JobRecord>,
        lease: &JobLease,
    ) -> Result<&'a mut JobRecord, StoreError> {
        jobs.get_mut(&lease.job.job_id)
            .filter(|record| record.is_held_by(lease.lease_id))
            .ok_or_else(|| Self::lease_lost(lease))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if let Some(existing) = state.jobs.get(&request.job_id) {
            if !existing.state.is_terminal() {
                return Ok(JobHandle {
                    job_id: existing.job_id.clone(),
                    job_type: existing.job_type,
                    created: false,
                    state: existing.state_at(now),
                    available_at: existing.available_at,
                });
            }
        }

        let record = JobRecord::new(request, now);
        let handle = JobHandle {
            job_id: record.job_id.clone(),
            job_type: record.job_type,
            created: true,
            state: record.state_at(now),
            available_at: record.available_at,
        };
        state.jobs.insert(record.job_id.clone(), record);
        Ok(handle)
    }

    async fn claim_next(&self, job_type: JobType) -> Result<Option<JobLease>, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let Some(record) = state
            .jobs
            .values_mut()
            .filter(|r| r.job_type == job_type && r.is_claimable(now))
            .min_by(|a, b| {
                (a.available_at, a.created_at, &a.job_id).cmp(&(b.available_at, b.created_at, &b.job_id))
            })
        else {
            return Ok(None);
        };

        let lease_id = self.lease_ids.next_lease_id();
        record.start_attempt(lease_id, now);
        Ok(Some(JobLease {
            lease_id,
            job: ClaimedJob {
                job_id: record.job_id.clone(),
                job_type: record.job_type,
                entity_id: record.entity_id.clone(),
                payload: record.payload.clone(),
                attempt: record.attempts_made,
                max_attempts: record.max_attempts,
                backoff: record.backoff,
            },
        }))
    }

    async fn ack(&self, lease: &JobLease) -> Result<(), StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Self::held(&mut state.jobs, lease)?.mark_completed(now);
        Ok(())
    }

    async fn discard(&self, lease: &JobLease, error: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Self::held(&mut state.jobs, lease)?.mark_discarded(error.to_string(), now);
        Ok(())
    }

    async fn nack(
        &self,
        lease: &JobLease,
        error: &str,
        retry_after: Duration,
    ) -> Result<NackOutcome, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = Self::held(&mut state.jobs, lease)?;

        if !record.attempts_left() {
            record.mark_failed(error.to_string(), now);
            return Ok(NackOutcome::Exhausted {
                attempts: record.attempts_made,
            });
        }

        let available_at = crate::ports::clock::after(now, retry_after);
        record.schedule_retry(available_at, error.to_string(), now);
        Ok(NackOutcome::Retrying {
            next_attempt: record.attempts_made + 1,
            available_at,
        })
    }

    async fn get_state(&self, job_id: &JobId) -> Result<JobState, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .get(job_id)
            .map_or(JobState::Missing, |r| r.state_at(now)))
    }

    async fn list(
        &self,
        job_type: JobType,
        filter: Option<JobState>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobSnapshot>, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let state = self.state.lock().await;

        let mut matching: Vec<&JobRecord> = state
            .jobs
            .values()
            .filter(|r| r.job_type == job_type)
            .filter(|r| filter.is_none_or(|s| r.state_at(now) == s))
            .collect();
        matching.sort_by(|a, b| (a.created_at, &a.job_id).cmp(&(b.created_at, &b.job_id)));

        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|r| r.snapshot(now))
            .collect())
    }

    async fn counts(&self, job_type: JobType) -> Result<QueueCounts, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let state = self.state.lock().await;

        let mut counts = QueueCounts::default();
        for record in state.jobs.values().filter(|r| r.job_type == job_type) {
            counts.add(record.state_at(now));
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }
}

#[async_trait]
impl ListStore for InMemoryJobStore {
    async fn push(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        state.lists.entry(key.to_string()).or_default().push(value);
        Ok(())
    }

    async fn range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(slice_range(list.len(), start, stop)
            .map(|r| list[r].to_vec())
            .unwrap_or_default())
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, Vec::len))
    }
}

/// Resolves an inclusive, possibly negative index pair against `len`.
fn slice_range(len: usize, start: isize, stop: isize) -> Option<std::ops::Range<usize>> {
    let len = isize::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    let start = usize::try_from(start).ok()?;
    let stop = usize::try_from(stop).ok()?;
    Some(start..stop + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use crate::store::{JobOptions, RetryPolicy};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use serde_json::json;

    fn fixture() -> (Arc<FixedClock>, InMemoryJobStore) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = InMemoryJobStore::new(clock.clone());
        (clock, store)
    }

    fn request(entity: &str, delay: Duration, max_attempts: u32) -> EnqueueRequest {
        EnqueueRequest {
            job_id: JobId::for_entity(JobType::PaymentCapture, entity),
            job_type: JobType::PaymentCapture,
            entity_id: entity.into(),
            payload: json!({ "kind": "payment_capture", "order_id": entity, "payment_intent_id": "pi" }),
            options: JobOptions {
                delay,
                max_attempts,
                backoff: RetryPolicy::default(),
            },
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_while_in_flight() {
        let (_clock, store) = fixture();

        let first = store.enqueue(request("o1", Duration::from_secs(60), 3)).await.unwrap();
        let second = store.enqueue(request("o1", Duration::ZERO, 3)).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.state, JobState::Delayed);
        assert_eq!(second.available_at, first.available_at);
        assert_eq!(store.counts(JobType::PaymentCapture).await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn terminal_job_is_replaced_on_reenqueue() {
        let (_clock, store) = fixture();
        store.enqueue(request("o1", Duration::ZERO, 3)).await.unwrap();
        let lease = store.claim_next(JobType::PaymentCapture).await.unwrap().unwrap();
        store.ack(&lease).await.unwrap();

        let again = store.enqueue(request("o1", Duration::ZERO, 3)).await.unwrap();

        assert!(again.created);
        assert_eq!(again.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn delayed_job_is_claimable_only_when_due() {
        let (clock, store) = fixture();
        store.enqueue(request("o1", Duration::from_secs(30), 3)).await.unwrap();

        assert!(store.claim_next(JobType::PaymentCapture).await.unwrap().is_none());

        clock.advance(Duration::from_secs(30));
        let lease = store.claim_next(JobType::PaymentCapture).await.unwrap().unwrap();
        assert_eq!(lease.job.attempt, 1);
        assert_eq!(
            store.get_state(&lease.job.job_id).await.unwrap(),
            JobState::Active
        );
    }

    #[tokio::test]
    async fn claim_is_per_job_type() {
        let (_clock, store) = fixture();
        store.enqueue(request("o1", Duration::ZERO, 3)).await.unwrap();

        assert!(store.claim_next(JobType::EmailDelivery).await.unwrap().is_none());
        assert!(store.claim_next(JobType::PaymentCapture).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nack_retries_until_budget_is_spent() {
        let (clock, store) = fixture();
        store.enqueue(request("o1", Duration::ZERO, 2)).await.unwrap();

        let lease = store.claim_next(JobType::PaymentCapture).await.unwrap().unwrap();
        let outcome = store.nack(&lease, "503", Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            outcome,
            NackOutcome::Retrying {
                next_attempt: 2,
                available_at: clock.now() + chrono::Duration::seconds(1),
            }
        );
        assert_eq!(
            store.get_state(&lease.job.job_id).await.unwrap(),
            JobState::Delayed
        );

        clock.advance(Duration::from_secs(1));
        let lease = store.claim_next(JobType::PaymentCapture).await.unwrap().unwrap();
        assert_eq!(lease.job.attempt, 2);
        let outcome = store.nack(&lease, "503", Duration::from_secs(2)).await.unwrap();

        assert_eq!(outcome, NackOutcome::Exhausted { attempts: 2 });
        assert_eq!(
            store.get_state(&lease.job.job_id).await.unwrap(),
            JobState::Failed
        );
    }

    #[tokio::test]
    async fn stale_lease_is_rejected() {
        let (_clock, store) = fixture();
        store.enqueue(request("o1", Duration::ZERO, 3)).await.unwrap();
        let lease = store.claim_next(JobType::PaymentCapture).await.unwrap().unwrap();
        store.ack(&lease).await.unwrap();

        let err = store.ack(&lease).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn unknown_job_is_missing() {
        let (_clock, store) = fixture();
        let id = JobId::for_entity(JobType::PaymentCapture, "nope");
        assert_eq!(store.get_state(&id).await.unwrap(), JobState::Missing);
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let (_clock, store) = fixture();
        store.set_available(false);

        assert!(store.ping().await.is_err());
        let err = store.enqueue(request("o1", Duration::ZERO, 3)).await.unwrap_err();
        assert!(err.is_connectivity());

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn flush_forgets_jobs() {
        let (_clock, store) = fixture();
        let handle = store.enqueue(request("o1", Duration::ZERO, 3)).await.unwrap();
        store.flush().await;
        assert_eq!(store.get_state(&handle.job_id).await.unwrap(), JobState::Missing);
    }

    #[tokio::test]
    async fn list_pages_in_creation_order() {
        let (clock, store) = fixture();
        for entity in ["o1", "o2", "o3"] {
            store.enqueue(request(entity, Duration::ZERO, 3)).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let page = store.list(JobType::PaymentCapture, None, 1, 5).await.unwrap();
        let ids: Vec<_> = page.iter().map(|s| s.entity_id.as_str()).collect();
        assert_eq!(ids, ["o2", "o3"]);

        let waiting = store
            .list(JobType::PaymentCapture, Some(JobState::Active), 0, 10)
            .await
            .unwrap();
        assert!(waiting.is_empty());
    }

    #[rstest]
    #[case::whole(0, -1, Some(0..5))]
    #[case::head(0, 1, Some(0..2))]
    #[case::tail(-2, -1, Some(3..5))]
    #[case::clamped_stop(3, 100, Some(3..5))]
    #[case::clamped_start(-100, 0, Some(0..1))]
    #[case::past_end(5, 10, None)]
    #[case::inverted(3, 1, None)]
    fn list_ranges_follow_inclusive_negative_indexing(
        #[case] start: isize,
        #[case] stop: isize,
        #[case] expected: Option<std::ops::Range<usize>>,
    ) {
        assert_eq!(slice_range(5, start, stop), expected);
    }

    #[tokio::test]
    async fn lists_append_and_range() {
        let (_clock, store) = fixture();
        for n in 0..3 {
            store.push("dlq:email_delivery", n.to_string()).await.unwrap();
        }

        assert_eq!(store.len("dlq:email_delivery").await.unwrap(), 3);
        assert_eq!(
            store.range("dlq:email_delivery", 1, -1).await.unwrap(),
            ["1", "2"]
        );
        assert!(store.range("dlq:other", 0, -1).await.unwrap().is_empty());
    }
}
