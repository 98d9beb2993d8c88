//! Dead-letter queue: one append-only list per job type.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::domain::{DlqEntry, JobType};
use crate::error::StoreError;
use crate::observability::metric;
use crate::store::{ListStore, with_timeout};

pub struct DeadLetterQueue {
    lists: Arc<dyn ListStore>,
    key_prefix: String,
    timeout: Duration,
}

impl DeadLetterQueue {
    pub fn new(lists: Arc<dyn ListStore>, key_prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            lists,
            key_prefix: key_prefix.into(),
            timeout,
        }
    }

    pub fn key_for(&self, job_type: JobType) -> String {
        format!("{}:{}", self.key_prefix, job_type.as_str())
    }

    /// Appends `entry`. Never fails: a write error is logged and counted,
    /// and the caller carries on.
    pub async fn push(&self, entry: &DlqEntry) -> bool {
        let raw = match serde_json::to_string(entry) {
            Ok(raw) => raw,
            Err(e) => {
                error!(job_id = %entry.job_id, error = %e, "failed to encode dead letter");
                metric::record_dlq_write_failure(entry.job_type);
                return false;
            }
        };

        let key = self.key_for(entry.job_type);
        match with_timeout(self.timeout, self.lists.push(&key, raw)).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    job_id = %entry.job_id,
                    job_type = %entry.job_type,
                    error = %e,
                    "failed to write dead letter"
                );
                metric::record_dlq_write_failure(entry.job_type);
                false
            }
        }
    }

    /// Entries in insertion order. Undecodable entries are skipped.
    pub async fn list(
        &self,
        job_type: JobType,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DlqEntry>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = isize::try_from(offset).unwrap_or(isize::MAX);
        let stop = start.saturating_add(isize::try_from(limit).unwrap_or(isize::MAX) - 1);

        let key = self.key_for(job_type);
        let raw = with_timeout(self.timeout, self.lists.range(&key, start, stop)).await?;
        Ok(raw
            .iter()
            .filter_map(|item| match serde_json::from_str(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping undecodable dead letter");
                    None
                }
            })
            .collect())
    }

    pub async fn len(&self, job_type: JobType) -> Result<usize, StoreError> {
        let key = self.key_for(job_type);
        with_timeout(self.timeout, self.lists.len(&key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DlqReason, JobId};
    use crate::ports::FixedClock;
    use crate::store::InMemoryJobStore;
    use chrono::{TimeZone, Utc};
    use tracing_test::traced_test;

    fn fixture() -> (Arc<InMemoryJobStore>, DeadLetterQueue) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryJobStore::new(clock));
        let dlq = DeadLetterQueue::new(store.clone(), "dlq", Duration::from_secs(1));
        (store, dlq)
    }

    fn entry(entity: &str) -> DlqEntry {
        DlqEntry::new(
            JobId::for_entity(JobType::PaymentCapture, entity),
            entity,
            JobType::PaymentCapture,
            DlqReason::RetriesExhausted,
            "provider error 503: busy",
            3,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 7).unwrap(),
        )
    }

    #[tokio::test]
    async fn entries_are_listed_per_job_type_with_paging() {
        let (_store, dlq) = fixture();
        for entity in ["o1", "o2", "o3"] {
            assert!(dlq.push(&entry(entity)).await);
        }

        assert_eq!(dlq.key_for(JobType::PaymentCapture), "dlq:payment_capture");
        assert_eq!(dlq.len(JobType::PaymentCapture).await.unwrap(), 3);
        assert!(dlq.list(JobType::EmailDelivery, 0, 10).await.unwrap().is_empty());

        let page = dlq.list(JobType::PaymentCapture, 1, 1).await.unwrap();
        assert_eq!(page, [entry("o2")]);
    }

    #[tokio::test]
    #[traced_test]
    async fn push_swallows_store_errors() {
        let (store, dlq) = fixture();
        store.set_available(false);

        assert!(!dlq.push(&entry("o1")).await);
        assert!(logs_contain("failed to write dead letter"));
    }
}
