//! Status - 運用向けの読み取り専用ビュー
//!
//! ジョブ種別ごとの件数、ジョブ一覧、DLQ 一覧を返す。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::dead_letter::DeadLetterQueue;
use crate::domain::{DlqEntry, JobType};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::store::{JobSnapshot, JobState, JobStore, with_timeout};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueOverview {
    pub job_type: JobType,
    pub counts: QueueCounts,
    pub dead_letters: usize,
}

pub struct StatusService {
    store: Arc<dyn JobStore>,
    dlq: Arc<DeadLetterQueue>,
    timeout: Duration,
}

impl StatusService {
    pub fn new(store: Arc<dyn JobStore>, dlq: Arc<DeadLetterQueue>, timeout: Duration) -> Self {
        Self {
            store,
            dlq,
            timeout,
        }
    }

    pub async fn overview(&self) -> Result<Vec<QueueOverview>, StoreError> {
        let mut overview = Vec::with_capacity(JobType::ALL.len());
        for job_type in JobType::ALL {
            let counts = with_timeout(self.timeout, self.store.counts(job_type)).await?;
            let dead_letters = self.dlq.len(job_type).await?;
            overview.push(QueueOverview {
                job_type,
                counts,
                dead_letters,
            });
        }
        Ok(overview)
    }

    pub async fn jobs(
        &self,
        job_type: JobType,
        state: Option<JobState>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobSnapshot>, StoreError> {
        with_timeout(self.timeout, self.store.list(job_type, state, offset, limit)).await
    }

    pub async fn dead_letters(
        &self,
        job_type: JobType,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DlqEntry>, StoreError> {
        self.dlq.list(job_type, offset, limit).await
    }
}
