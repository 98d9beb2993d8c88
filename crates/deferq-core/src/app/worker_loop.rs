//! WorkerLoop - ジョブ実行ループ
//!
//! # フロー
//! 1. `JobStore::claim_next()` でリース取得
//! 2. ハンドラ実行 → `HandlerOutcome` / `ClassifiedError`
//! 3. 成功なら ack
//! 4. 恒久エラーなら DLQ へ書いてから discard（リトライしない）
//! 5. 一時エラーなら nack（バックオフ後に再実行）。試行回数を使い切ったら DLQ

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::dead_letter::DeadLetterQueue;
use super::handler::{HandlerOutcome, HandlerRegistry};
use crate::domain::{
    ClassifiedError, Disposition, DlqEntry, DlqReason, JobType, payload_recipient, sanitize_message_for,
};
use crate::error::PipelineError;
use crate::observability::{AlertLine, metric};
use crate::ports::Clock;
use crate::store::{ClaimedJob, JobLease, JobStore, NackOutcome, with_timeout};

/// claim した 1 ジョブの処理結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Skipped,
    Retrying {
        next_attempt: u32,
        available_at: DateTime<Utc>,
    },
    DeadLettered {
        reason: DlqReason,
        attempts: u32,
    },
}

impl ProcessOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Completed => "completed",
            ProcessOutcome::Skipped => "skipped",
            ProcessOutcome::Retrying { .. } => "retrying",
            ProcessOutcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// claim したジョブを処理する。`Arc` で共有して使う
pub struct Worker {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    dlq: Arc<DeadLetterQueue>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    next_type: AtomicUsize,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        dlq: Arc<DeadLetterQueue>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            dlq,
            clock,
            store_timeout,
            next_type: AtomicUsize::new(0),
        }
    }

    /// 登録済みの全ジョブ種別から期限の来たジョブを 1 つ claim する。
    /// 開始位置を呼び出しごとにずらし、混んだキューが他を飢えさせないようにする
    pub async fn claim_any(&self) -> Result<Option<JobLease>, PipelineError> {
        let types = self.registry.job_types();
        if types.is_empty() {
            return Ok(None);
        }
        let start = self.next_type.fetch_add(1, Ordering::Relaxed);
        for offset in 0..types.len() {
            let job_type = types[(start + offset) % types.len()];
            if let Some(lease) = self.claim(job_type).await? {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    pub async fn claim(&self, job_type: JobType) -> Result<Option<JobLease>, PipelineError> {
        Ok(with_timeout(self.store_timeout, self.store.claim_next(job_type)).await?)
    }

    /// `job_type` のジョブを 1 つ claim して処理する。期限の来たジョブがなければ `Ok(None)`
    pub async fn run_next(&self, job_type: JobType) -> Result<Option<ProcessOutcome>, PipelineError> {
        match self.claim(job_type).await? {
            Some(lease) => self.process(lease).await.map(Some),
            None => Ok(None),
        }
    }

    /// 期限の来たジョブがなくなるまで処理し、処理件数を返す
    pub async fn drain(&self) -> Result<usize, PipelineError> {
        let mut processed = 0;
        while let Some(lease) = self.claim_any().await? {
            self.process(lease).await?;
            processed += 1;
        }
        Ok(processed)
    }

    #[tracing::instrument(
        skip_all,
        fields(job_id = %lease.job.job_id, job_type = %lease.job.job_type, attempt = lease.job.attempt)
    )]
    pub async fn process(&self, lease: JobLease) -> Result<ProcessOutcome, PipelineError> {
        let job_type = lease.job.job_type;
        let handler = self
            .registry
            .get(job_type)
            .ok_or(PipelineError::HandlerNotFound(job_type))?;

        let outcome = match handler.handle(&lease.job).await {
            Ok(result) => {
                with_timeout(self.store_timeout, self.store.ack(&lease)).await?;
                match result {
                    HandlerOutcome::Effected { reference } => {
                        debug!(reference = ?reference, "job completed");
                        ProcessOutcome::Completed
                    }
                    HandlerOutcome::Skipped { reason } => {
                        info!(reason = %reason, "job completed without action");
                        ProcessOutcome::Skipped
                    }
                }
            }
            Err(err) => self.fail(&lease, err).await?,
        };

        metric::record_processed(job_type, outcome.as_str());
        Ok(outcome)
    }

    async fn fail(
        &self,
        lease: &JobLease,
        err: ClassifiedError,
    ) -> Result<ProcessOutcome, PipelineError> {
        let job = &lease.job;
        let message = sanitize_message_for(&err.to_string(), payload_recipient(&job.payload));

        match err.disposition() {
            Disposition::DeadLetter => {
                warn!(error_kind = err.kind(), error = %message, "permanent failure, not retrying");
                self.dead_letter(job, DlqReason::NonRetryableInput, &message, job.attempt)
                    .await;
                with_timeout(self.store_timeout, self.store.discard(lease, &message)).await?;
                Ok(ProcessOutcome::DeadLettered {
                    reason: DlqReason::NonRetryableInput,
                    attempts: job.attempt,
                })
            }
            Disposition::Retry => {
                let delay = job.backoff.next_delay(job.attempt);
                let nacked =
                    with_timeout(self.store_timeout, self.store.nack(lease, &message, delay)).await?;
                match nacked {
                    NackOutcome::Retrying {
                        next_attempt,
                        available_at,
                    } => {
                        warn!(
                            error_kind = err.kind(),
                            error = %message,
                            next_attempt,
                            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "attempt failed, retry scheduled"
                        );
                        metric::record_retry(job.job_type, err.kind());
                        Ok(ProcessOutcome::Retrying {
                            next_attempt,
                            available_at,
                        })
                    }
                    NackOutcome::Exhausted { attempts } => {
                        warn!(error_kind = err.kind(), error = %message, attempts, "retries exhausted");
                        self.dead_letter(job, DlqReason::RetriesExhausted, &message, attempts)
                            .await;
                        Ok(ProcessOutcome::DeadLettered {
                            reason: DlqReason::RetriesExhausted,
                            attempts,
                        })
                    }
                }
            }
        }
    }

    async fn dead_letter(&self, job: &ClaimedJob, reason: DlqReason, message: &str, attempts: u32) {
        let entry = DlqEntry::new(
            job.job_id.clone(),
            job.entity_id.clone(),
            job.job_type,
            reason,
            message,
            attempts,
            self.clock.now(),
        );
        let stored = self.dlq.push(&entry).await;

        AlertLine::new("dead_letter", entry.failed_at)
            .field("job_type", entry.job_type)
            .field("entity", &entry.entity_id)
            .field("job_id", &entry.job_id)
            .field("reason", entry.reason.as_str())
            .field("attempts", entry.attempts)
            .field("dlq_stored", stored)
            .field("error", &entry.error_message)
            .emit();
        metric::record_dead_letter(entry.job_type, reason);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

/// ワーカープールのハンドル
/// - 同時実行数は Semaphore で制限
/// - `request_shutdown()` で新規 claim を止め、実行中のジョブは最後まで走らせる
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl WorkerPool {
    pub fn spawn(worker: Arc<Worker>, settings: PoolSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        let join = tokio::spawn(dispatch_loop(
            worker,
            semaphore,
            settings.poll_interval,
            shutdown_rx,
        ));
        info!(concurrency = settings.concurrency, "worker pool started");
        Self {
            shutdown_tx,
            join,
            shutdown_grace: settings.shutdown_grace,
        }
    }

    pub fn request_shutdown(&self) {
        // 受信側はもう drop されているかもしれない
        let _ = self.shutdown_tx.send(true);
    }

    /// claim を止め、実行中のジョブを猶予期間まで待つ。
    /// 猶予を過ぎたジョブは abort し、リースはストア上で Active のまま残る
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let mut join = self.join;
        match tokio::time::timeout(self.shutdown_grace, &mut join).await {
            Ok(Ok(())) => info!("worker pool stopped"),
            Ok(Err(e)) => error!(error = %e, "worker pool task failed"),
            Err(_) => {
                warn!(grace = ?self.shutdown_grace, "worker pool did not stop in time, aborting");
                join.abort();
            }
        }
    }
}

async fn dispatch_loop(
    worker: Arc<Worker>,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let permit = tokio::select! {
            changed = shutdown_rx.changed() => match changed {
                Ok(()) => continue,
                Err(_) => break,
            },
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match worker.claim_any().await {
            Ok(Some(lease)) => {
                let worker = Arc::clone(&worker);
                in_flight.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = worker.process(lease).await {
                        error!(error = %e, "failed to settle job");
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                if !idle(&mut shutdown_rx, poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                warn!(error = %e, "failed to claim job");
                if !idle(&mut shutdown_rx, poll_interval).await {
                    break;
                }
            }
        }

        while let Some(done) = in_flight.try_join_next() {
            if let Err(e) = done {
                error!(error = %e, "job task panicked");
            }
        }
    }

    while let Some(done) = in_flight.join_next().await {
        if let Err(e) = done {
            error!(error = %e, "job task panicked");
        }
    }
}

/// `poll_interval` だけ、または停止要求まで待つ。プールのハンドルが drop 済みなら `false`
async fn idle(shutdown_rx: &mut watch::Receiver<bool>, poll_interval: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => changed.is_ok(),
        _ = tokio::time::sleep(poll_interval) => true,
    }
}
