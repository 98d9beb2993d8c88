//! Reconciliation sweep.
//!
//! Finds orders whose capture should have happened (stale) or could not be
//! scheduled (flagged for recovery), checks each against the payment provider
//! and the job store, and re-triggers the capture where nothing is in flight.
//!
//! Per order:
//! 1. re-read the order; not awaiting capture anymore -> clear flag, skip
//! 2. retrieve the intent; not capturable -> clear flag, skip
//! 3. look up the capture job
//!    - waiting / delayed / active -> skip (already on its way)
//!    - failed / discarded -> critical alert, skip (manual review)
//!    - missing / completed -> enqueue with no delay; clear flag only if that worked
//!
//! Rows that cannot be decoded or acted on count as per-order errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::enqueuer::Enqueuer;
use super::handler::with_service_timeout;
use crate::domain::{JobId, JobSource, JobType, Order};
use crate::error::{PipelineError, RepositoryError};
use crate::observability::{AlertLine, metric};
use crate::ports::clock::before;
use crate::ports::{Clock, OrderFilter, OrderRepository, PaymentGateway, with_repo_timeout};
use crate::store::{JobState, JobStore, with_timeout};

#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    /// Orders older than this are stale (capture delay + safety buffer).
    pub stale_after: Duration,
    pub batch_limit: usize,
    /// Bounds job store and order repository calls.
    pub store_timeout: Duration,
    pub service_timeout: Duration,
}

/// Why an order was picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Stale,
    Recovery,
    Both,
}

impl CandidateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateSource::Stale => "stale",
            CandidateSource::Recovery => "recovery",
            CandidateSource::Both => "both",
        }
    }

    fn merge(self, other: CandidateSource) -> CandidateSource {
        if self == other { self } else { CandidateSource::Both }
    }

    fn job_source(self) -> JobSource {
        match self {
            CandidateSource::Stale => JobSource::Fallback,
            CandidateSource::Recovery | CandidateSource::Both => JobSource::Recovery,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepOutcome {
    Completed,
    /// The job store did not answer the liveness check; nothing was touched.
    SkippedStoreUnavailable,
    /// Candidate queries failed.
    SkippedRepositoryUnavailable,
    /// A previous run was still going.
    SkippedOverlap,
}

impl SweepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            SweepOutcome::Completed => "completed",
            SweepOutcome::SkippedStoreUnavailable => "skipped_store_unavailable",
            SweepOutcome::SkippedRepositoryUnavailable => "skipped_repository_unavailable",
            SweepOutcome::SkippedOverlap => "skipped_overlap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub outcome: SweepOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub candidates: usize,
    /// Candidates found only by the staleness query.
    pub from_stale: usize,
    /// Candidates found only by the recovery-flag query.
    pub from_recovery: usize,
    pub from_both: usize,
    pub triggered: usize,
    pub skipped: usize,
    pub alerts: usize,
    /// Recovery flags cleared.
    pub recovered: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn empty(outcome: SweepOutcome, started_at: DateTime<Utc>) -> Self {
        Self {
            outcome,
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            candidates: 0,
            from_stale: 0,
            from_recovery: 0,
            from_both: 0,
            triggered: 0,
            skipped: 0,
            alerts: 0,
            recovered: 0,
            errors: 0,
        }
    }

    fn count_source(&mut self, source: CandidateSource) {
        self.candidates += 1;
        match source {
            CandidateSource::Stale => self.from_stale += 1,
            CandidateSource::Recovery => self.from_recovery += 1,
            CandidateSource::Both => self.from_both += 1,
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    order: Order,
    source: CandidateSource,
}

/// A matching row the repository could not decode.
#[derive(Debug, Clone)]
struct Unreadable {
    error: RepositoryError,
    source: CandidateSource,
}

#[derive(Debug, Default)]
struct Candidates {
    readable: Vec<Candidate>,
    unreadable: Vec<Unreadable>,
}

impl Candidates {
    fn add_order(&mut self, order: Order, source: CandidateSource) {
        match self.readable.iter_mut().find(|c| c.order.id == order.id) {
            Some(existing) => existing.source = existing.source.merge(source),
            None => self.readable.push(Candidate { order, source }),
        }
    }

    fn add_unreadable(&mut self, error: RepositoryError, source: CandidateSource) {
        let existing = self
            .unreadable
            .iter_mut()
            .find(|u| u.error.order_id().is_some() && u.error.order_id() == error.order_id());
        match existing {
            Some(existing) => existing.source = existing.source.merge(source),
            None => self.unreadable.push(Unreadable { error, source }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Triggered,
    Skipped(&'static str),
    Alerted,
    /// Enqueue was refused by the store; the order stays as it was.
    TriggerFailed,
    /// The order cannot be reconciled as it stands.
    Unprocessable(&'static str),
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Triggered => "triggered",
            Action::Skipped(_) => "skipped",
            Action::Alerted => "alerted",
            Action::TriggerFailed => "trigger_failed",
            Action::Unprocessable(_) => "error",
        }
    }
}

pub struct ReconciliationSweep {
    orders: Arc<dyn OrderRepository>,
    payments: Arc<dyn PaymentGateway>,
    store: Arc<dyn JobStore>,
    enqueuer: Arc<Enqueuer>,
    clock: Arc<dyn Clock>,
    settings: SweepSettings,
}

impl ReconciliationSweep {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        payments: Arc<dyn PaymentGateway>,
        store: Arc<dyn JobStore>,
        enqueuer: Arc<Enqueuer>,
        clock: Arc<dyn Clock>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            orders,
            payments,
            store,
            enqueuer,
            clock,
            settings,
        }
    }

    /// One full pass. Never fails: per-order errors are counted and logged,
    /// and the pass moves on.
    #[tracing::instrument(name = "reconciliation_sweep", skip_all)]
    pub async fn run_once(&self) -> SweepReport {
        let timer = Instant::now();
        let started_at = self.clock.now();
        let mut report = SweepReport::empty(SweepOutcome::Completed, started_at);

        if let Err(e) = with_timeout(self.settings.store_timeout, self.store.ping()).await {
            warn!(error = %e, "job store unreachable, skipping sweep");
            report.outcome = SweepOutcome::SkippedStoreUnavailable;
            return self.finish(report, timer);
        }

        let candidates = match self.collect_candidates(started_at).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "failed to query sweep candidates");
                report.outcome = SweepOutcome::SkippedRepositoryUnavailable;
                report.errors += 1;
                return self.finish(report, timer);
            }
        };

        for unreadable in &candidates.unreadable {
            report.count_source(unreadable.source);
            report.errors += 1;
            error!(
                order_id = unreadable.error.order_id().unwrap_or("unknown"),
                source = unreadable.source.as_str(),
                error = %unreadable.error,
                "unreadable order skipped"
            );
            metric::record_sweep_entity(unreadable.source.as_str(), "error");
        }

        for candidate in &candidates.readable {
            report.count_source(candidate.source);

            match self.reconcile(candidate).await {
                Ok((action, cleared)) => {
                    match action {
                        Action::Triggered => report.triggered += 1,
                        Action::Skipped(_) => report.skipped += 1,
                        Action::Alerted => report.alerts += 1,
                        Action::TriggerFailed | Action::Unprocessable(_) => report.errors += 1,
                    }
                    if cleared {
                        report.recovered += 1;
                    }
                    metric::record_sweep_entity(candidate.source.as_str(), action.as_str());
                }
                Err(e) => {
                    report.errors += 1;
                    error!(
                        order_id = %candidate.order.id,
                        source = candidate.source.as_str(),
                        error = %e,
                        "failed to reconcile order"
                    );
                    metric::record_sweep_entity(candidate.source.as_str(), "error");
                }
            }
        }

        self.finish(report, timer)
    }

    fn finish(&self, mut report: SweepReport, timer: Instant) -> SweepReport {
        let elapsed = timer.elapsed();
        report.finished_at = self.clock.now();
        report.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        info!(
            outcome = report.outcome.as_str(),
            candidates = report.candidates,
            from_stale = report.from_stale,
            from_recovery = report.from_recovery,
            from_both = report.from_both,
            triggered = report.triggered,
            skipped = report.skipped,
            alerts = report.alerts,
            recovered = report.recovered,
            errors = report.errors,
            duration_ms = report.duration_ms,
            "reconciliation sweep finished"
        );
        metric::record_sweep_run(report.outcome.as_str(), elapsed);
        report
    }

    /// Stale and flagged orders, de-duplicated, stale first.
    async fn collect_candidates(&self, now: DateTime<Utc>) -> Result<Candidates, RepositoryError> {
        let threshold = before(now, self.settings.stale_after);
        let limit = self.settings.batch_limit;
        let stale = with_repo_timeout(
            self.settings.store_timeout,
            self.orders
                .query(&OrderFilter::awaiting_capture_before(threshold).with_limit(limit)),
        )
        .await?;
        let flagged = with_repo_timeout(
            self.settings.store_timeout,
            self.orders
                .query(&OrderFilter::flagged_for_recovery().with_limit(limit)),
        )
        .await?;

        let mut candidates = Candidates::default();
        for (batch, source) in [(stale, CandidateSource::Stale), (flagged, CandidateSource::Recovery)] {
            for order in batch.orders {
                candidates.add_order(order, source);
            }
            for error in batch.corrupt {
                candidates.add_unreadable(error, source);
            }
        }
        Ok(candidates)
    }

    /// Returns the action taken and whether a recovery flag was cleared.
    async fn reconcile(&self, candidate: &Candidate) -> Result<(Action, bool), PipelineError> {
        let order_id = candidate.order.id.as_str();

        // state may have moved since the query
        let Some(order) =
            with_repo_timeout(self.settings.store_timeout, self.orders.get(order_id)).await?
        else {
            return Ok((Action::Skipped("order vanished"), false));
        };
        let flagged = order.needs_recovery();

        if !order.is_awaiting_capture() {
            let cleared = self.clear_flag_if_set(&order).await?;
            return Ok((Action::Skipped("order no longer awaiting capture"), cleared));
        }

        let Some(intent_id) = order.payment_intent_id.as_deref() else {
            error!(order_id, "authorized order has no payment intent");
            return Ok((Action::Unprocessable("no payment intent"), false));
        };

        let intent = with_service_timeout(
            self.settings.service_timeout,
            self.payments.retrieve(intent_id),
        )
        .await?;
        if !intent.status.is_capturable() {
            info!(order_id, payment_intent_id = intent_id, status = %intent.status, "payment not capturable");
            let cleared = self.clear_flag_if_set(&order).await?;
            return Ok((Action::Skipped("payment not capturable"), cleared));
        }

        let job_id = JobId::for_entity(JobType::PaymentCapture, order_id);
        let state = with_timeout(self.settings.store_timeout, self.store.get_state(&job_id)).await?;

        match state {
            JobState::Waiting | JobState::Delayed | JobState::Active => {
                info!(order_id, job_state = %state, "capture already in flight");
                Ok((Action::Skipped("capture in flight"), false))
            }
            JobState::Failed | JobState::Discarded => {
                AlertLine::new("sweep_failed_job", self.clock.now())
                    .field("severity", "critical")
                    .field("job_type", JobType::PaymentCapture)
                    .field("entity", order_id)
                    .field("job_id", &job_id)
                    .field("job_state", state)
                    .field("payment_intent", intent_id)
                    .field("action", "manual_review_required")
                    .emit();
                Ok((Action::Alerted, false))
            }
            JobState::Missing | JobState::Completed => {
                let source = if flagged {
                    JobSource::Recovery
                } else {
                    candidate.source.job_source()
                };
                let handle = self
                    .enqueuer
                    .schedule_capture_from(order_id, intent_id, Duration::ZERO, source)
                    .await?;
                if handle.is_none() {
                    warn!(order_id, "re-trigger not accepted, order left as is");
                    return Ok((Action::TriggerFailed, false));
                }
                info!(order_id, job_id = %job_id, source = source.as_str(), previous_state = %state, "capture re-triggered");
                let cleared = if flagged { self.clear_flag(order_id).await? } else { false };
                Ok((Action::Triggered, cleared))
            }
        }
    }

    async fn clear_flag_if_set(&self, order: &Order) -> Result<bool, RepositoryError> {
        if order.needs_recovery() {
            self.clear_flag(&order.id).await
        } else {
            Ok(false)
        }
    }

    async fn clear_flag(&self, order_id: &str) -> Result<bool, RepositoryError> {
        with_repo_timeout(
            self.settings.store_timeout,
            self.orders.set_recovery_flag(order_id, None),
        )
        .await?;
        info!(order_id, "recovery flag cleared");
        metric::record_recovery_flag("cleared");
        Ok(true)
    }
}
