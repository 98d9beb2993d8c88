//! End-to-end behaviour through `PipelineBuilder` with the in-memory store,
//! simulated providers and a manually advanced clock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use deferq_core::app::{ProcessOutcome, SweepOutcome};
use deferq_core::domain::{
    ClassifiedError, DlqReason, INVALID_EMAIL, JobId, JobType, Order, OrderMetadata,
    OrderPaymentStatus, OrderStatus, RecoveryFlag,
};
use deferq_core::error::StoreError;
use deferq_core::impls::{InMemoryOrderRepository, SimulatedEmailSender, SimulatedPaymentGateway};
use deferq_core::observability::QueueCounts;
use deferq_core::ports::{Clock, FixedClock, OrderRepository, PaymentIntentStatus};
use deferq_core::store::{
    EnqueueRequest, InMemoryJobStore, JobHandle, JobLease, JobSnapshot, JobState, JobStore,
    NackOutcome,
};
use deferq_core::{Pipeline, PipelineBuilder, PipelineConfig};

const HOUR: Duration = Duration::from_secs(3_600);

struct Harness {
    clock: Arc<FixedClock>,
    store: Arc<InMemoryJobStore>,
    orders: Arc<InMemoryOrderRepository>,
    payments: Arc<SimulatedPaymentGateway>,
    email: Arc<SimulatedEmailSender>,
    pipeline: Pipeline,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

fn harness() -> Harness {
    let clock = Arc::new(FixedClock::new(start()));
    let store = Arc::new(InMemoryJobStore::new(clock.clone()));
    harness_with(clock, store.clone(), |builder| builder.store(store))
}

fn harness_with(
    clock: Arc<FixedClock>,
    store: Arc<InMemoryJobStore>,
    wire_store: impl FnOnce(PipelineBuilder) -> PipelineBuilder,
) -> Harness {
    let orders = Arc::new(InMemoryOrderRepository::new());
    let payments = Arc::new(SimulatedPaymentGateway::new());
    let email = Arc::new(SimulatedEmailSender::new());
    let builder = PipelineBuilder::new(PipelineConfig::default())
        .clock(clock.clone())
        .orders(orders.clone())
        .payments(payments.clone())
        .email(email.clone())
        .expect_job_types(&JobType::ALL);
    let pipeline = wire_store(builder).build().unwrap();
    Harness {
        clock,
        store,
        orders,
        payments,
        email,
        pipeline,
    }
}

fn order(id: &str, intent: &str, created_at: DateTime<Utc>) -> Order {
    Order {
        id: id.into(),
        status: OrderStatus::Pending,
        payment_status: OrderPaymentStatus::Authorized,
        payment_intent_id: Some(intent.into()),
        created_at,
        metadata: OrderMetadata::default(),
    }
}

fn flagged(mut order: Order, at: DateTime<Utc>) -> Order {
    order.metadata.recovery = Some(RecoveryFlag::new("capture not scheduled", at));
    order
}

async fn capture_counts(h: &Harness) -> QueueCounts {
    h.store.counts(JobType::PaymentCapture).await.unwrap()
}

#[tokio::test]
async fn enqueueing_the_same_capture_twice_keeps_one_job() {
    let h = harness();
    let enqueuer = h.pipeline.enqueuer();

    let first = enqueuer
        .schedule_capture("order_1", "pi_1", HOUR)
        .await
        .unwrap()
        .unwrap();
    let second = enqueuer
        .schedule_capture("order_1", "pi_1", HOUR)
        .await
        .unwrap()
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.job_id, second.job_id);
    assert_eq!(first.job_id.as_str(), "payment_capture:order_1");
    assert_eq!(capture_counts(&h).await.total(), 1);
    assert_eq!(capture_counts(&h).await.delayed, 1);
}

#[tokio::test]
async fn transient_capture_failures_back_off_then_dead_letter() {
    let h = harness();
    h.payments
        .add_intent("pi_1", PaymentIntentStatus::RequiresCapture)
        .await;
    h.payments
        .fail_captures(
            "pi_1",
            (0..3).map(|_| ClassifiedError::from_provider(Some(503), "service unavailable")),
        )
        .await;
    h.pipeline
        .enqueuer()
        .schedule_capture("order_1", "pi_1", HOUR)
        .await
        .unwrap();
    let worker = h.pipeline.worker();

    // nothing is due during the modification window
    assert_eq!(worker.run_next(JobType::PaymentCapture).await.unwrap(), None);

    h.clock.advance(HOUR);
    let first = worker.run_next(JobType::PaymentCapture).await.unwrap();
    assert_eq!(
        first,
        Some(ProcessOutcome::Retrying {
            next_attempt: 2,
            available_at: h.clock.now() + chrono::Duration::seconds(1),
        })
    );
    assert_eq!(worker.run_next(JobType::PaymentCapture).await.unwrap(), None);

    h.clock.advance(Duration::from_secs(1));
    let second = worker.run_next(JobType::PaymentCapture).await.unwrap();
    assert_eq!(
        second,
        Some(ProcessOutcome::Retrying {
            next_attempt: 3,
            available_at: h.clock.now() + chrono::Duration::seconds(2),
        })
    );

    h.clock.advance(Duration::from_secs(1));
    assert_eq!(worker.run_next(JobType::PaymentCapture).await.unwrap(), None);

    h.clock.advance(Duration::from_secs(1));
    let third = worker.run_next(JobType::PaymentCapture).await.unwrap();
    assert_eq!(
        third,
        Some(ProcessOutcome::DeadLettered {
            reason: DlqReason::RetriesExhausted,
            attempts: 3,
        })
    );

    assert_eq!(h.payments.capture_calls("pi_1").await, 3);
    let entries = h
        .pipeline
        .status()
        .dead_letters(JobType::PaymentCapture, 0, 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 3);
    assert_eq!(entries[0].entity_id, "order_1");
    assert_eq!(entries[0].reason, DlqReason::RetriesExhausted);
    assert_eq!(
        h.store
            .get_state(&JobId::for_entity(JobType::PaymentCapture, "order_1"))
            .await
            .unwrap(),
        JobState::Failed
    );
}

#[tokio::test]
async fn malformed_recipient_goes_straight_to_the_dead_letter_queue() {
    let h = harness();
    let handle = h
        .pipeline
        .enqueuer()
        .enqueue_email("order_1", "order_confirmation", "not-an-email", json!({}))
        .await
        .unwrap()
        .unwrap();

    let outcome = h.pipeline.worker().run_next(JobType::EmailDelivery).await.unwrap();

    assert_eq!(
        outcome,
        Some(ProcessOutcome::DeadLettered {
            reason: DlqReason::NonRetryableInput,
            attempts: 1,
        })
    );
    assert_eq!(h.email.attempts_to("not-an-email").await, 1);
    assert_eq!(h.store.get_state(&handle.job_id).await.unwrap(), JobState::Discarded);

    let entries = h
        .pipeline
        .dead_letters()
        .list(JobType::EmailDelivery, 0, 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, DlqReason::NonRetryableInput);
    assert_eq!(entries[0].attempts, 1);
}

#[tokio::test]
async fn malformed_but_address_like_recipient_is_masked_everywhere() {
    let h = harness();
    h.pipeline
        .enqueuer()
        .enqueue_email("order_1", "order_confirmation", "john.doe@mailhost", json!({}))
        .await
        .unwrap()
        .unwrap();

    h.pipeline.worker().drain().await.unwrap();

    let entries = h
        .pipeline
        .dead_letters()
        .list(JobType::EmailDelivery, 0, 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].error_message.contains(INVALID_EMAIL));
    assert!(!entries[0].error_message.contains("john.doe@mailhost"));

    let jobs = h
        .pipeline
        .status()
        .jobs(JobType::EmailDelivery, None, 0, 10)
        .await
        .unwrap();
    let listed = serde_json::to_string(&jobs).unwrap();
    assert!(!listed.contains("john.doe@mailhost"));
    assert_eq!(jobs[0].payload["recipient"], json!(INVALID_EMAIL));
}

#[tokio::test]
async fn dead_letter_entries_never_carry_raw_addresses() {
    let h = harness();
    h.email
        .fail_sends(
            "john.doe@example.com",
            [ClassifiedError::from_provider(
                Some(422),
                "Recipient john.doe@example.com is on the suppression list",
            )],
        )
        .await;
    h.pipeline
        .enqueuer()
        .enqueue_email("order_1", "receipt", "john.doe@example.com", json!({"total": 42}))
        .await
        .unwrap();

    h.pipeline.worker().drain().await.unwrap();

    let entries = h
        .pipeline
        .dead_letters()
        .list(JobType::EmailDelivery, 0, 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].error_message.contains("j*******@example.com"));
    assert!(!entries[0].error_message.contains("john.doe@example.com"));
    assert!(!entries[0].entity_id.contains("john.doe"));
}

#[tokio::test]
async fn sweep_leaves_in_flight_jobs_alone() {
    let h = harness();
    let placed = h.clock.now();
    h.orders.insert(order("order_1", "pi_1", placed)).await.unwrap();
    h.payments
        .add_intent("pi_1", PaymentIntentStatus::RequiresCapture)
        .await;
    h.pipeline
        .enqueuer()
        .schedule_capture("order_1", "pi_1", HOUR)
        .await
        .unwrap();

    h.clock.advance(2 * HOUR);
    let _lease = h
        .pipeline
        .worker()
        .claim(JobType::PaymentCapture)
        .await
        .unwrap()
        .unwrap();

    let report = h.pipeline.trigger_sweep().await;

    assert_eq!(report.outcome, SweepOutcome::Completed);
    assert_eq!(report.candidates, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.triggered, 0);
    let counts = capture_counts(&h).await;
    assert_eq!(counts.active, 1);
    assert_eq!(counts.total(), 1);
}

#[tokio::test]
async fn sweep_triggers_missing_capture_and_clears_the_flag() {
    let h = harness();
    let placed = h.clock.now();
    h.orders
        .insert(flagged(order("order_1", "pi_1", placed), placed))
        .await
        .unwrap();
    h.payments
        .add_intent("pi_1", PaymentIntentStatus::RequiresCapture)
        .await;
    h.clock.advance(2 * HOUR);

    let report = h.pipeline.trigger_sweep().await;

    assert_eq!(report.triggered, 1);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.from_both, 1);
    assert_eq!(report.from_stale + report.from_recovery, 0);
    let stored = h.orders.get("order_1").await.unwrap().unwrap();
    assert!(!stored.needs_recovery());
    assert_eq!(capture_counts(&h).await.waiting, 1);

    assert_eq!(h.pipeline.worker().drain().await.unwrap(), 1);
    assert_eq!(h.payments.capture_calls("pi_1").await, 1);
    let stored = h.orders.get("order_1").await.unwrap().unwrap();
    assert_eq!(stored.payment_status, OrderPaymentStatus::Captured);

    // captured orders are no longer candidates
    let again = h.pipeline.trigger_sweep().await;
    assert_eq!(again.candidates, 0);
}

#[tokio::test]
async fn sweep_recovers_jobs_lost_in_a_flushed_store() {
    let h = harness();
    let placed = h.clock.now();
    h.orders.insert(order("order_1", "pi_1", placed)).await.unwrap();
    h.payments
        .add_intent("pi_1", PaymentIntentStatus::RequiresCapture)
        .await;
    h.pipeline
        .enqueuer()
        .schedule_capture("order_1", "pi_1", HOUR)
        .await
        .unwrap();

    h.store.flush().await;
    // within capture delay + safety buffer the order is not stale yet
    h.clock.advance(HOUR);
    assert_eq!(h.pipeline.trigger_sweep().await.candidates, 0);

    h.clock.advance(HOUR);
    let report = h.pipeline.trigger_sweep().await;
    assert_eq!(report.from_stale, 1);
    assert_eq!(report.triggered, 1);
    assert_eq!(h.pipeline.worker().drain().await.unwrap(), 1);
    assert_eq!(h.payments.status_of("pi_1").await, Some(PaymentIntentStatus::Succeeded));
}

#[tokio::test]
async fn outage_at_placement_is_repaired_by_the_sweep() {
    let h = harness();
    let placed = h.clock.now();
    h.orders.insert(order("order_1", "pi_1", placed)).await.unwrap();
    h.payments
        .add_intent("pi_1", PaymentIntentStatus::RequiresCapture)
        .await;

    h.store.set_available(false);
    let handle = h
        .pipeline
        .enqueuer()
        .schedule_capture("order_1", "pi_1", HOUR)
        .await
        .unwrap();
    assert!(handle.is_none());
    assert!(h.orders.get("order_1").await.unwrap().unwrap().needs_recovery());

    // still down: the run is skipped and the flag stays
    let skipped = h.pipeline.trigger_sweep().await;
    assert_eq!(skipped.outcome, SweepOutcome::SkippedStoreUnavailable);
    assert!(h.orders.get("order_1").await.unwrap().unwrap().needs_recovery());

    h.store.set_available(true);
    let report = h.pipeline.trigger_sweep().await;
    assert_eq!(report.from_recovery, 1);
    assert_eq!(report.triggered, 1);
    assert_eq!(report.recovered, 1);
    assert!(!h.orders.get("order_1").await.unwrap().unwrap().needs_recovery());

    h.pipeline.worker().drain().await.unwrap();
    assert_eq!(h.payments.capture_calls("pi_1").await, 1);
}

#[tokio::test]
async fn unreadable_order_does_not_stop_the_sweep() {
    let h = harness();
    let placed = h.clock.now();
    let mut broken = order("order_1", "pi_1", placed);
    broken
        .metadata
        .extra
        .insert("recovery".into(), json!({ "needs_recovery": true }));
    h.orders.insert(broken).await.unwrap();
    h.orders.insert(order("order_2", "pi_2", placed)).await.unwrap();
    h.payments
        .add_intent("pi_2", PaymentIntentStatus::RequiresCapture)
        .await;
    h.clock.advance(2 * HOUR);

    let report = h.pipeline.trigger_sweep().await;

    assert_eq!(report.outcome, SweepOutcome::Completed);
    assert_eq!(report.errors, 1);
    assert_eq!(report.triggered, 1);
    // the broken row matches both queries and is counted once
    assert_eq!(report.candidates, 2);
    assert_eq!(report.from_both, 1);
    assert_eq!(report.from_stale, 1);
    let order_2 = JobId::for_entity(JobType::PaymentCapture, "order_2");
    assert_eq!(h.store.get_state(&order_2).await.unwrap(), JobState::Waiting);
}

/// Answers pings and reads but refuses every write.
struct RejectingEnqueue(Arc<InMemoryJobStore>);

#[async_trait]
impl JobStore for RejectingEnqueue {
    async fn enqueue(&self, _request: EnqueueRequest) -> Result<JobHandle, StoreError> {
        Err(StoreError::Unavailable("READONLY replica".into()))
    }

    async fn claim_next(&self, job_type: JobType) -> Result<Option<JobLease>, StoreError> {
        self.0.claim_next(job_type).await
    }

    async fn ack(&self, lease: &JobLease) -> Result<(), StoreError> {
        self.0.ack(lease).await
    }

    async fn discard(&self, lease: &JobLease, error: &str) -> Result<(), StoreError> {
        self.0.discard(lease, error).await
    }

    async fn nack(
        &self,
        lease: &JobLease,
        error: &str,
        retry_after: Duration,
    ) -> Result<NackOutcome, StoreError> {
        self.0.nack(lease, error, retry_after).await
    }

    async fn get_state(&self, job_id: &JobId) -> Result<JobState, StoreError> {
        self.0.get_state(job_id).await
    }

    async fn list(
        &self,
        job_type: JobType,
        state: Option<JobState>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobSnapshot>, StoreError> {
        self.0.list(job_type, state, offset, limit).await
    }

    async fn counts(&self, job_type: JobType) -> Result<QueueCounts, StoreError> {
        self.0.counts(job_type).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.0.ping().await
    }
}

#[tokio::test]
async fn flag_survives_a_failed_re_trigger() {
    let clock = Arc::new(FixedClock::new(start()));
    let inner = Arc::new(InMemoryJobStore::new(clock.clone()));
    let rejecting = Arc::new(RejectingEnqueue(inner.clone()));
    let h = harness_with(clock, inner.clone(), |builder| {
        builder.job_store(rejecting).list_store(inner)
    });

    let placed = h.clock.now();
    h.orders
        .insert(flagged(order("order_1", "pi_1", placed), placed))
        .await
        .unwrap();
    h.payments
        .add_intent("pi_1", PaymentIntentStatus::RequiresCapture)
        .await;

    let report = h.pipeline.trigger_sweep().await;

    assert_eq!(report.outcome, SweepOutcome::Completed);
    assert_eq!(report.triggered, 0);
    assert_eq!(report.recovered, 0);
    assert_eq!(report.errors, 1);
    assert!(h.orders.get("order_1").await.unwrap().unwrap().needs_recovery());
    assert_eq!(capture_counts(&h).await.total(), 0);
}

#[tokio::test]
async fn sweep_does_not_retry_dead_lettered_captures() {
    let h = harness();
    let placed = h.clock.now();
    h.orders.insert(order("order_1", "pi_1", placed)).await.unwrap();
    h.payments
        .add_intent("pi_1", PaymentIntentStatus::RequiresCapture)
        .await;
    h.payments
        .fail_captures(
            "pi_1",
            [ClassifiedError::from_provider(Some(400), "card_declined")],
        )
        .await;
    h.pipeline
        .enqueuer()
        .schedule_capture("order_1", "pi_1", Duration::ZERO)
        .await
        .unwrap();
    h.pipeline.worker().drain().await.unwrap();

    h.clock.advance(2 * HOUR);
    let report = h.pipeline.trigger_sweep().await;

    assert_eq!(report.alerts, 1);
    assert_eq!(report.triggered, 0);
    assert_eq!(h.payments.capture_calls("pi_1").await, 1);
    assert_eq!(capture_counts(&h).await.discarded, 1);
}
