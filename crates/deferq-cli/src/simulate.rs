//! In-memory wiring for `simulate` and `sweep`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use deferq_core::app::{QueueOverview, SweepReport};
use deferq_core::domain::{
    ClassifiedError, DlqEntry, JobType, Order, OrderMetadata, OrderPaymentStatus, OrderStatus,
    RecoveryFlag,
};
use deferq_core::impls::{InMemoryOrderRepository, SimulatedEmailSender, SimulatedPaymentGateway};
use deferq_core::ports::{Clock, PaymentIntentStatus, SystemClock};
use deferq_core::store::InMemoryJobStore;
use deferq_core::{Pipeline, PipelineBuilder, PipelineConfig};

pub struct Scenario {
    pub orders: usize,
    pub permanent_failures: usize,
    pub transient_failures: usize,
    pub run_for: Duration,
}

#[derive(Serialize)]
pub struct SimulationReport {
    pub orders_placed: usize,
    pub captures_scheduled: usize,
    pub emails_scheduled: usize,
    pub overview: Vec<QueueOverview>,
    pub dead_letters: Vec<DlqEntry>,
}

#[derive(Serialize)]
pub struct SweepRunReport {
    pub sweep: SweepReport,
    pub overview: Vec<QueueOverview>,
}

struct World {
    orders: Arc<InMemoryOrderRepository>,
    payments: Arc<SimulatedPaymentGateway>,
    pipeline: Pipeline,
}

fn wire(config: PipelineConfig) -> Result<World> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryJobStore::new(clock.clone()));
    let orders = Arc::new(InMemoryOrderRepository::new());
    let payments = Arc::new(SimulatedPaymentGateway::new());
    let pipeline = PipelineBuilder::new(config)
        .clock(clock)
        .store(store)
        .orders(orders.clone())
        .payments(payments.clone())
        .email(Arc::new(SimulatedEmailSender::new()))
        .expect_job_types(&JobType::ALL)
        .build()?;
    Ok(World {
        orders,
        payments,
        pipeline,
    })
}

fn authorized_order(index: usize, created_at: chrono::DateTime<Utc>) -> Order {
    Order {
        id: format!("order_{index:04}"),
        status: OrderStatus::Pending,
        payment_status: OrderPaymentStatus::Authorized,
        payment_intent_id: Some(format!("pi_{index:04}")),
        created_at,
        metadata: OrderMetadata::default(),
    }
}

async fn collect(pipeline: &Pipeline) -> Result<(Vec<QueueOverview>, Vec<DlqEntry>)> {
    let status = pipeline.status();
    let overview = status.overview().await?;
    let mut dead_letters = Vec::new();
    for job_type in JobType::ALL {
        dead_letters.extend(status.dead_letters(job_type, 0, 1_000).await?);
    }
    Ok((overview, dead_letters))
}

/// Places `scenario.orders` orders, each scheduling a capture and a
/// confirmation email. The first `permanent_failures` are declined and use a
/// malformed address; the next `transient_failures` see two provider outages
/// before their capture goes through.
pub async fn run_simulation(config: PipelineConfig, scenario: Scenario) -> Result<SimulationReport> {
    let world = wire(config)?;
    let enqueuer = world.pipeline.enqueuer();

    let mut captures_scheduled = 0;
    let mut emails_scheduled = 0;
    for index in 0..scenario.orders {
        let order = authorized_order(index, Utc::now());
        let intent = order.payment_intent_id.clone().unwrap_or_default();
        world
            .payments
            .add_intent(&intent, PaymentIntentStatus::RequiresCapture)
            .await;

        let declined = index < scenario.permanent_failures;
        let flaky = !declined && index < scenario.permanent_failures + scenario.transient_failures;
        if declined {
            world
                .payments
                .fail_captures(
                    &intent,
                    [ClassifiedError::from_provider(Some(402), "Your card was declined.")],
                )
                .await;
        } else if flaky {
            world
                .payments
                .fail_captures(
                    &intent,
                    (0..2).map(|_| ClassifiedError::from_provider(Some(503), "Service Unavailable")),
                )
                .await;
        }
        world.orders.insert(order.clone()).await?;

        if enqueuer
            .schedule_capture(&order.id, &intent, enqueuer.capture_delay())
            .await?
            .is_some()
        {
            captures_scheduled += 1;
        }

        let recipient = if declined {
            format!("customer{index}-at-example.com")
        } else {
            format!("customer{index}@example.com")
        };
        if enqueuer
            .enqueue_email(
                &order.id,
                "order_confirmation",
                &recipient,
                json!({ "order_id": order.id }),
            )
            .await?
            .is_some()
        {
            emails_scheduled += 1;
        }
    }
    info!(orders = scenario.orders, captures_scheduled, emails_scheduled, "orders placed");

    let pool = world.pipeline.spawn_workers();
    let sweeps = world.pipeline.spawn_sweep_loop();
    tokio::select! {
        _ = tokio::time::sleep(scenario.run_for) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("interrupted, shutting down");
        }
    }
    pool.shutdown_and_join().await;
    sweeps.shutdown_and_join().await;

    let (overview, dead_letters) = collect(&world.pipeline).await?;
    Ok(SimulationReport {
        orders_placed: scenario.orders,
        captures_scheduled,
        emails_scheduled,
        overview,
        dead_letters,
    })
}

/// `stale` orders placed well before the staleness threshold and `flagged`
/// fresh orders with a recovery flag, none of them with a job.
pub async fn run_sweep(config: PipelineConfig, stale: usize, flagged: usize) -> Result<SweepRunReport> {
    let stale_after = config.stale_after();
    let world = wire(config)?;
    let now = Utc::now();
    let placed_before = now
        - chrono::Duration::from_std(stale_after)?
        - chrono::Duration::minutes(1);

    for index in 0..stale + flagged {
        let order = if index < stale {
            authorized_order(index, placed_before)
        } else {
            let mut order = authorized_order(index, now);
            order.metadata.recovery = Some(RecoveryFlag::new("capture not scheduled: seeded", now));
            order
        };
        if let Some(intent) = order.payment_intent_id.as_deref() {
            world
                .payments
                .add_intent(intent, PaymentIntentStatus::RequiresCapture)
                .await;
        }
        world.orders.insert(order).await?;
    }

    let sweep = world.pipeline.trigger_sweep().await;
    let (overview, _) = collect(&world.pipeline).await?;
    Ok(SweepRunReport { sweep, overview })
}
