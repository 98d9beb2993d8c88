//! PipelineBuilder - パイプラインの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `build()` で設定値・必須コンポーネント・ハンドラ登録をまとめて検証する
//! - `expect_job_types()` で期待されるジョブ種別を宣言すると、未登録があれば BuildError

use std::sync::Arc;

use super::dead_letter::DeadLetterQueue;
use super::enqueuer::{Enqueuer, EnqueuerSettings};
use super::handler::{CaptureHandler, EmailHandler, HandlerRegistry, JobHandler};
use super::reconcile::{ReconciliationSweep, SweepReport, SweepSettings};
use super::status::StatusService;
use super::sweep_loop::{SweepLoop, SweepLoopHandle};
use super::worker_loop::{PoolSettings, Worker, WorkerPool};
use crate::config::{ConfigError, PipelineConfig};
use crate::domain::JobType;
use crate::error::PipelineError;
use crate::ports::{Clock, EmailSender, OrderRepository, PaymentGateway, SystemClock};
use crate::store::{JobStore, ListStore, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing component: {0}")]
    MissingComponent(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] PipelineError),

    #[error("Missing job types: {0:?}. These job types were expected but have no handler.")]
    MissingJobTypes(Vec<JobType>),
}

#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn JobStore>>,
    lists: Option<Arc<dyn ListStore>>,
    orders: Option<Arc<dyn OrderRepository>>,
    payments: Option<Arc<dyn PaymentGateway>>,
    email: Option<Arc<dyn EmailSender>>,
    handlers: Vec<Arc<dyn JobHandler>>,
    expected: Option<Vec<JobType>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// 省略時は [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// ジョブと DLQ を同じバックエンドに置く
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: JobStore + ListStore + 'static,
    {
        self.store = Some(store.clone());
        self.lists = Some(store);
        self
    }

    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn list_store(mut self, lists: Arc<dyn ListStore>) -> Self {
        self.lists = Some(lists);
        self
    }

    pub fn orders(mut self, orders: Arc<dyn OrderRepository>) -> Self {
        self.orders = Some(orders);
        self
    }

    /// 決済キャプチャのハンドラも登録する
    pub fn payments(mut self, payments: Arc<dyn PaymentGateway>) -> Self {
        self.payments = Some(payments);
        self
    }

    /// メール送信のハンドラも登録する
    pub fn email(mut self, sender: Arc<dyn EmailSender>) -> Self {
        self.email = Some(sender);
        self
    }

    /// 追加のハンドラを登録する。同じジョブ種別への二重登録は build 時にエラー
    pub fn handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn expect_job_types(mut self, job_types: &[JobType]) -> Self {
        self.expected = Some(job_types.to_vec());
        self
    }

    pub fn build(self) -> Result<Pipeline, BuildError> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self.store.ok_or(BuildError::MissingComponent("job store"))?;
        let lists = self.lists.ok_or(BuildError::MissingComponent("list store"))?;
        let orders = self
            .orders
            .ok_or(BuildError::MissingComponent("order repository"))?;
        let payments = self
            .payments
            .ok_or(BuildError::MissingComponent("payment gateway"))?;

        let store_timeout = config.timeouts.store();
        let service_timeout = config.timeouts.service();

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(CaptureHandler::new(
            payments.clone(),
            orders.clone(),
            service_timeout,
        )))?;
        if let Some(sender) = self.email {
            registry.register(Arc::new(EmailHandler::new(sender, service_timeout)))?;
        }
        for handler in self.handlers {
            registry.register(handler)?;
        }

        if let Some(expected) = &self.expected {
            let registered = registry.job_types();
            let missing: Vec<JobType> = expected
                .iter()
                .filter(|t| !registered.contains(t))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingJobTypes(missing));
            }
        }

        let dlq = Arc::new(DeadLetterQueue::new(
            lists,
            config.dlq.key_prefix.clone(),
            store_timeout,
        ));
        let enqueuer = Arc::new(Enqueuer::new(
            store.clone(),
            orders.clone(),
            clock.clone(),
            EnqueuerSettings {
                max_attempts: config.retry.max_attempts,
                backoff: RetryPolicy::from_config(&config.retry),
                capture_delay: config.capture.delay(),
                store_timeout,
            },
        ));
        let worker = Arc::new(Worker::new(
            store.clone(),
            Arc::new(registry),
            dlq.clone(),
            clock.clone(),
            store_timeout,
        ));
        let sweep = Arc::new(ReconciliationSweep::new(
            orders,
            payments,
            store.clone(),
            enqueuer.clone(),
            clock.clone(),
            SweepSettings {
                stale_after: config.stale_after(),
                batch_limit: config.sweep.batch_limit,
                store_timeout,
                service_timeout,
            },
        ));
        let sweep_loop = Arc::new(SweepLoop::new(
            sweep.clone(),
            clock,
            config.sweep.interval(),
            config.sweep.run_on_start,
        ));
        let status = StatusService::new(store, dlq.clone(), store_timeout);

        Ok(Pipeline {
            config,
            enqueuer,
            worker,
            dlq,
            sweep,
            sweep_loop,
            status,
        })
    }
}

/// ワイヤリング済みのパイプライン。バックグラウンドループは明示的に起動する
pub struct Pipeline {
    config: PipelineConfig,
    enqueuer: Arc<Enqueuer>,
    worker: Arc<Worker>,
    dlq: Arc<DeadLetterQueue>,
    sweep: Arc<ReconciliationSweep>,
    sweep_loop: Arc<SweepLoop>,
    status: StatusService,
}

impl Pipeline {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn enqueuer(&self) -> &Arc<Enqueuer> {
        &self.enqueuer
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn sweep(&self) -> &Arc<ReconciliationSweep> {
        &self.sweep
    }

    pub fn status(&self) -> &StatusService {
        &self.status
    }

    pub fn spawn_workers(&self) -> WorkerPool {
        WorkerPool::spawn(
            Arc::clone(&self.worker),
            PoolSettings {
                concurrency: self.config.worker.concurrency,
                poll_interval: self.config.worker.poll_interval(),
                shutdown_grace: self.config.worker.shutdown_grace(),
            },
        )
    }

    pub fn spawn_sweep_loop(&self) -> SweepLoopHandle {
        Arc::clone(&self.sweep_loop).spawn()
    }

    /// 手動 sweep。定期実行とは同じロックで直列化される
    pub async fn trigger_sweep(&self) -> SweepReport {
        self.sweep_loop.trigger_now().await
    }
}
