//! App - アプリケーション層
//!
//! ports と store を組み合わせてパイプラインを実装する。
//!
//! # 主要コンポーネント
//! - **Enqueuer**: 遅延ジョブの登録。ストア障害時は注文に recovery flag を立てる
//! - **Worker / WorkerPool**: claim → handle → ack / nack / discard
//! - **DeadLetterQueue**: 恒久失敗ジョブの保管
//! - **ReconciliationSweep / SweepLoop**: 取りこぼしの検出と再実行
//! - **StatusService**: 運用向けビュー
//! - **PipelineBuilder**: ワイヤリングと起動時検証

pub mod builder;
pub mod dead_letter;
pub mod enqueuer;
pub mod handler;
pub mod reconcile;
pub mod status;
pub mod sweep_loop;
pub mod worker_loop;

pub use self::builder::{BuildError, Pipeline, PipelineBuilder};
pub use self::dead_letter::DeadLetterQueue;
pub use self::enqueuer::{Enqueuer, EnqueuerSettings, email_entity_key};
pub use self::handler::{CaptureHandler, EmailHandler, HandlerOutcome, HandlerRegistry, JobHandler};
pub use self::reconcile::{CandidateSource, ReconciliationSweep, SweepOutcome, SweepReport, SweepSettings};
pub use self::status::{QueueOverview, StatusService};
pub use self::sweep_loop::{SweepLoop, SweepLoopHandle};
pub use self::worker_loop::{PoolSettings, ProcessOutcome, Worker, WorkerPool};
