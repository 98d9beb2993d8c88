//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。外部システム（決済プロバイダ、メール
//! プロバイダ、注文 DB）と時刻・ID 生成を trait の裏に隠す。
//! ジョブストア自体の契約は `store` モジュールにある。

pub mod clock;
pub mod email;
pub mod id_generator;
pub mod orders;
pub mod payment;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::email::{EmailMessage, EmailSender, SentEmail};
pub use self::id_generator::{LeaseIdGenerator, UlidLeaseIds};
pub use self::orders::{OrderBatch, OrderFilter, OrderRepository, with_repo_timeout};
pub use self::payment::{PaymentGateway, PaymentIntent, PaymentIntentStatus};
