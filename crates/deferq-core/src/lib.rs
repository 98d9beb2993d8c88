//! deferq-core
//!
//! Delayed-action reliability pipeline: schedules time-delayed side effects
//! (payment capture after the modification window, transactional email) and
//! makes sure they eventually happen despite restarts, job-store outages and
//! transient provider failures.
//!
//! # Modules
//! - **domain**: value types (ids, job payloads, orders + recovery flag, DLQ entries, classified errors, PII masking)
//! - **ports**: seams to the outside world (`Clock`, lease ids, `PaymentGateway`, `EmailSender`, `OrderRepository`)
//! - **store**: the Durable Job Store contract, job state machine, retry policy and the in-memory store
//! - **app**: components (`Enqueuer`, `Worker`/`WorkerPool`, `DeadLetterQueue`, `ReconciliationSweep`, `SweepLoop`, `StatusService`) and the `PipelineBuilder`
//! - **impls**: in-memory / simulated adapters for the ports

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod store;

pub use app::{Pipeline, PipelineBuilder};
pub use config::PipelineConfig;
pub use error::{PipelineError, RepositoryError, StoreError};
