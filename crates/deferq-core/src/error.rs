use std::time::Duration;

use thiserror::Error;

use crate::domain::{ClassifiedError, JobType};

/// Errors returned by a Durable Job Store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("job store unavailable: {0}")]
    Unavailable(String),

    #[error("job store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("lease {lease_id} no longer owns job {job_id}")]
    LeaseLost { job_id: String, lease_id: String },

    #[error("job store serialization error: {0}")]
    Serialization(String),

    #[error("job store rejected request: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Connectivity-class failure (unreachable or too slow).
    ///
    /// Only this class of failure may set a recovery flag on an order.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Errors returned by order persistence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("order repository unavailable: {0}")]
    Unavailable(String),

    #[error("order not found: {0}")]
    NotFound(String),

    #[error("order {order_id} has corrupt metadata: {message}")]
    Corrupt { order_id: String, message: String },

    #[error("order repository call timed out after {0:?}")]
    Timeout(Duration),
}

impl RepositoryError {
    /// The order this error is about, when it concerns a single row.
    pub fn order_id(&self) -> Option<&str> {
        match self {
            RepositoryError::NotFound(id) => Some(id),
            RepositoryError::Corrupt { order_id, .. } => Some(order_id),
            RepositoryError::Unavailable(_) | RepositoryError::Timeout(_) => None,
        }
    }
}

/// Errors that propagate out of the pipeline to calling business logic.
///
/// Classified, expected failures (store outages at enqueue time, provider
/// errors inside a job, DLQ write failures) are handled inside the pipeline
/// and never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("payload of type {actual} submitted as {expected}")]
    PayloadMismatch { expected: JobType, actual: JobType },

    #[error("duplicate handler for job_type={0}")]
    DuplicateHandler(JobType),

    #[error("handler not found for job_type={0}")]
    HandlerNotFound(JobType),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("external service: {0}")]
    Service(#[from] ClassifiedError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}
