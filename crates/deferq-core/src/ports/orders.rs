//! Order persistence port.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Order, OrderPaymentStatus, OrderStatus, RecoveryFlag};
use crate::error::RepositoryError;

/// Query predicate, evaluated by the repository (never by fetching everything
/// and filtering in the caller).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<OrderPaymentStatus>,
    pub created_before: Option<DateTime<Utc>>,
    pub needs_recovery: Option<bool>,
    pub limit: Option<usize>,
}

impl OrderFilter {
    /// Pending + authorized orders created before `threshold`.
    pub fn awaiting_capture_before(threshold: DateTime<Utc>) -> Self {
        Self {
            status: Some(OrderStatus::Pending),
            payment_status: Some(OrderPaymentStatus::Authorized),
            created_before: Some(threshold),
            ..Self::default()
        }
    }

    /// Orders whose metadata carries `needs_recovery = true`, regardless of age.
    pub fn flagged_for_recovery() -> Self {
        Self {
            needs_recovery: Some(true),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, order: &Order) -> bool {
        self.status.is_none_or(|s| order.status == s)
            && self.payment_status.is_none_or(|s| order.payment_status == s)
            && self.created_before.is_none_or(|t| order.created_at < t)
            && self
                .needs_recovery
                .is_none_or(|flag| order.needs_recovery() == flag)
    }
}

/// Result of a query. Rows that matched but could not be decoded are
/// reported in `corrupt` instead of failing the whole query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBatch {
    pub orders: Vec<Order>,
    pub corrupt: Vec<RepositoryError>,
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Orders matching `filter`, oldest first, at most `filter.limit` rows
    /// (decoded and corrupt together).
    async fn query(&self, filter: &OrderFilter) -> Result<OrderBatch, RepositoryError>;

    async fn get(&self, order_id: &str) -> Result<Option<Order>, RepositoryError>;

    /// Writes (`Some`) or clears (`None`) the recovery flag, leaving the rest
    /// of the metadata untouched.
    async fn set_recovery_flag(
        &self,
        order_id: &str,
        flag: Option<RecoveryFlag>,
    ) -> Result<(), RepositoryError>;

    async fn mark_payment_captured(&self, order_id: &str) -> Result<(), RepositoryError>;
}

/// Bounds a repository call. Elapsed calls become [`RepositoryError::Timeout`].
pub async fn with_repo_timeout<T, F>(limit: Duration, call: F) -> Result<T, RepositoryError>
where
    F: Future<Output = Result<T, RepositoryError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RepositoryError::Timeout(limit)),
    }
}
