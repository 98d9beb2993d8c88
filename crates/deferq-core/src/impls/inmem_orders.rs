//! In-memory order repository.
//!
//! Rows keep metadata as raw JSON, like a JSON column would, so the recovery
//! flag goes through the same encode/decode path a real database adapter uses.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::domain::{Order, OrderMetadata, OrderPaymentStatus, OrderStatus, RecoveryFlag};
use crate::error::RepositoryError;
use crate::ports::{OrderBatch, OrderFilter, OrderRepository};

#[derive(Debug, Clone)]
struct OrderRow {
    id: String,
    status: OrderStatus,
    payment_status: OrderPaymentStatus,
    payment_intent_id: Option<String>,
    created_at: DateTime<Utc>,
    metadata: Value,
}

impl OrderRow {
    fn encode(order: &Order) -> Result<Self, RepositoryError> {
        let metadata = order
            .metadata
            .to_json()
            .map_err(|e| corrupt(&order.id, &e))?;
        Ok(Self {
            id: order.id.clone(),
            status: order.status,
            payment_status: order.payment_status,
            payment_intent_id: order.payment_intent_id.clone(),
            created_at: order.created_at,
            metadata,
        })
    }

    fn decode(&self) -> Result<Order, RepositoryError> {
        let metadata =
            OrderMetadata::from_json(self.metadata.clone()).map_err(|e| corrupt(&self.id, &e))?;
        Ok(Order {
            id: self.id.clone(),
            status: self.status,
            payment_status: self.payment_status,
            payment_intent_id: self.payment_intent_id.clone(),
            created_at: self.created_at,
            metadata,
        })
    }

    /// `metadata -> 'recovery' ->> 'needs_recovery'`
    fn needs_recovery(&self) -> bool {
        self.metadata
            .pointer("/recovery/needs_recovery")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn matches(&self, filter: &OrderFilter) -> bool {
        filter.status.is_none_or(|s| self.status == s)
            && filter.payment_status.is_none_or(|s| self.payment_status == s)
            && filter.created_before.is_none_or(|t| self.created_at < t)
            && filter
                .needs_recovery
                .is_none_or(|flag| self.needs_recovery() == flag)
    }
}

fn corrupt(order_id: &str, err: &serde_json::Error) -> RepositoryError {
    RepositoryError::Corrupt {
        order_id: order_id.to_string(),
        message: err.to_string(),
    }
}

#[derive(Default)]
pub struct InMemoryOrderRepository {
    rows: RwLock<BTreeMap<String, OrderRow>>,
    unavailable: AtomicBool,
    stalled: AtomicBool,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an order.
    pub async fn insert(&self, order: Order) -> Result<(), RepositoryError> {
        let row = OrderRow::encode(&order)?;
        self.rows.write().await.insert(row.id.clone(), row);
        Ok(())
    }

    pub async fn update_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        payment_status: OrderPaymentStatus,
    ) -> Result<(), RepositoryError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(order_id)
            .ok_or_else(|| RepositoryError::NotFound(order_id.to_string()))?;
        row.status = status;
        row.payment_status = payment_status;
        Ok(())
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// While stalled, writes never complete (a locked row, a hung connection).
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    fn ensure_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RepositoryError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }

    async fn stall_if_set(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn query(&self, filter: &OrderFilter) -> Result<OrderBatch, RepositoryError> {
        self.ensure_available()?;
        let rows = self.rows.read().await;

        let mut matching: Vec<&OrderRow> = rows.values().filter(|r| r.matches(filter)).collect();
        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let mut batch = OrderBatch::default();
        for row in matching.into_iter().take(filter.limit.unwrap_or(usize::MAX)) {
            match row.decode() {
                Ok(order) => batch.orders.push(order),
                Err(e) => batch.corrupt.push(e),
            }
        }
        Ok(batch)
    }

    async fn get(&self, order_id: &str) -> Result<Option<Order>, RepositoryError> {
        self.ensure_available()?;
        self.rows
            .read()
            .await
            .get(order_id)
            .map(OrderRow::decode)
            .transpose()
    }

    async fn set_recovery_flag(
        &self,
        order_id: &str,
        flag: Option<RecoveryFlag>,
    ) -> Result<(), RepositoryError> {
        self.ensure_available()?;
        self.stall_if_set().await;
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(order_id)
            .ok_or_else(|| RepositoryError::NotFound(order_id.to_string()))?;

        let mut metadata =
            OrderMetadata::from_json(row.metadata.clone()).map_err(|e| corrupt(order_id, &e))?;
        metadata.recovery = flag;
        row.metadata = metadata.to_json().map_err(|e| corrupt(order_id, &e))?;
        Ok(())
    }

    async fn mark_payment_captured(&self, order_id: &str) -> Result<(), RepositoryError> {
        self.ensure_available()?;
        self.stall_if_set().await;
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(order_id)
            .ok_or_else(|| RepositoryError::NotFound(order_id.to_string()))?;
        row.payment_status = OrderPaymentStatus::Captured;
        Ok(())
    }
}
