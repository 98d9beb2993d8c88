//! Orders as seen by the pipeline, plus the recovery flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
    Canceled,
    Archived,
    RequiresAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPaymentStatus {
    NotPaid,
    Authorized,
    Captured,
    Canceled,
    Refunded,
}

/// Durable marker that an order's capture could not be scheduled.
///
/// Set only when the job store was unreachable at scheduling time. Cleared by
/// the sweep after it re-triggered the capture or confirmed nothing is left to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryFlag {
    pub needs_recovery: bool,
    pub recovery_reason: String,
    pub flagged_at: DateTime<Utc>,
}

impl RecoveryFlag {
    pub fn new(reason: impl Into<String>, flagged_at: DateTime<Utc>) -> Self {
        Self {
            needs_recovery: true,
            recovery_reason: reason.into(),
            flagged_at,
        }
    }
}

/// Order metadata.
///
/// The recovery flag is typed; everything else is kept as opaque JSON so that
/// writing the flag never drops keys owned by other parts of the system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryFlag>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OrderMetadata {
    pub fn needs_recovery(&self) -> bool {
        self.recovery.as_ref().is_some_and(|f| f.needs_recovery)
    }

    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::Null => Ok(Self::default()),
            other => serde_json::from_value(other),
        }
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    pub payment_status: OrderPaymentStatus,
    pub payment_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: OrderMetadata,
}

impl Order {
    /// Authorized but not captured, and not cancelled/completed.
    pub fn is_awaiting_capture(&self) -> bool {
        self.status == OrderStatus::Pending && self.payment_status == OrderPaymentStatus::Authorized
    }

    pub fn needs_recovery(&self) -> bool {
        self.metadata.needs_recovery()
    }
}
