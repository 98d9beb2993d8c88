//! Job types and typed payloads.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;

/// Kind of deferred side effect. Each kind has exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    EmailDelivery,
    PaymentCapture,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::EmailDelivery, JobType::PaymentCapture];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::EmailDelivery => "email_delivery",
            JobType::PaymentCapture => "payment_capture",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PipelineError::InvalidPayload(format!("unknown job type: {s}")))
    }
}

/// Why a job was enqueued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    /// Normal path: scheduled by business logic.
    #[default]
    Scheduled,
    /// Re-triggered by the sweep for an order that was never scheduled.
    Fallback,
    /// Re-triggered by the sweep for an order carrying a recovery flag.
    Recovery,
}

impl JobSource {
    pub fn as_str(self) -> &'static str {
        match self {
            JobSource::Scheduled => "scheduled",
            JobSource::Fallback => "fallback",
            JobSource::Recovery => "recovery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturePayload {
    pub order_id: String,
    pub payment_intent_id: String,
    #[serde(default)]
    pub source: JobSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    /// Business entity the email is about (usually an order id).
    pub entity_id: String,
    pub recipient: String,
    pub template: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub source: JobSource,
}

/// Tagged job payload.
///
/// Persisted as JSON with a `kind` discriminator matching [`JobType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    EmailDelivery(EmailPayload),
    PaymentCapture(CapturePayload),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::EmailDelivery(_) => JobType::EmailDelivery,
            JobPayload::PaymentCapture(_) => JobType::PaymentCapture,
        }
    }

    pub fn source(&self) -> JobSource {
        match self {
            JobPayload::EmailDelivery(p) => p.source,
            JobPayload::PaymentCapture(p) => p.source,
        }
    }

    /// Rejects payloads that no handler could ever act on.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let missing = match self {
            JobPayload::PaymentCapture(p) if p.order_id.trim().is_empty() => Some("order_id"),
            JobPayload::PaymentCapture(p) if p.payment_intent_id.trim().is_empty() => {
                Some("payment_intent_id")
            }
            JobPayload::EmailDelivery(p) if p.entity_id.trim().is_empty() => Some("entity_id"),
            JobPayload::EmailDelivery(p) if p.recipient.trim().is_empty() => Some("recipient"),
            JobPayload::EmailDelivery(p) if p.template.trim().is_empty() => Some("template"),
            _ => None,
        };
        match missing {
            Some(field) => Err(PipelineError::InvalidPayload(format!(
                "{} payload is missing {field}",
                self.job_type()
            ))),
            None => Ok(()),
        }
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
