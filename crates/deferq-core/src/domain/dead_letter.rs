use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mask::sanitize_message;
use super::{JobId, JobType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    /// Transient failures until the attempt budget ran out.
    RetriesExhausted,
    /// Permanent input error. Dead-lettered on the first attempt.
    NonRetryableInput,
}

impl DlqReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DlqReason::RetriesExhausted => "retries_exhausted",
            DlqReason::NonRetryableInput => "non_retryable_input",
        }
    }
}

/// A permanently failed job, kept for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub job_id: JobId,
    pub entity_id: String,
    pub job_type: JobType,
    pub reason: DlqReason,
    /// Sanitized. Never carries a raw email address.
    pub error_message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn new(
        job_id: JobId,
        entity_id: impl Into<String>,
        job_type: JobType,
        reason: DlqReason,
        error_message: &str,
        attempts: u32,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            entity_id: entity_id.into(),
            job_type,
            reason,
            error_message: sanitize_message(error_message),
            attempts,
            failed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn entry_masks_error_message_and_serializes_flat() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let entry = DlqEntry::new(
            JobId::for_entity(JobType::EmailDelivery, "order_7:order_placed:ab12"),
            "order_7:order_placed:ab12",
            JobType::EmailDelivery,
            DlqReason::NonRetryableInput,
            "Invalid recipient bob.smith@example.com",
            1,
            at,
        );

        assert_eq!(
            entry.error_message,
            "Invalid recipient b*******@example.com"
        );
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["reason"], json!("non_retryable_input"));
        assert_eq!(value["job_type"], json!("email_delivery"));
        assert_eq!(value["attempts"], json!(1));
    }
}
