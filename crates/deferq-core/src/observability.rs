//! Counts, metrics and alert lines.
//!
//! Metrics go through the `metrics` facade; with no recorder installed they
//! are no-ops. Alert lines are emitted as `ERROR` events on [`ALERT_TARGET`]
//! so log routing can page on them.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::store::JobState;

/// tracing target for operator alerts.
pub const ALERT_TARGET: &str = "deferq_core::alert";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub discarded: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Delayed => self.delayed += 1,
            JobState::Active => self.active += 1,
            JobState::Completed => self.completed += 1,
            JobState::Discarded => self.discarded += 1,
            JobState::Failed => self.failed += 1,
            JobState::Missing => {}
        }
    }

    pub fn total(&self) -> usize {
        self.waiting + self.delayed + self.active + self.completed + self.discarded + self.failed
    }
}

pub mod metric {
    //! Metric names and recording helpers.

    use crate::domain::{DlqReason, JobSource, JobType};

    pub const JOBS_ENQUEUED: &str = "deferq_jobs_enqueued_total";
    pub const JOBS_PROCESSED: &str = "deferq_jobs_processed_total";
    pub const JOB_RETRIES: &str = "deferq_job_retries_total";
    pub const DEAD_LETTERS: &str = "deferq_dead_letters_total";
    pub const DLQ_WRITE_FAILURES: &str = "deferq_dlq_write_failures_total";
    pub const RECOVERY_FLAGS: &str = "deferq_recovery_flags_total";
    pub const SWEEP_RUNS: &str = "deferq_sweep_runs_total";
    pub const SWEEP_ENTITIES: &str = "deferq_sweep_entities_total";
    pub const SWEEP_DURATION: &str = "deferq_sweep_duration_seconds";

    /// `outcome`: created | duplicate | failed
    pub fn record_enqueue(job_type: JobType, source: JobSource, outcome: &'static str) {
        metrics::counter!(
            JOBS_ENQUEUED,
            "job_type" => job_type.as_str(),
            "source" => source.as_str(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// `outcome`: completed | skipped | retrying | dead_lettered
    pub fn record_processed(job_type: JobType, outcome: &'static str) {
        metrics::counter!(JOBS_PROCESSED, "job_type" => job_type.as_str(), "outcome" => outcome)
            .increment(1);
    }

    pub fn record_retry(job_type: JobType, error_kind: &'static str) {
        metrics::counter!(JOB_RETRIES, "job_type" => job_type.as_str(), "error_kind" => error_kind)
            .increment(1);
    }

    pub fn record_dead_letter(job_type: JobType, reason: DlqReason) {
        metrics::counter!(DEAD_LETTERS, "job_type" => job_type.as_str(), "reason" => reason.as_str())
            .increment(1);
    }

    pub fn record_dlq_write_failure(job_type: JobType) {
        metrics::counter!(DLQ_WRITE_FAILURES, "job_type" => job_type.as_str()).increment(1);
    }

    /// `action`: set | cleared
    pub fn record_recovery_flag(action: &'static str) {
        metrics::counter!(RECOVERY_FLAGS, "action" => action).increment(1);
    }

    pub fn record_sweep_run(outcome: &'static str, duration: std::time::Duration) {
        metrics::counter!(SWEEP_RUNS, "outcome" => outcome).increment(1);
        metrics::histogram!(SWEEP_DURATION).record(duration.as_secs_f64());
    }

    pub fn record_sweep_entity(source: &'static str, action: &'static str) {
        metrics::counter!(SWEEP_ENTITIES, "source" => source, "action" => action).increment(1);
    }
}

/// One-line, grep-able alert:
/// `ALERT kind=dead_letter job_type=email_delivery ... error="..." at=2026-01-01T00:00:00Z`
///
/// Values containing whitespace, quotes or `=` are quoted. Callers pass
/// already-masked values.
#[derive(Debug, Clone)]
pub struct AlertLine {
    kind: &'static str,
    fields: Vec<(&'static str, String)>,
    at: DateTime<Utc>,
}

impl AlertLine {
    pub fn new(kind: &'static str, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            fields: Vec::new(),
            at,
        }
    }

    pub fn field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn emit(&self) {
        tracing::error!(target: ALERT_TARGET, alert = self.kind, "{self}");
    }
}

impl fmt::Display for AlertLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ALERT kind={}", self.kind)?;
        for (key, value) in &self.fields {
            write!(f, " {key}={}", quote_if_needed(value))?;
        }
        write!(f, " at={}", self.at.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

fn quote_if_needed(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '=' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn counts_tally_by_state() {
        let mut counts = QueueCounts::default();
        for state in [
            JobState::Waiting,
            JobState::Delayed,
            JobState::Delayed,
            JobState::Failed,
            JobState::Missing,
        ] {
            counts.add(state);
        }

        assert_eq!(counts.delayed, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn alert_line_is_single_line_and_quotes_free_text() {
        let at = Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap();
        let line = AlertLine::new("dead_letter", at)
            .field("job_type", "email_delivery")
            .field("attempts", 3)
            .field("error", "provider error 503: \"busy\"\nretry later")
            .to_string();

        assert_eq!(
            line,
            "ALERT kind=dead_letter job_type=email_delivery attempts=3 \
             error=\"provider error 503: \\\"busy\\\"\\nretry later\" at=2026-02-03T04:05:06Z"
        );
        assert!(!line.contains('\n'));
    }

    #[test]
    fn empty_values_are_quoted() {
        let at = Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap();
        let line = AlertLine::new("x", at).field("reason", "").to_string();
        assert!(line.contains("reason=\"\""));
    }
}
