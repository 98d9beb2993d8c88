//! Job state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Job state as reported by the store.
///
/// State transitions:
/// - Waiting -> Active -> Completed
/// - Delayed -> (due) -> Active
/// - Active -> Delayed (retry scheduled, attempts left)
/// - Active -> Failed (attempts exhausted)
/// - Active -> Discarded (permanent failure, no retry)
///
/// `Missing` is reported for ids the store has no record of (never enqueued,
/// or flushed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to run now.
    Waiting,

    /// Not due yet (initial delay or retry backoff).
    Delayed,

    /// Claimed by a worker.
    Active,

    Completed,

    /// Permanently failed without retrying.
    Discarded,

    /// Permanently failed after exhausting attempts.
    Failed,

    Missing,
}

impl JobState {
    pub const STORED: [JobState; 6] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Discarded,
        JobState::Failed,
    ];

    /// No further transitions. Re-enqueueing the same id replaces the record.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Discarded | JobState::Failed
        )
    }

    /// Scheduled or running: the action is already on its way.
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed | JobState::Active)
    }

    /// Ended without the side effect happening.
    pub fn is_failure(self) -> bool {
        matches!(self, JobState::Discarded | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
            JobState::Failed => "failed",
            JobState::Missing => "missing",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::waiting(JobState::Waiting, true, false)]
    #[case::delayed(JobState::Delayed, true, false)]
    #[case::active(JobState::Active, true, false)]
    #[case::completed(JobState::Completed, false, true)]
    #[case::discarded(JobState::Discarded, false, true)]
    #[case::failed(JobState::Failed, false, true)]
    #[case::missing(JobState::Missing, false, false)]
    fn classification(#[case] state: JobState, #[case] in_flight: bool, #[case] terminal: bool) {
        assert_eq!(state.is_in_flight(), in_flight);
        assert_eq!(state.is_terminal(), terminal);
    }
}
