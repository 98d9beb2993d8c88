//! Failure classification for provider calls.
//!
//! Every failure raised inside a job handler is turned into a
//! [`ClassifiedError`] at the adapter boundary. The worker only looks at
//! [`ClassifiedError::disposition`] to decide between retrying and
//! dead-lettering.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

static PERMANENT_INPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)invalid[\s_`'"-]*(?:to[\s_`'"-]*field|e-?mail|recipient|address)|validation_error|not a valid e-?mail|recipient\b.*\b(?:rejected|blocked|suppressed|does not exist)"#,
    )
    .expect("permanent input pattern is valid")
});

static TIMEOUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)timed?[\s_-]*out|etimedout|deadline exceeded")
        .expect("timeout pattern is valid")
});

static NETWORK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)connection[\s_-]*(?:refused|reset|closed|aborted)|econn(?:refused|reset)|enotfound|eai_again|\bdns\b|socket hang up|network",
    )
    .expect("network pattern is valid")
});

/// What the worker does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Retry,
    DeadLetter,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifiedError {
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("provider error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("request rejected {status}: {message}")]
    ClientError { status: u16, message: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("unexpected error: {message}")]
    Unexpected { message: String },
}

impl ClassifiedError {
    /// Classifies a provider failure from its HTTP status (when there is one)
    /// and its message.
    ///
    /// 429 is rate limiting, other 4xx are permanent, 5xx are transient.
    /// Without a usable status the message decides; anything unrecognised is
    /// treated as transient.
    pub fn from_provider(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            Some(429) => ClassifiedError::RateLimited { message },
            Some(status @ 400..=499) => ClassifiedError::ClientError { status, message },
            Some(status @ 500..=599) => ClassifiedError::ServerError { status, message },
            _ => Self::from_message(message),
        }
    }

    fn from_message(message: String) -> Self {
        if PERMANENT_INPUT.is_match(&message) {
            ClassifiedError::InvalidInput { message }
        } else if TIMEOUT.is_match(&message) {
            ClassifiedError::Timeout { message }
        } else if NETWORK.is_match(&message) {
            ClassifiedError::Network { message }
        } else {
            ClassifiedError::Unexpected { message }
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        ClassifiedError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        ClassifiedError::Timeout {
            message: format!("no response within {after:?}"),
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            ClassifiedError::ClientError { .. } | ClassifiedError::InvalidInput { .. } => {
                Disposition::DeadLetter
            }
            _ => Disposition::Retry,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ClassifiedError::ServerError { status, .. }
            | ClassifiedError::ClientError { status, .. } => Some(*status),
            ClassifiedError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClassifiedError::RateLimited { .. } => "rate_limited",
            ClassifiedError::ServerError { .. } => "server_error",
            ClassifiedError::ClientError { .. } => "client_error",
            ClassifiedError::InvalidInput { .. } => "invalid_input",
            ClassifiedError::Network { .. } => "network",
            ClassifiedError::Timeout { .. } => "timeout",
            ClassifiedError::Unexpected { .. } => "unexpected",
        }
    }
}
