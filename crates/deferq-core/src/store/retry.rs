//! Retry policy: decides backoff delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;

/// Exponential backoff, attached to each job at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,

    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 1s, 2s, 4s, ...
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
        }
    }

    /// Delay after the `attempts`-th failed attempt (1-indexed):
    /// `base_delay * multiplier^(attempts - 1)`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_policy_doubles_from_one_second() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn zero_attempts_uses_base_delay() {
        assert_eq!(RetryPolicy::default().next_delay(0), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        assert_eq!(RetryPolicy::default().next_delay(u32::MAX), Duration::MAX);
    }

    proptest! {
        #[test]
        fn delays_never_shrink(attempts in 1u32..40) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.next_delay(attempts + 1) >= policy.next_delay(attempts));
        }
    }
}
