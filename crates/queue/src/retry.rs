//! Retry backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Longest delay any backoff policy will produce.
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600 * 24);

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackoffKind {
    /// `delay * 2^(attempt - 1)`.
    Exponential,
    /// Same delay for every attempt.
    Fixed,
}

/// Retry backoff carried in a job's options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    pub delay: u64,
}

impl Backoff {
    /// Exponential backoff with the given base delay.
    #[must_use]
    pub const fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: delay_ms,
        }
    }

    /// Fixed backoff with the given delay.
    #[must_use]
    pub const fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay: delay_ms,
        }
    }

    /// Delay before the next attempt after `attempts_made` failed attempts (1-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        let base = Duration::from_millis(self.delay);
        let delay = match self.kind {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exponent).unwrap_or(MAX_BACKOFF)
            }
        };

        delay.min(MAX_BACKOFF)
    }
}

/// Whether another attempt is allowed after `attempts_made` attempts.
#[must_use]
pub const fn should_retry(attempts_made: u32, max_attempts: u32) -> bool {
    attempts_made < max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::exponential(3000);

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(3000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(6000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(12000));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(24000));
    }

    #[test]
    fn test_first_attempt_never_underflows() {
        let backoff = Backoff::exponential(1000);
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(1000));
    }

    #[test]
    fn test_max_delay() {
        let backoff = Backoff::exponential(3_600_000);
        assert_eq!(backoff.delay_for_attempt(40), MAX_BACKOFF);
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::fixed(2000);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(7), Duration::from_millis(2000));
    }

    #[test]
    fn test_should_retry() {
        assert!(should_retry(0, 3));
        assert!(should_retry(2, 3));
        assert!(!should_retry(3, 3));
        assert!(!should_retry(4, 3));
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(Backoff::exponential(3000)).unwrap_or_default();
        assert_eq!(json, serde_json::json!({"type": "exponential", "delay": 3000}));
    }
}
