//! Reconnection backoff policy and connection state.
//!
//! ```text
//! Connecting ──► Open ──(error|close)──► ClosedRetrying{attempt, delay} ──► Connecting …
//!                                              │
//!                                              └──(give up)──► ClosedPermanently
//! ```
//!
//! Delay for failure number `attempt` (1-based):
//! `min(max_delay, base^(attempt-1) × 1s)`. A successful open resets
//! `attempt` to 1.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_RETRY_BASE, DEFAULT_RETRY_MAX, RETRY_UNIT};

/// Lifecycle of a reconnecting connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConnectionState {
    /// Attempting to connect.
    #[default]
    Connecting,
    /// Connected and ready.
    Open,
    /// Disconnected, waiting before the next attempt.
    ClosedRetrying {
        /// Consecutive failure count.
        attempt: u32,
        /// Milliseconds until next retry.
        next_retry_ms: u64,
    },
    /// No further attempts will be made.
    ClosedPermanently,
}

impl ConnectionState {
    /// Whether the connection is currently usable.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Whether to reconnect at all.
    pub retry: bool,
    /// Exponent base; `1.1` grows slowly, `2.0` doubles.
    pub base: f64,
    /// Cap on a single delay, in milliseconds.
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Retries allowed in a row; the failure after the last one is final.
    /// `None` retries forever at the capped delay.
    pub give_up_after: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retry: true,
            base: DEFAULT_RETRY_BASE,
            max_delay: DEFAULT_RETRY_MAX,
            give_up_after: None,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after failure number `attempt` (1-based).
    ///
    /// A `base` below 1 is treated as 1, so delays never shrink.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.base.max(1.0).powi(exponent.min(i32::MAX as u32) as i32);
        let millis = RETRY_UNIT.as_millis() as f64 * factor;
        let max_millis = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= max_millis {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}

/// Failure counter driving [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Fresh controller; the first failure yields the base delay.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 1 }
    }

    /// Record a failure and return how long to wait, or `None` to give up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.retry {
            return None;
        }
        if let Some(limit) = self.policy.give_up_after {
            if self.attempt > limit {
                return None;
            }
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Record a successful open.
    pub fn reset(&mut self) {
        self.attempt = 1;
    }

    /// Failure number the next call to [`Self::next_delay`] will report.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Active policy.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_delay_is_one_second() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_delays_are_monotonic_and_capped() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        let mut previous = Duration::ZERO;
        for _ in 0..200 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= previous, "{delay:?} < {previous:?}");
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(60));
    }

    #[test]
    fn test_base_1_1_growth() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(2), Duration::from_millis(1100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1210));
    }

    #[test]
    fn test_reset_returns_to_base_delay() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: 2.0,
            ..BackoffPolicy::default()
        });
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        backoff.reset();
        assert_eq!(backoff.attempt(), 1);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_give_up_after_limit() {
        let mut backoff = Backoff::new(BackoffPolicy {
            give_up_after: Some(2),
            ..BackoffPolicy::default()
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_no_retry_gives_up_immediately() {
        let mut backoff = Backoff::new(BackoffPolicy {
            retry: false,
            ..BackoffPolicy::default()
        });
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_base_below_one_holds_at_unit() {
        for base in [0.5, -2.0] {
            let policy = BackoffPolicy {
                base,
                ..BackoffPolicy::default()
            };
            assert_eq!(policy.delay_for(1), Duration::from_secs(1));
            assert_eq!(policy.delay_for(2), Duration::from_secs(1));
            assert_eq!(policy.delay_for(7), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_huge_attempt_saturates_at_cap() {
        let policy = BackoffPolicy {
            base: 10.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }
}
