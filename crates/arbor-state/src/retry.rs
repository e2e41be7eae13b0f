//! Bounded retry policy for compare-and-swap conflicts.
//!
//! Only lost CAS rounds are retried. Connectivity and query failures are
//! surfaced to the caller on the first occurrence.

use std::time::Duration;

/// Backoff schedule for re-running a transaction's update function after a
/// concurrent writer won the compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub struct CasRetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: u32,
}

impl Default for CasRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(250),
            factor: 2,
        }
    }
}

impl CasRetryPolicy {
    /// Single attempt, no retries. A lost round is reported immediately.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self
            .initial_delay
            .saturating_mul(self.factor.max(1).saturating_pow(exponent));
        scaled.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_then_caps() {
        let policy = CasRetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(5));
        assert_eq!(policy.delay_after(2), Duration::from_millis(10));
        assert_eq!(policy.delay_after(4), Duration::from_millis(40));
        assert_eq!(policy.delay_after(10), Duration::from_millis(250));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn no_retry_has_one_attempt() {
        assert_eq!(CasRetryPolicy::no_retry().max_attempts, 1);
    }
}
