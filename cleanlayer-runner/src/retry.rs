//! Exponential backoff for chunk retries.

use std::time::Duration;

/// Retry schedule: an initial attempt plus up to `max_retries` retries, the
/// n-th retry (0-based) waiting `base * 2^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_retries: 3,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self { base, max_retries }
    }

    /// Delay before retry number `retry` (0-based). Saturates instead of
    /// overflowing.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Upper bound on attempts for one unit of work.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double() {
        let b = Backoff::default();
        assert_eq!(b.delay_for(0), Duration::from_millis(500));
        assert_eq!(b.delay_for(1), Duration::from_millis(1000));
        assert_eq!(b.delay_for(2), Duration::from_millis(2000));
    }

    #[test]
    fn huge_retry_saturates() {
        let b = Backoff::new(Duration::from_secs(1), 3);
        assert!(b.delay_for(64) >= Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn retry_budget() {
        let b = Backoff::new(Duration::ZERO, 2);
        assert!(b.should_retry(0));
        assert!(b.should_retry(1));
        assert!(!b.should_retry(2));
        assert_eq!(b.max_attempts(), 3);

        let none = Backoff::new(Duration::ZERO, 0);
        assert!(!none.should_retry(0));
    }
}
