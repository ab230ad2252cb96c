//! Retry limits and exponential backoff

use std::time::Duration;

/// Bounded retry policy with exponential backoff
///
/// The delay after the n-th failed attempt is
/// `initial_delay_ms * backoff_multiplier^(n-1)`, capped at `max_delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Unbounded doubling backoff between `initial` and `max`
    ///
    /// Used for the receive side, which never gives up.
    pub fn unbounded(initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay_ms: duration_ms(initial),
            max_delay_ms: duration_ms(max),
            backoff_multiplier: 2.0,
        }
    }

    /// Delay to wait after `attempt` (1-based) has failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }

    #[test_case(1 => 1000 ; "first failure waits the initial delay")]
    #[test_case(2 => 2000 ; "second failure doubles")]
    #[test_case(3 => 4000 ; "third failure doubles again")]
    #[test_case(4 => 5000 ; "capped at max delay")]
    #[test_case(200 => 5000 ; "huge attempt numbers stay capped")]
    fn test_delay_for(attempt: u32) -> u64 {
        policy().delay_for(attempt).as_millis() as u64
    }

    #[test]
    fn test_attempt_limit() {
        let policy = policy();
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
        assert!(!RetryPolicy::no_retry().allows_another(1));
    }

    #[test]
    fn test_flat_multiplier() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_delay_ms: 5000,
            max_delay_ms: 5000,
            backoff_multiplier: 1.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
    }

    #[test]
    fn test_unbounded_receive_backoff() {
        let policy = RetryPolicy::unbounded(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
        assert!(policy.allows_another(1_000_000));
    }
}
