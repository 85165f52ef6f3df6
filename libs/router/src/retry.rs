//! Backoff policy for throttled sub-requests
//!
//! A throttled sub-request is resubmitted at most `max_attempts` times. The
//! delay before resubmission `n` (counting from zero) is `base * 2^n` plus a
//! jitter drawn from `[0, min(jitter, base * 2^n))`, so successive delays are
//! strictly increasing for any non-zero base while `n` stays within
//! [`MAX_RETRY_ATTEMPTS`].

use rand::Rng;
use router_config::{RetryConfig, MAX_RETRY_ATTEMPTS};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts,
            base,
            jitter,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_backoff(), config.jitter())
    }

    /// Whether a sub-request that was already resubmitted `attempts` times may
    /// be resubmitted again
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before resubmission `attempt`, without jitter
    ///
    /// Doubles for every attempt up to [`MAX_RETRY_ATTEMPTS`]; later attempts
    /// saturate, which `RouterConfig::validate` rules out.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    /// Delay before resubmission `attempt`, jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let bound = self.jitter.min(base);
        let bound_nanos = u64::try_from(bound.as_nanos()).unwrap_or(u64::MAX);
        if bound_nanos == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..bound_nanos);
        base.saturating_add(Duration::from_nanos(jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_attempt_bound() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::ZERO);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        let never = RetryPolicy::new(0, Duration::from_millis(10), Duration::ZERO);
        assert!(!never.should_retry(0));
    }

    #[test]
    fn test_delay_doubles_without_jitter() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::ZERO);
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_large_attempts_saturate() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1), Duration::ZERO);
        assert_eq!(policy.base_delay(40), Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn test_delays_keep_doubling_up_to_the_configured_bound() {
        let policy = RetryPolicy::new(MAX_RETRY_ATTEMPTS, Duration::from_millis(1), Duration::ZERO);
        for attempt in 1..MAX_RETRY_ATTEMPTS {
            assert_eq!(policy.base_delay(attempt), policy.base_delay(attempt - 1) * 2);
        }
    }

    proptest! {
        #[test]
        fn prop_delays_strictly_increase(
            base_ms in 1u64..1_000,
            jitter_ms in 0u64..5_000,
            attempt in 0u32..10,
        ) {
            let policy = RetryPolicy::new(
                10,
                Duration::from_millis(base_ms),
                Duration::from_millis(jitter_ms),
            );
            let now = policy.delay(attempt);
            let next = policy.delay(attempt + 1);
            prop_assert!(now >= policy.base_delay(attempt));
            prop_assert!(now < policy.base_delay(attempt + 1));
            prop_assert!(next > now);
        }
    }
}
