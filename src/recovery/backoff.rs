//! Exponential backoff policy for step retries.

use std::time::Duration;

use rand::Rng;

use crate::config::RecoveryConfig;

/// Delay schedule between step attempts.
///
/// The delay before retry `n` (1-indexed) is
/// `min(initial_delay * backoff_factor^(n-1), max_delay)`, plus a uniform
/// random jitter in `[0, jitter_max_delay]` when jitter is enabled.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub max_retries: u32,
    pub jitter: bool,
    pub jitter_max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            backoff_factor: config.backoff_factor,
            max_retries: config.max_retries,
            jitter: config.jitter,
            jitter_max_delay: config.jitter_max_delay(),
        }
    }

    /// Base delay before the `retry`-th retry (1-indexed), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63);
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Full delay including jitter, as actually slept.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter && self.jitter_max_delay > Duration::ZERO {
            let jitter_ms = rand::rng().random_range(0..=self.jitter_max_delay.as_millis() as u64);
            base + Duration::from_millis(jitter_ms)
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_retries: 3,
            jitter,
            jitter_max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_exponential_schedule() {
        let policy = policy(false);
        assert_eq!(policy.base_delay(1), Duration::from_millis(10));
        assert_eq!(policy.base_delay(2), Duration::from_millis(20));
        assert_eq!(policy.base_delay(3), Duration::from_millis(40));
        assert_eq!(policy.base_delay(4), Duration::from_millis(80));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let policy = policy(false);
        assert_eq!(policy.base_delay(5), Duration::from_millis(100));
        assert_eq!(policy.base_delay(30), Duration::from_millis(100));
    }

    #[test]
    fn test_monotone_until_cap() {
        let policy = policy(false);
        let mut previous = Duration::ZERO;
        for retry in 1..=10 {
            let delay = policy.base_delay(retry);
            assert!(delay >= previous, "retry {retry}");
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = policy(true);
        for _ in 0..50 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(15));
        }
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let policy = policy(false);
        assert_eq!(policy.delay(2), Duration::from_millis(20));
    }

    #[test]
    fn test_defaults_from_config() {
        let policy = RetryPolicy::from_config(&RecoveryConfig::default());
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(300));
        assert_eq!(policy.max_retries, 5);
        assert!(policy.jitter);
    }
}
