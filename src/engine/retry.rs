use std::time::Duration;

use rand::Rng;

/// Bounded retry for optimistic-conflict errors.
///
/// `max_attempts` counts the first try. The delay before retry `n` (1-based)
/// is `initial_delay * multiplier^(n-1)`, capped at `max_delay`, then scaled by
/// a random jitter factor in `[1 - jitter, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// 0.0 disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Fixed `delay` between attempts, no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16) as i32;
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=1.0)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_booking_contention_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts(), 3);
        let d = p.delay_for_retry(1);
        assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
    }

    #[test]
    fn fixed_policy_has_constant_delay() {
        let p = RetryPolicy::fixed(5, Duration::from_millis(10));
        assert_eq!(p.delay_for_retry(1), Duration::from_millis(10));
        assert_eq!(p.delay_for_retry(4), Duration::from_millis(10));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let p = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(p.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(p.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(p.delay_for_retry(9), Duration::from_millis(400));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts(), 1);
    }
}
