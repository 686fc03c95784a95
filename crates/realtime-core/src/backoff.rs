//! Exponential backoff with jitter for join retries.

use rand::Rng;
use std::time::Duration;

/// Retry delay policy.
///
/// The delay before retry `attempt` (1-based) is
/// `min(max, base * multiplier^(attempt - 1))`, then scaled by a random factor
/// in `1 ± jitter`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Relative jitter, `0.0..=1.0`.
    pub jitter: f64,
}

impl Backoff {
    /// Default jitter applied to every delay.
    pub const DEFAULT_JITTER: f64 = 0.25;

    #[must_use]
    pub fn new(base: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            base,
            max,
            multiplier,
            jitter: Self::DEFAULT_JITTER,
        }
    }

    /// Replace the jitter factor.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before `attempt`, without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            self.max
        }
    }

    /// Delay before `attempt`, with jitter applied.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.base_delay(1), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(4), Duration::from_secs(8));
        assert_eq!(backoff.base_delay(10), Duration::from_secs(30));
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = Backoff::default();
        for _ in 0..200 {
            let delay = backoff.delay(3);
            assert!(delay >= Duration::from_secs(3));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_without_jitter() {
        let backoff = Backoff::default().with_jitter(0.0);
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
    }
}
