//! Retry backoff policy.
//!
//! `delay = min(base * 2^(retry_count - 1), max) + jitter`, where jitter is a
//! random fraction (up to `jitter`) of the capped delay. Jitter is applied
//! after the cap so jobs that all hit the cap still spread out.

use std::time::Duration;

use rand::Rng;

use reel_core::defaults;

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Cap for the exponential part.
    pub max: Duration,
    /// Maximum jitter as a fraction of the delay, in [0, 1].
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(defaults::BACKOFF_BASE_MS),
            max: Duration::from_millis(defaults::BACKOFF_MAX_MS),
            jitter: defaults::BACKOFF_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `REEL_BACKOFF_BASE_MS` | `2000` | Delay before the first retry |
    /// | `REEL_BACKOFF_MAX_MS` | `300000` | Cap for the exponential delay |
    /// | `REEL_BACKOFF_JITTER` | `0.25` | Max jitter fraction |
    pub fn from_env() -> Self {
        let base = std::env::var("REEL_BACKOFF_BASE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::BACKOFF_BASE_MS);

        let max = std::env::var("REEL_BACKOFF_MAX_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::BACKOFF_MAX_MS)
            .max(base);

        let jitter = std::env::var("REEL_BACKOFF_JITTER")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(defaults::BACKOFF_JITTER);

        Self::new(Duration::from_millis(base), Duration::from_millis(max)).with_jitter(jitter)
    }

    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: 0.0,
        }
    }

    /// Set the jitter fraction (clamped to [0, 1]).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Deterministic part of the delay before retry number `retry_count`
    /// (1 for the first retry).
    pub fn base_delay(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.saturating_sub(1).clamp(0, 31) as u32;
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay before retry number `retry_count`, jittered with `rng`.
    pub fn delay_with<R: Rng + ?Sized>(&self, retry_count: i32, rng: &mut R) -> Duration {
        let delay = self.base_delay(retry_count);
        if self.jitter <= 0.0 {
            return delay;
        }
        let fraction = rng.gen_range(0.0..=self.jitter);
        delay + delay.mul_f64(fraction)
    }

    /// Delay before retry number `retry_count`, jittered with the thread RNG.
    pub fn delay(&self, retry_count: i32) -> Duration {
        self.delay_with(retry_count, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_doubles_per_retry() {
        let policy = BackoffPolicy::new(ms(2000), ms(300_000));
        assert_eq!(policy.delay(1), ms(2000));
        assert_eq!(policy.delay(2), ms(4000));
        assert_eq!(policy.delay(3), ms(8000));
    }

    #[test]
    fn test_capped_at_max() {
        let policy = BackoffPolicy::new(ms(1000), ms(5000));
        assert_eq!(policy.delay(3), ms(4000));
        assert_eq!(policy.delay(4), ms(5000));
        assert_eq!(policy.delay(30), ms(5000));
        assert_eq!(policy.delay(i32::MAX), ms(5000));
    }

    #[test]
    fn test_non_positive_retry_uses_base() {
        let policy = BackoffPolicy::new(ms(100), ms(1000));
        assert_eq!(policy.delay(0), ms(100));
        assert_eq!(policy.delay(-3), ms(100));
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let policy = BackoffPolicy::new(ms(1000), ms(60_000)).with_jitter(0.25);
        let mut rng = StdRng::seed_from_u64(7);
        for retry in 1..=5 {
            let base = policy.base_delay(retry);
            for _ in 0..50 {
                let d = policy.delay_with(retry, &mut rng);
                assert!(d >= base);
                assert!(d <= base.mul_f64(1.25));
            }
        }
    }

    #[test]
    fn test_jittered_delays_still_increase() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        let first = policy.delay_with(1, &mut rng);
        let second = policy.delay_with(2, &mut rng);
        assert!(second > first);
    }

    #[test]
    fn test_jitter_is_clamped() {
        assert_eq!(BackoffPolicy::default().with_jitter(3.0).jitter, 1.0);
        assert_eq!(BackoffPolicy::default().with_jitter(-1.0).jitter, 0.0);
        assert_eq!(BackoffPolicy::default().with_jitter(f64::NAN).jitter, 0.0);
    }

    #[test]
    fn test_max_never_below_base() {
        let policy = BackoffPolicy::new(ms(5000), ms(10));
        assert_eq!(policy.max, ms(5000));
    }
}
