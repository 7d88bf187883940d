//! Exponential backoff with proportional jitter.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff: `base × multiplier^attempt`, capped at `max`, then
/// scaled by a random factor in `[1 - jitter, 1 + jitter)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Fraction of the nominal delay to randomize by (0.5 = ±50%)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10),
            multiplier: 2.0,
            max: Duration::from_secs(1),
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let nanos = self.base.as_nanos() as f64 * factor;
        let capped = nanos.min(self.max.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }

    /// Inclusive lower and exclusive upper bound of [`BackoffPolicy::delay`].
    pub fn delay_range(&self, attempt: u32) -> (Duration, Duration) {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        (
            nominal.mul_f64(1.0 - jitter),
            nominal.mul_f64(1.0 + jitter),
        )
    }

    /// Delay for `attempt` given a uniform sample in `[0, 1)`.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 - jitter + 2.0 * jitter * sample.clamp(0.0, 1.0);
        nominal.mul_f64(factor)
    }

    /// Randomized delay for `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen::<f64>();
        self.delay_with_sample(attempt, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100))
    }

    #[test]
    fn test_nominal_delay_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.nominal_delay(0), Duration::from_millis(10));
        assert_eq!(p.nominal_delay(1), Duration::from_millis(20));
        assert_eq!(p.nominal_delay(3), Duration::from_millis(80));
        assert_eq!(p.nominal_delay(4), Duration::from_millis(100));
        assert_eq!(p.nominal_delay(1000), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_range_is_plus_minus_half() {
        let (low, high) = policy().delay_range(1);
        assert_eq!(low, Duration::from_millis(10));
        assert_eq!(high, Duration::from_millis(30));
    }

    #[test]
    fn test_delay_with_sample_endpoints() {
        let p = policy();
        assert_eq!(p.delay_with_sample(2, 0.0), Duration::from_millis(20));
        assert_eq!(p.delay_with_sample(2, 0.5), Duration::from_millis(40));
    }

    #[test]
    fn test_random_delay_stays_in_range() {
        let p = policy();
        for attempt in 0..8 {
            let (low, high) = p.delay_range(attempt);
            for _ in 0..50 {
                let d = p.delay(attempt);
                assert!(d >= low && d <= high, "attempt {}: {:?}", attempt, d);
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let p = BackoffPolicy {
            jitter: 0.0,
            ..policy()
        };
        assert_eq!(p.delay(2), Duration::from_millis(40));
    }
}
