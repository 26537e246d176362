use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter for provider retries.
///
/// Formula: min(max_delay, base * 2^attempt) * multiplier + random_jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
            attempt: 0,
        }
    }
}

impl ExponentialBackoff {
    /// Create a new ExponentialBackoff.
    ///
    /// `jitter_factor` is a fraction of the delay (0.0 to 1.0); negative values are clamped to 0.
    pub fn new(base: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max_delay,
            jitter_factor: jitter_factor.max(0.0),
            attempt: 0,
        }
    }

    /// Calculate the next delay and increment the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_scaled(1)
    }

    /// Like [`next_delay`](Self::next_delay), stretched by `multiplier` after capping.
    /// Used when the provider itself signals rate limiting.
    pub fn next_delay_scaled(&mut self, multiplier: u32) -> Duration {
        let exp_delay = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        let capped_delay = exp_delay.min(self.max_delay).saturating_mul(multiplier.max(1));

        let jitter_range = capped_delay.as_secs_f64() * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_secs = (capped_delay.as_secs_f64() + jitter).max(0.0);

        self.attempt = self.attempt.saturating_add(1);

        Duration::from_secs_f64(final_secs)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_increases_exponentially() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(60), 0.0);

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10), 0.0);
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_scaled_delay_for_rate_limiting() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10), 0.0);
        assert_eq!(backoff.next_delay_scaled(4), Duration::from_secs(4));
        assert_eq!(backoff.next_delay_scaled(0), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_reset_and_jitter_bounds() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60), 0.2);
        let secs = backoff.next_delay().as_secs_f64();
        assert!((8.0..=12.0).contains(&secs), "delay was {}", secs);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}
