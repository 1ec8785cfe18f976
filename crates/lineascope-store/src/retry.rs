//! Bounded exponential backoff for transient failures.

use std::time::Duration;

use rand::random;

/// Delay schedule: `initial * multiplier^attempt`, jittered, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = (base * jitter_factor).max(0.0);
        let clamped = jittered.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(5)
        };
        let d0 = policy.delay_for_attempt(0);
        let d1 = policy.delay_for_attempt(1);
        let d2 = policy.delay_for_attempt(2);
        assert!(d0 < d1 && d1 < d2);

        let huge = policy.delay_for_attempt(30);
        assert_eq!(huge, policy.max_delay);
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy::exponential(3);
        for attempt in 0..3 {
            let base = policy.initial_delay.as_secs_f64() * policy.multiplier.powi(attempt as i32);
            let d = policy.delay_for_attempt(attempt).as_secs_f64();
            assert!(d >= base * 0.9 - f64::EPSILON && d <= base * 1.1 + f64::EPSILON);
        }
    }
}
