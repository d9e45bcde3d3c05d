//! Backoff schedule for retrying a round whose client selection fell short.

use rand::{thread_rng, Rng};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self { Self { max_retries: 0, base_delay: Duration::from_millis(500), max_delay: Duration::from_secs(30), jitter: 0.25 } }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): exponential, capped, jittered.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt.min(30) as i32));
        let delay = std::cmp::min(exp, self.max_delay);
        if self.jitter <= 0.0 { return delay; }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter.min(1.0)) as i64;
        let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let cfg = RetryConfig { max_retries: 5, base_delay: Duration::from_millis(10), max_delay: Duration::from_millis(50), jitter: 0.0 };
        assert_eq!(cfg.delay_for(0), Duration::from_millis(10));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(20));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(40));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(50));
        assert_eq!(cfg.delay_for(60), Duration::from_millis(50));
    }

    #[test]
    fn jitter_stays_within_band() {
        let cfg = RetryConfig { max_retries: 1, base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(1), jitter: 0.25 };
        for _ in 0..50 {
            let d = cfg.delay_for(0);
            assert!(d >= Duration::from_millis(75) && d <= Duration::from_millis(125), "{d:?}");
        }
    }
}
