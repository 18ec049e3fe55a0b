// Backoff calculation for step retry policies.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter. The attempt cap comes from the step's
/// retry policy, not from a process-wide constant.
///
/// Sequence for base 5s: 5s, 15s, 45s, ... capped at `max_delay_secs`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_secs: u64,
    max_delay_secs: u64,
    /// 0.0..=1.0; random fraction of the delay added to spread retries.
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            max_delay_secs: 1800,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base_delay_secs: u64) -> Self {
        Self {
            base_delay_secs: base_delay_secs.max(1),
            ..Self::default()
        }
    }

    pub fn with_config(base_delay_secs: u64, max_delay_secs: u64, jitter_factor: f64) -> Self {
        Self {
            base_delay_secs: base_delay_secs.max(1),
            max_delay_secs,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    fn base_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.min(20);
        let delay = self
            .base_delay_secs
            .saturating_mul(3_u64.saturating_pow(exponent));
        delay.min(self.max_delay_secs)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay(attempt) * 1000;
        if self.jitter_factor == 0.0 {
            return Duration::from_millis(base_ms);
        }

        let jitter_range_ms = (base_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };
        Duration::from_millis(base_ms + jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_without_jitter() {
        let backoff = ExponentialBackoff::with_config(5, 1800, 0.0);
        assert_eq!(backoff.delay_for(0), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(15));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(45));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(135));
        // Capped at max
        assert_eq!(backoff.delay_for(10), Duration::from_secs(1800));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = ExponentialBackoff::with_config(5, 1800, 0.1);
        for _ in 0..50 {
            let delay = backoff.delay_for(0).as_millis();
            assert!(delay >= 5000 && delay <= 5500, "delay {}ms out of range", delay);
        }
    }

    #[test]
    fn test_jitter_varies() {
        let backoff = ExponentialBackoff::default();
        let delays: Vec<u128> = (0..20).map(|_| backoff.delay_for(0).as_millis()).collect();
        assert!(delays.iter().any(|&d| d != delays[0]));
    }

    #[test]
    fn test_zero_base_clamped() {
        let backoff = ExponentialBackoff::new(0);
        assert!(backoff.delay_for(0) >= Duration::from_secs(1));
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let backoff = ExponentialBackoff::with_config(5, 1800, 0.0);
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(1800));
    }
}
