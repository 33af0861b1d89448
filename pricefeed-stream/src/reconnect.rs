//! Reconnection backoff policy

use std::time::Duration;

use rand::Rng;

use pricefeed_core::ReconnectConfig;

/// Exponential backoff with a per-instance jitter factor
///
/// The jitter fraction is drawn once when the strategy is built. Each
/// instance is therefore a pure function of the attempt number (monotone and
/// capped), while separate client instances spread their retries apart.
#[derive(Debug, Clone)]
pub struct ReconnectionStrategy {
    min_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
    jitter: f64,
}

impl ReconnectionStrategy {
    /// Build a strategy with a random jitter in `0..=config.jitter_ratio`
    pub fn new(config: &ReconnectConfig) -> Self {
        let ratio = config.jitter_ratio.clamp(0.0, 1.0);
        let jitter = if ratio > 0.0 {
            rand::rng().random_range(0.0..=ratio)
        } else {
            0.0
        };
        Self::with_jitter(config, jitter)
    }

    /// Build a strategy with an explicit jitter fraction
    pub fn with_jitter(config: &ReconnectConfig, jitter: f64) -> Self {
        let min_delay_ms = config.min_delay_ms.max(1);
        Self {
            min_delay_ms,
            max_delay_ms: config.max_delay_ms.max(min_delay_ms),
            multiplier: if config.multiplier.is_finite() {
                config.multiplier.max(1.0)
            } else {
                1.0
            },
            jitter: if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 },
        }
    }

    /// Delay to wait before retry number `attempt` (0-based)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.min_delay_ms as f64 * self.multiplier.powi(exponent);
        let jittered = base * (1.0 + self.jitter);

        let ms = if jittered.is_finite() {
            jittered.min(self.max_delay_ms as f64) as u64
        } else {
            self.max_delay_ms
        };
        Duration::from_millis(ms.clamp(self.min_delay_ms, self.max_delay_ms))
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

impl Default for ReconnectionStrategy {
    fn default() -> Self {
        Self::new(&ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min_ms: u64, max_ms: u64) -> ReconnectConfig {
        ReconnectConfig {
            min_delay_ms: min_ms,
            max_delay_ms: max_ms,
            multiplier: 2.0,
            jitter_ratio: 0.2,
            max_attempts: 5,
        }
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let strategy = ReconnectionStrategy::with_jitter(&config(1_000, 60_000), 0.0);

        assert_eq!(strategy.next_delay(0), Duration::from_secs(1));
        assert_eq!(strategy.next_delay(1), Duration::from_secs(2));
        assert_eq!(strategy.next_delay(2), Duration::from_secs(4));
        assert_eq!(strategy.next_delay(3), Duration::from_secs(8));
        // Should cap at max
        assert_eq!(strategy.next_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_first_attempt_is_never_zero() {
        let strategy = ReconnectionStrategy::with_jitter(&config(0, 0), 0.0);
        assert!(strategy.next_delay(0) > Duration::ZERO);

        let jittered = ReconnectionStrategy::new(&config(500, 10_000));
        assert!(jittered.next_delay(0) >= Duration::from_millis(500));
    }

    #[test]
    fn test_monotone_and_capped_for_many_instances() {
        for _ in 0..50 {
            let strategy = ReconnectionStrategy::new(&config(100, 30_000));
            let mut previous = Duration::ZERO;
            for attempt in 0..64 {
                let delay = strategy.next_delay(attempt);
                assert!(delay >= previous, "attempt {} went backwards", attempt);
                assert!(delay <= Duration::from_millis(30_000));
                previous = delay;
            }
        }
    }

    #[test]
    fn test_jitter_is_bounded() {
        let strategy = ReconnectionStrategy::with_jitter(&config(1_000, 60_000), 0.25);
        assert_eq!(strategy.next_delay(0), Duration::from_millis(1_250));
        assert_eq!(strategy.next_delay(1), Duration::from_millis(2_500));

        for _ in 0..50 {
            let random = ReconnectionStrategy::new(&config(1_000, 60_000));
            assert!((0.0..=0.2).contains(&random.jitter()));
        }
    }

    #[test]
    fn test_huge_attempt_counts_saturate() {
        let strategy = ReconnectionStrategy::with_jitter(&config(1_000, 5_000), 0.1);
        assert_eq!(strategy.next_delay(u32::MAX), Duration::from_millis(5_000));
    }
}
