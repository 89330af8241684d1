//! # Backoff Calculator
//!
//! Delay before a transiently failed task becomes claimable again:
//! `base * multiplier^(attempts - 1)`, capped at `max_delay`. With the defaults
//! (10 s base, doubling, 10 min cap) the first retry waits 10 s, the second 20 s.
//!
//! Jitter is optional. When enabled the delay moves up or down by at most
//! `max_jitter` of itself and is capped again afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::BackoffConfig;

/// Configuration for backoff calculation behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffCalculatorConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Exponential multiplier (default: 2.0)
    pub multiplier: f64,
    pub jitter_enabled: bool,
    /// Maximum jitter fraction (0.0 to 1.0)
    pub max_jitter: f64,
}

impl Default for BackoffCalculatorConfig {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl BackoffCalculatorConfig {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: 2.0,
            jitter_enabled: config.jitter_enabled,
            max_jitter: config.max_jitter,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffCalculatorConfig,
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(BackoffCalculatorConfig::default())
    }
}

impl BackoffCalculator {
    pub fn new(config: BackoffCalculatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffCalculatorConfig {
        &self.config
    }

    /// Delay after the `attempts`-th attempt failed (attempts counts from 1)
    pub fn delay_for_attempt(&self, attempts: i32) -> Duration {
        let delay = self.exponential_delay(attempts);
        if self.config.jitter_enabled {
            self.apply_jitter(delay)
        } else {
            delay
        }
    }

    fn exponential_delay(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 62);
        let factor = self.config.multiplier.powi(exponent);
        let max_secs = self.config.max_delay.as_secs_f64();
        let secs = (self.config.base_delay.as_secs_f64() * factor).min(max_secs);
        Duration::from_secs_f64(secs.max(0.0)).min(self.config.max_delay)
    }

    /// Apply jitter to delay to prevent thundering herd
    fn apply_jitter(&self, delay: Duration) -> Duration {
        let spread = self.config.max_jitter.clamp(0.0, 1.0);
        if spread == 0.0 || delay.is_zero() {
            return delay;
        }
        // uniform in [-spread, +spread]
        let offset = (fastrand::f64() * 2.0 - 1.0) * spread;
        delay.mul_f64(1.0 + offset).min(self.config.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn calculator(base_ms: u64, max_ms: u64) -> BackoffCalculator {
        BackoffCalculator::new(BackoffCalculatorConfig::from_config(&BackoffConfig {
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
            jitter_enabled: false,
            max_jitter: 0.1,
        }))
    }

    #[test]
    fn test_default_sequence() {
        let calc = BackoffCalculator::default();
        assert_eq!(calc.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(calc.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(calc.delay_for_attempt(3), Duration::from_secs(40));
        assert_eq!(calc.delay_for_attempt(10), Duration::from_secs(600));
    }

    #[test]
    fn test_zero_and_negative_attempts_use_base() {
        let calc = calculator(500, 10_000);
        assert_eq!(calc.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(calc.delay_for_attempt(-3), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_base_never_waits() {
        let calc = calculator(0, 0);
        assert_eq!(calc.delay_for_attempt(5), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_cap(base in 0u64..60_000, max in 0u64..3_600_000, attempts in -5i32..200) {
            let calc = calculator(base, max);
            prop_assert!(calc.delay_for_attempt(attempts) <= Duration::from_millis(max));
        }

        #[test]
        fn delay_is_monotonic_in_attempts(base in 1u64..60_000, attempts in 1i32..40) {
            let calc = calculator(base, 600_000);
            prop_assert!(calc.delay_for_attempt(attempts) <= calc.delay_for_attempt(attempts + 1));
        }

        #[test]
        fn jitter_stays_within_spread(attempts in 1i32..10) {
            let mut config = BackoffCalculatorConfig::default();
            config.jitter_enabled = true;
            config.max_jitter = 0.2;
            let calc = BackoffCalculator::new(config);
            let plain = calc.exponential_delay(attempts).as_secs_f64();
            let jittered = calc.delay_for_attempt(attempts).as_secs_f64();
            prop_assert!(jittered >= plain * 0.8 - 1e-9);
            prop_assert!(jittered <= (plain * 1.2).min(600.0) + 1e-9);
        }
    }
}
