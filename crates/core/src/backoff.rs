//! Deterministic backoff curves.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Linear => "linear",
        }
    }
}

/// A jitter-free delay curve capped at `max`.
///
/// The same curve is evaluated in process (in-memory store, tests) and inside the
/// PostgreSQL claim predicate, so the two must stay in agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffCurve {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub max: Duration,
}

impl BackoffCurve {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base,
            max,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base: delay,
            max: delay,
        }
    }

    pub fn linear(base: Duration, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base,
            max,
        }
    }

    /// Delay for a given attempt number (1-indexed). Attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                // Clamp the exponent; anything past 2^62 is capped by `max` anyway.
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_doubles_until_capped() {
        let curve = BackoffCurve::exponential(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(curve.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(curve.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(curve.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(curve.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(curve.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn linear_and_fixed() {
        let linear = BackoffCurve::linear(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));

        let fixed = BackoffCurve::fixed(Duration::from_millis(250));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(fixed.delay_for_attempt(9), Duration::from_millis(250));
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_and_bounded(
            base_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            attempt in 1u32..200,
        ) {
            let curve = BackoffCurve::exponential(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            );
            let here = curve.delay_for_attempt(attempt);
            let next = curve.delay_for_attempt(attempt + 1);
            prop_assert!(next >= here);
            prop_assert!(here <= Duration::from_millis(max_ms.max(base_ms)));
        }
    }
}
