//! Retry and idle-poll policies.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use workhorse_core::{BackoffCurve, BackoffStrategy};

/// Retry policy configuration.
///
/// `max_attempts` counts every claim of an item, the first one included. A
/// retriable failure on attempt `n < max_attempts` requeues the item; on the
/// last attempt it fails permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (1 = never retry)
    pub max_attempts: u32,
    /// Base delay before a requeued item becomes claimable again
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// The "not before" delay applied in the claim predicate.
    ///
    /// Jitter-free: the store evaluates the same curve when selecting rows.
    pub fn requeue_curve(&self) -> BackoffCurve {
        BackoffCurve {
            strategy: self.strategy,
            base: self.base_delay,
            max: self.max_delay,
        }
    }

    /// Delay before attempt `attempt + 1` may start.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.requeue_curve().delay_for_attempt(attempt)
    }

    /// Check if more retries are allowed after `attempt_count` attempts.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }
}

/// Back-off for "no work found" and store outages.
///
/// The delay doubles with each consecutive empty or failed poll, from `min` up
/// to `max`, and is spread by `jitter` (a fraction, 0.0-1.0) so that idle
/// workers drift apart instead of polling in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollBackoff {
    pub min: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(200),
            max: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            ..Default::default()
        }
    }

    /// Near-zero intervals for tests.
    pub fn immediate() -> Self {
        Self {
            min: Duration::from_millis(1),
            max: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter_fraction(jitter);
        self
    }

    /// Un-jittered delay after `streak` consecutive empty polls.
    pub fn base_delay(&self, streak: u32) -> Duration {
        BackoffCurve::exponential(self.min, self.max).delay_for_attempt(streak.max(1))
    }

    /// Delay after `streak` consecutive empty polls, jitter applied.
    pub fn delay(&self, streak: u32) -> Duration {
        let base = self.base_delay(streak);
        let spread = base.as_secs_f64() * jitter_fraction(self.jitter);
        if spread <= 0.0 {
            return base;
        }
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }
}

/// Jitter as a fraction in `[0, 1]`; non-finite values disable it.
fn jitter_fraction(jitter: f64) -> f64 {
    if jitter.is_finite() {
        jitter.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn attempts_include_the_first_claim() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn requeue_curve_matches_policy() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(7));
        let curve = policy.requeue_curve();

        assert_eq!(curve.strategy, BackoffStrategy::Fixed);
        assert_eq!(curve.delay_for_attempt(2), Duration::from_secs(7));
    }

    #[test]
    fn poll_backoff_doubles_to_cap() {
        let poll = PollBackoff::new(Duration::from_millis(100), Duration::from_millis(500))
            .with_jitter(0.0);

        assert_eq!(poll.delay(0), Duration::from_millis(100));
        assert_eq!(poll.delay(1), Duration::from_millis(100));
        assert_eq!(poll.delay(2), Duration::from_millis(200));
        assert_eq!(poll.delay(3), Duration::from_millis(400));
        assert_eq!(poll.delay(9), Duration::from_millis(500));
    }

    #[test]
    fn poll_jitter_stays_within_spread() {
        let poll = PollBackoff::new(Duration::from_millis(1000), Duration::from_millis(1000))
            .with_jitter(0.1);

        for _ in 0..200 {
            let d = poll.delay(1);
            assert!(d >= Duration::from_millis(899), "{d:?}");
            assert!(d <= Duration::from_millis(1101), "{d:?}");
        }
    }

    #[test]
    fn non_finite_jitter_is_ignored() {
        for jitter in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let poll = PollBackoff {
                jitter,
                ..PollBackoff::new(Duration::from_millis(100), Duration::from_millis(500))
            };
            assert_eq!(poll.delay(2), Duration::from_millis(200));
            assert_eq!(poll.with_jitter(jitter).jitter, 0.0);
        }
    }
}
