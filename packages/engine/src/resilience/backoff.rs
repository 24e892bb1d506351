// packages/engine/src/resilience/backoff.rs
//! Backoff strategies
//!
//! Delay before attempt `n + 1`, where `n` is the 1-indexed attempt that just
//! failed. Every strategy is capped at the policy's `max_delay`.
//!
//! | Strategy            | Delay                                      |
//! |---------------------|--------------------------------------------|
//! | `Fixed`             | `base`                                     |
//! | `Linear`            | `base * n`                                 |
//! | `Exponential`       | `base * multiplier^(n-1)`                  |
//! | `ExponentialJitter` | exponential ± uniform `jitter_range` share |
//! | `Fibonacci`         | `base * fib(n)`, `fib(1) = fib(2) = 1`     |
//! | `Adaptive`          | same as `Exponential`                      |
//! | `Custom`            | user function of `n`                       |

use crate::resilience::policy::RetryPolicy;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Strategy mapping attempt number to wait duration
#[derive(Clone)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    ExponentialJitter,
    Fibonacci,
    /// Reserved for latency-aware tuning. Computes exactly the same delays
    /// as [`BackoffStrategy::Exponential`].
    Adaptive,
    Custom(CustomBackoff),
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::ExponentialJitter => "exponential_jitter",
            BackoffStrategy::Fibonacci => "fibonacci",
            BackoffStrategy::Adaptive => "adaptive",
            BackoffStrategy::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-supplied delay function, receives the failed attempt number
#[derive(Clone)]
pub struct CustomBackoff(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl CustomBackoff {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn delay(&self, attempt: u32) -> Duration {
        (self.0)(attempt)
    }
}

impl fmt::Debug for CustomBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomBackoff(..)")
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt`, jitter included
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    /// Delay after failed attempt `attempt` without any jitter applied
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let base = self.base_delay;

        let delay = match &self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => scale(base, n as f64, self.max_delay),
            BackoffStrategy::Exponential
            | BackoffStrategy::ExponentialJitter
            | BackoffStrategy::Adaptive => {
                let factor = self.backoff_multiplier.powf((n - 1) as f64);
                scale(base, factor, self.max_delay)
            }
            BackoffStrategy::Fibonacci => scale(base, fibonacci(n), self.max_delay),
            BackoffStrategy::Custom(custom) => custom.delay(n),
        };

        delay.min(self.max_delay)
    }

    pub(crate) fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay_for(attempt);

        match self.strategy {
            BackoffStrategy::ExponentialJitter if self.jitter_range > 0.0 => {
                let spread = self.jitter_range;
                let offset: f64 = rng.gen_range(-spread..=spread);
                scale(delay, 1.0 + offset, self.max_delay)
            }
            _ => delay,
        }
    }
}

/// `fib(1) = fib(2) = 1`, saturating in f64 space
fn fibonacci(n: u32) -> f64 {
    let (mut a, mut b) = (0.0_f64, 1.0_f64);
    for _ in 1..n {
        let next = a + b;
        a = b;
        b = next;
        if !b.is_finite() {
            return f64::MAX;
        }
    }
    b
}

fn scale(base: Duration, factor: f64, max: Duration) -> Duration {
    let secs = base.as_secs_f64() * factor;
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            strategy,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_range: 0.25,
            ..Default::default()
        }
    }

    #[test]
    fn test_fixed() {
        let p = policy(BackoffStrategy::Fixed);
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(7), Duration::from_secs(1));
    }

    #[test]
    fn test_linear() {
        let p = policy(BackoffStrategy::Linear);
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential() {
        let p = policy(BackoffStrategy::Exponential);
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(4), Duration::from_secs(8));
        // 2^9 = 512s, capped
        assert_eq!(p.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn test_fibonacci_sequence() {
        let p = RetryPolicy {
            max_attempts: 3,
            strategy: BackoffStrategy::Fibonacci,
            base_delay: Duration::from_secs(1),
            ..Default::default()
        };
        // Delays before attempts 2, 3 and 4
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(2));
        assert_eq!(p.delay_for(4), Duration::from_secs(3));
        assert_eq!(p.delay_for(5), Duration::from_secs(5));
    }

    #[test]
    fn test_adaptive_matches_exponential() {
        let adaptive = policy(BackoffStrategy::Adaptive);
        let exponential = policy(BackoffStrategy::Exponential);
        for n in 1..=12 {
            assert_eq!(adaptive.delay_for(n), exponential.delay_for(n));
        }
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let p = policy(BackoffStrategy::ExponentialJitter);
        for _ in 0..200 {
            let delay = p.delay_for(3).as_secs_f64();
            // 4s ± 25%
            assert!((3.0..=5.0).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_jitter_disabled_with_zero_range() {
        let p = RetryPolicy {
            jitter_range: 0.0,
            ..policy(BackoffStrategy::ExponentialJitter)
        };
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_custom_is_capped() {
        let p = policy(BackoffStrategy::Custom(CustomBackoff::new(|n| {
            Duration::from_secs(100 * n as u64)
        })));
        assert_eq!(p.delay_for(1), Duration::from_secs(60));

        let gentle = policy(BackoffStrategy::Custom(CustomBackoff::new(|n| {
            Duration::from_millis(10 * n as u64)
        })));
        assert_eq!(gentle.delay_for(3), Duration::from_millis(30));
    }

    #[test]
    fn test_huge_attempt_numbers_saturate() {
        let p = policy(BackoffStrategy::Fibonacci);
        assert_eq!(p.delay_for(5_000), Duration::from_secs(60));
        let p = policy(BackoffStrategy::Exponential);
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(60));
    }

    proptest! {
        #[test]
        fn prop_exponential_is_monotonic_and_capped(
            base_ms in 1u64..5_000,
            max_ms in 1u64..600_000,
            multiplier in 1.01f64..8.0,
            attempt in 1u32..64,
        ) {
            let p = RetryPolicy {
                strategy: BackoffStrategy::Exponential,
                base_delay: Duration::from_millis(base_ms.min(max_ms)),
                max_delay: Duration::from_millis(max_ms),
                backoff_multiplier: multiplier,
                ..Default::default()
            };
            let current = p.base_delay_for(attempt);
            let next = p.base_delay_for(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(next <= p.max_delay);
        }

        #[test]
        fn prop_jittered_delay_never_exceeds_cap(
            base_ms in 1u64..5_000,
            max_ms in 1u64..600_000,
            multiplier in 1.01f64..8.0,
            jitter in 0.0f64..0.99,
            attempt in 1u32..64,
        ) {
            let p = RetryPolicy {
                strategy: BackoffStrategy::ExponentialJitter,
                base_delay: Duration::from_millis(base_ms.min(max_ms)),
                max_delay: Duration::from_millis(max_ms),
                backoff_multiplier: multiplier,
                jitter_range: jitter,
                ..Default::default()
            };
            let unjittered_now = p.base_delay_for(attempt);
            let unjittered_next = p.base_delay_for(attempt + 1);
            prop_assert!(unjittered_next >= unjittered_now);
            prop_assert!(p.delay_for(attempt) <= p.max_delay);
        }
    }
}
