//! Retry backoff and pacing jitter.
//!
//! Retries use `base * 2^(attempt - 1)` capped at `max`. Background loops
//! (heartbeat renewal, reaper pages, scheduler batches) sleep for a base
//! delay perturbed by a relative [`Jitter`].

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// A random jitter applied to a delay
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    None,
    /// Uniform in `delay * (1 - ratio) ..= delay * (1 + ratio)`
    Relative(f64),
}

impl Jitter {
    pub fn apply(self, delay: Duration) -> Duration {
        match self {
            Self::None => delay,
            Self::Relative(ratio) => {
                let ratio = ratio.clamp(0.0, 1.0);
                if ratio == 0.0 || delay.is_zero() {
                    return delay;
                }
                let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
                delay.mul_f64(factor)
            }
        }
    }
}

/// Exponential retry backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Jitter,
}

impl Backoff {
    pub const fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: Jitter::None,
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::exponential(config.backoff_base, config.backoff_max)
            .with_jitter(Jitter::Relative(config.jitter))
    }

    /// Delay before the retry that follows failure number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.ceiling(attempt))
    }

    /// Un-jittered delay; the Redis reaper script computes the same curve
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_is_capped() {
        let backoff = Backoff::exponential(Duration::from_millis(500), Duration::from_secs(10));

        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(2));
        assert_eq!(backoff.delay(5), Duration::from_secs(8));
        assert_eq!(backoff.delay(6), Duration::from_secs(10));
        assert_eq!(backoff.delay(200), Duration::from_secs(10));
    }

    #[test]
    fn attempt_zero_uses_base() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(4));
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
    }

    #[test]
    fn relative_jitter_stays_in_band() {
        let jitter = Jitter::Relative(0.25);
        for _ in 0..200 {
            let d = jitter.apply(Duration::from_secs(4));
            assert!(d >= Duration::from_secs(3), "{:?}", d);
            assert!(d <= Duration::from_secs(5), "{:?}", d);
        }
        assert_eq!(Jitter::None.apply(Duration::from_secs(4)), Duration::from_secs(4));
    }
}
