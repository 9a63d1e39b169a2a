//! Jitter strategies that randomize backoff delays.
//!
//! - `None`: deterministic delays for tests.
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`.
//! - `Proportional`: scales the delay by a factor drawn from `[1, max_factor)`. This is the
//!   default for [`ExponentialBackoff`](crate::ExponentialBackoff), with `max_factor = 1.1`.
//!
//! RNG: `rand`'s thread-local RNG by default; inject a seeded RNG with `apply_with_rng`.

use rand::{rng, Rng};
use std::time::Duration;

/// Upper bound of the default proportional random factor.
pub const DEFAULT_RANDOM_FACTOR: f64 = 1.1;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Full jitter: random between 0 and delay
    Full,
    /// Equal jitter: random between delay/2 and delay
    Equal,
    /// Multiply by a random factor in `[1, max_factor)`
    Proportional { max_factor: f64 },
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::Proportional { max_factor: DEFAULT_RANDOM_FACTOR }
    }
}

impl Jitter {
    /// Create a full jitter strategy
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Create an equal jitter strategy
    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Create a proportional jitter strategy. `max_factor` must be finite and at least 1.
    pub fn proportional(max_factor: f64) -> Result<Self, &'static str> {
        if !max_factor.is_finite() || max_factor < 1.0 {
            return Err("proportional jitter: max_factor must be finite and >= 1");
        }
        Ok(Jitter::Proportional { max_factor })
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = Self::as_millis_saturated(delay);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                let millis = Self::as_millis_saturated(delay);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(millis / 2..=millis))
            }
            Jitter::Proportional { max_factor } => {
                if max_factor <= 1.0 || delay.is_zero() {
                    return delay;
                }
                let factor = rng.random_range(1.0..max_factor);
                Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
            }
        }
    }

    fn as_millis_saturated(duration: Duration) -> u64 {
        duration.as_millis().try_into().unwrap_or(u64::MAX)
    }
}
