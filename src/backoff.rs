//! Delay strategies for the retry executor.
//!
//! A [`DelayStrategy`] is asked for the next delay after every retriable failure. Returning
//! `None` ends the retry loop with a retry-limit error; returning a negative delay is an error
//! of the strategy itself and stops the loop immediately.
//!
//! The default, [`ExponentialBackoff`], hands out `max_retry_count` delays computed as
//! `coefficient * (base^n - 1)` for `n = 0, 1, ...`, scaled by a random factor in `[1, 1.1)`
//! and capped at `max_delay`. With the default settings that is roughly 0s, 1s, 3s, 7s, 15s.
//!
//! ```rust
//! use dbexec::{ExponentialBackoff, Jitter, RetrySettings};
//! use std::time::Duration;
//!
//! let backoff = ExponentialBackoff::new(RetrySettings::default()).with_jitter(Jitter::None);
//! let delays: Vec<Duration> = backoff.sequence().collect();
//! assert_eq!(delays, [0, 1, 3, 7, 15].map(Duration::from_secs));
//! ```

use crate::jitter::Jitter;
use crate::settings::RetrySettings;
use chrono::TimeDelta;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffError {
    /// The exponential base must be finite and at least 1.
    InvalidExponentialBase(f64),
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::InvalidExponentialBase(base) => {
                write!(f, "exponential base must be finite and >= 1 (got {})", base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Per-call retry bookkeeping handed to a [`DelayStrategy`].
///
/// Lives only for the duration of one `execute` call.
#[derive(Debug, Clone, Copy)]
pub struct RetryState<'a> {
    /// Retriable failures seen so far, including the one that triggered this request (1-based).
    pub retries: usize,
    /// The unwrapped cause of the latest failure, if the wrapper chain ended in one.
    pub last_error: Option<&'a (dyn Error + 'static)>,
}

/// Computes the delay before the next attempt.
pub trait DelayStrategy: Send + Sync {
    /// `None` means the retry budget is spent.
    fn next_delay(&self, state: &RetryState<'_>) -> Option<TimeDelta>;
}

impl<F> DelayStrategy for F
where
    F: Fn(&RetryState<'_>) -> Option<TimeDelta> + Send + Sync,
{
    fn next_delay(&self, state: &RetryState<'_>) -> Option<TimeDelta> {
        self(state)
    }
}

/// Exponential backoff with a random factor, bounded by [`RetrySettings`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    settings: RetrySettings,
    coefficient: Duration,
    base: f64,
    jitter: Jitter,
}

impl ExponentialBackoff {
    /// Defaults: coefficient 1s, base 2, proportional jitter with factor 1.1.
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            coefficient: Duration::from_secs(1),
            base: 2.0,
            jitter: Jitter::default(),
        }
    }

    pub fn with_coefficient(mut self, coefficient: Duration) -> Self {
        self.coefficient = coefficient;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Result<Self, BackoffError> {
        if !base.is_finite() || base < 1.0 {
            return Err(BackoffError::InvalidExponentialBase(base));
        }
        self.base = base;
        Ok(self)
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    /// Delay for the zero-based retry index `n`, or `None` once `n >= max_retry_count`.
    pub fn delay_for(&self, n: usize) -> Option<Duration> {
        if n >= self.settings.max_retry_count() {
            return None;
        }
        let exponent = i32::try_from(n).unwrap_or(i32::MAX);
        let secs = self.coefficient.as_secs_f64() * (self.base.powi(exponent) - 1.0);
        // NaN (0 * inf) and non-positive values collapse to zero.
        let raw = if secs > 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };
        Some(self.jitter.apply(raw).min(self.settings.max_delay()))
    }

    /// The full sequence of delays this backoff hands out.
    pub fn sequence(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..).map_while(move |n| self.delay_for(n))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(RetrySettings::default())
    }
}

impl DelayStrategy for ExponentialBackoff {
    fn next_delay(&self, state: &RetryState<'_>) -> Option<TimeDelta> {
        let delay = self.delay_for(state.retries.saturating_sub(1))?;
        Some(TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX))
    }
}

/// The same delay before every retry, optionally limited to a number of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantBackoff {
    delay: TimeDelta,
    limit: Option<usize>,
}

impl ConstantBackoff {
    /// Unlimited retries with a fixed delay. The delay is not validated.
    pub fn new(delay: TimeDelta) -> Self {
        Self { delay, limit: None }
    }

    /// Stop after `retries` delays have been handed out.
    pub fn with_limit(mut self, retries: usize) -> Self {
        self.limit = Some(retries);
        self
    }
}

impl DelayStrategy for ConstantBackoff {
    fn next_delay(&self, state: &RetryState<'_>) -> Option<TimeDelta> {
        match self.limit {
            Some(limit) if state.retries > limit => None,
            _ => Some(self.delay),
        }
    }
}
