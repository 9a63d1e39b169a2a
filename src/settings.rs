//! Validated retry limits shared by the executor and the default backoff.
//!
//! Inputs are signed so that negative values coming from configuration can be rejected with a
//! [`BuildError`] naming the offending setting instead of silently wrapping.

use crate::error::BuildError;
use chrono::TimeDelta;
use std::time::Duration;

/// Default number of retries handed out by the default backoff.
pub const DEFAULT_MAX_RETRY_COUNT: usize = 5;

/// Default cap on a single computed delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry limits: how many delays may be handed out and how long any one of them may be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawRetrySettings", into = "RawRetrySettings"))]
pub struct RetrySettings {
    max_retry_count: usize,
    max_delay: Duration,
}

impl RetrySettings {
    /// Validate and build settings. `max_retry_count` is checked first.
    pub fn new(max_retry_count: i64, max_delay: TimeDelta) -> Result<Self, BuildError> {
        let max_retry_count = usize::try_from(max_retry_count).map_err(|_| {
            BuildError::OutOfRange {
                parameter: "max_retry_count",
                value: max_retry_count.to_string(),
            }
        })?;
        let max_delay = max_delay.to_std().map_err(|_| BuildError::OutOfRange {
            parameter: "max_delay",
            value: max_delay.to_string(),
        })?;
        Ok(Self { max_retry_count, max_delay })
    }

    pub fn max_retry_count(&self) -> usize {
        self.max_retry_count
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_retry_count: DEFAULT_MAX_RETRY_COUNT, max_delay: DEFAULT_MAX_DELAY }
    }
}

/// Wire form of [`RetrySettings`]; signed so that validation sees what the document said.
#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
struct RawRetrySettings {
    max_retry_count: i64,
    max_delay_ms: i64,
}

#[cfg(feature = "serde")]
impl TryFrom<RawRetrySettings> for RetrySettings {
    type Error = BuildError;

    fn try_from(raw: RawRetrySettings) -> Result<Self, Self::Error> {
        let max_delay = TimeDelta::try_milliseconds(raw.max_delay_ms).ok_or_else(|| {
            BuildError::OutOfRange { parameter: "max_delay", value: raw.max_delay_ms.to_string() }
        })?;
        RetrySettings::new(raw.max_retry_count, max_delay)
    }
}

#[cfg(feature = "serde")]
impl From<RetrySettings> for RawRetrySettings {
    fn from(settings: RetrySettings) -> Self {
        Self {
            max_retry_count: i64::try_from(settings.max_retry_count).unwrap_or(i64::MAX),
            max_delay_ms: i64::try_from(settings.max_delay.as_millis()).unwrap_or(i64::MAX),
        }
    }
}
