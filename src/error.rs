//! Error types for execution strategies and interception.
use chrono::TimeDelta;
use std::error::Error;
use std::fmt;

/// Upper bound on wrapper layers walked when looking for the cause of a failure.
pub const MAX_UNWRAP_DEPTH: usize = 32;

/// Errors produced while validating executor settings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// A setting that must be non-negative was negative.
    #[error("{parameter} must be non-negative (got {value})")]
    OutOfRange {
        /// Name of the offending setting.
        parameter: &'static str,
        /// The rejected value, rendered for diagnostics.
        value: String,
    },
}

impl BuildError {
    /// Name of the setting that failed validation.
    pub fn parameter(&self) -> &'static str {
        match self {
            BuildError::OutOfRange { parameter, .. } => parameter,
        }
    }
}

/// Errors raised by misuse of an interception context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InterceptionError {
    /// `suppress_execution` was called after the operation already ran.
    #[error("execution cannot be suppressed after the operation has run")]
    SuppressionAfterExecution,
}

/// The retry budget of an executor ran out.
///
/// The last error is held type-erased, so an enclosing executor recognises this error through
/// `&dyn Error` and unwraps it to the cause it carries. `source()` is that cause.
#[derive(Debug)]
pub struct RetryLimitExceeded {
    attempts: usize,
    last: Box<dyn Error + Send + Sync + 'static>,
    cause_depth: usize,
}

impl RetryLimitExceeded {
    /// `cause_depth` counts the wrapper layers between `last` and its classified cause.
    pub fn new<E>(attempts: usize, last: E, cause_depth: usize) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self { attempts, last: Box::new(last), cause_depth }
    }

    /// Number of times the operation was invoked.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// The last error returned by the operation, as returned.
    pub fn last(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.last
    }

    /// The unwrapped cause of the last failure; `None` when a wrapper carried no inner error.
    pub fn cause(&self) -> Option<&(dyn Error + 'static)> {
        let mut current: Option<&(dyn Error + 'static)> = Some(&*self.last);
        for _ in 0..self.cause_depth {
            current = current.and_then(|e| e.source());
        }
        current
    }
}

impl fmt::Display for RetryLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "maximum number of retries exceeded after {} attempts; last error: {}",
            self.attempts, self.last
        )
    }
}

impl Error for RetryLimitExceeded {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause()
    }
}

/// Failure of an operation run through a [`RetryExecutor`](crate::RetryExecutor).
#[derive(Debug)]
pub enum ExecutionError<E> {
    /// An ambient transaction was active when execution started.
    ExistingTransaction { strategy: String },
    /// A single-use executor was invoked a second time.
    AlreadyExecuted { strategy: String },
    /// The cancellation token fired before or between attempts.
    Canceled,
    /// The delay strategy produced a negative delay.
    NegativeDelay { delay: TimeDelta },
    /// The delay strategy signalled that no more retries are allowed.
    RetryLimitExceeded(RetryLimitExceeded),
    /// The operation failed with an error that is not retried.
    Operation(E),
}

impl<E: fmt::Display> fmt::Display for ExecutionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExistingTransaction { strategy } => write!(
                f,
                "the configured execution strategy '{}' does not support user-initiated transactions",
                strategy
            ),
            Self::AlreadyExecuted { strategy } => write!(
                f,
                "execution strategy '{}' has already run an operation; create a new instance per operation",
                strategy
            ),
            Self::Canceled => write!(f, "operation was canceled"),
            Self::NegativeDelay { delay } => {
                write!(f, "execution strategy returned a negative delay: {}", delay)
            }
            Self::RetryLimitExceeded(e) => fmt::Display::fmt(e, f),
            Self::Operation(e) => write!(f, "{}", e),
        }
    }
}

impl<E: Error + 'static> Error for ExecutionError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Operation(e) => Some(e),
            Self::RetryLimitExceeded(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ExecutionError<E> {
    /// Check if the retry budget was exhausted.
    pub fn is_retry_limit_exceeded(&self) -> bool {
        matches!(self, Self::RetryLimitExceeded(_))
    }

    /// Check if execution was refused because of an ambient transaction.
    pub fn is_existing_transaction(&self) -> bool {
        matches!(self, Self::ExistingTransaction { .. })
    }

    /// Check if execution stopped because of cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Check if this wraps a non-retried operation error.
    pub fn is_operation(&self) -> bool {
        matches!(self, Self::Operation(_))
    }

    /// Borrow the operation error, if this wraps one.
    pub fn as_operation(&self) -> Option<&E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Take the operation error, if this wraps one.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_retry_limit(&self) -> Option<&RetryLimitExceeded> {
        match self {
            Self::RetryLimitExceeded(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: Error + 'static> ExecutionError<E> {
    /// The unwrapped cause of the last failure when the retry limit was hit.
    ///
    /// Returns `None` when a wrapper carried no inner error.
    pub fn last_cause(&self) -> Option<&(dyn Error + 'static)> {
        self.as_retry_limit().and_then(RetryLimitExceeded::cause)
    }

    /// The last error seen before the retry limit was hit, as the operation returned it.
    pub fn last_error(&self) -> Option<&E> {
        self.as_retry_limit().and_then(|e| e.last.downcast_ref::<E>())
    }
}
