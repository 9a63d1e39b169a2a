#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # dbexec
//!
//! Execution strategies and command interception for data-access layers.
//!
//! ## Features
//!
//! - **Retry executor** that reruns an operation on transient failures, with exponential
//!   backoff, pluggable failure classification, and cancellation
//! - **Interceptor dispatcher** that fans notifications out to registered observers and runs
//!   the before/execute/after protocol around an operation
//! - **Command pipeline** that routes database commands through interceptors
//! - **Command log formatter** that renders commands, parameters, and outcomes as text
//! - **Tower layer** for wrapping any `Service` in a retry executor
//!
//! ## Quick Start
//!
//! ```rust
//! use dbexec::{ExecutionError, InstantSleeper, RetryExecutor};
//! use std::fmt;
//!
//! #[derive(Debug)]
//! struct Busy;
//!
//! impl fmt::Display for Busy {
//!     fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
//!         f.write_str("server busy")
//!     }
//! }
//!
//! impl std::error::Error for Busy {}
//!
//! let executor = RetryExecutor::builder()
//!     .max_retry_count(3)
//!     .should_retry_on(|cause| cause.is_some_and(|e| e.is::<Busy>()))
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//!
//! let mut calls = 0;
//! let result: Result<u32, ExecutionError<Busy>> = executor.execute(|| {
//!     calls += 1;
//!     if calls < 3 { Err(Busy) } else { Ok(calls) }
//! });
//! assert_eq!(result.unwrap(), 3);
//! ```

pub mod backoff;
pub mod clock;
pub mod command;
pub mod error;
pub mod interception;
pub mod jitter;
pub mod logging;
pub mod prelude;
pub mod presets;
pub mod retry;
pub mod settings;
pub mod sleeper;
pub mod transaction;

// Re-exports
pub use backoff::{BackoffError, ConstantBackoff, DelayStrategy, ExponentialBackoff, RetryState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use command::{
    Command, CommandBehavior, CommandDispatcher, CommandError, CommandInterceptionContext,
    CommandInterceptor, DataReader, DbType, Parameter, ParameterDirection, Value,
};
pub use error::{BuildError, ExecutionError, InterceptionError, RetryLimitExceeded};
pub use interception::{InterceptionContext, InterceptorDispatcher, TaskStatus};
pub use jitter::Jitter;
pub use logging::CommandLogFormatter;
pub use retry::{unwrap_and_handle, RetryExecutor, RetryExecutorBuilder, RetryLayer, RetryService};
pub use settings::RetrySettings;
pub use sleeper::{InstantSleeper, Sleeper, SystemSleeper, TrackingSleeper};
pub use transaction::{NoTransactions, ScopedTransactions, TransactionProbe, TransactionScope};
pub use tokio_util::sync::CancellationToken;
