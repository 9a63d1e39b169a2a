//! Ready-made classification for command failures.
//!
//! ```rust
//! use dbexec::presets;
//! use dbexec::{CommandError, InstantSleeper};
//!
//! let executor = presets::resilient_commands()
//!     .max_retry_count(3)
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//!
//! let mut attempts = 0;
//! let rows = executor.execute(|| {
//!     attempts += 1;
//!     if attempts == 1 {
//!         Err(CommandError::update("save failed", CommandError::database(1205, "deadlock victim")))
//!     } else {
//!         Ok(1u64)
//!     }
//! });
//! assert_eq!(rows.unwrap(), 1);
//! assert_eq!(attempts, 2);
//! ```

use crate::command::CommandError;
use crate::retry::{RetryExecutor, RetryExecutorBuilder};
use std::error::Error;

/// Server error numbers that indicate a transient condition: deadlock victims, throttling,
/// failover, and dropped transport connections.
pub const TRANSIENT_SERVER_ERROR_CODES: &[i32] = &[
    -2, 20, 64, 233, 1205, 4060, 4221, 10053, 10054, 10060, 10928, 10929, 40143, 40197, 40501,
    40540, 40613, 41301, 41302, 41305, 41325, 49918, 49919, 49920,
];

/// Classifier for the unwrapped cause of a command failure.
pub fn transient_command_errors(cause: Option<&(dyn Error + 'static)>) -> bool {
    match cause.and_then(|e| e.downcast_ref::<CommandError>()) {
        Some(CommandError::Timeout | CommandError::Connection(_)) => true,
        Some(CommandError::Database { code, .. }) => TRANSIENT_SERVER_ERROR_CODES.contains(code),
        _ => false,
    }
}

/// Executor builder that retries transient command failures, looking through update wrappers.
pub fn resilient_commands() -> RetryExecutorBuilder {
    RetryExecutor::builder()
        .name("ResilientCommands")
        .should_retry_on(transient_command_errors)
        .unwrap_with(CommandError::is_wrapper)
}
