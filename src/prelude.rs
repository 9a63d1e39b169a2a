//! Convenient re-exports for common dbexec types.
pub use crate::{
    backoff::{ConstantBackoff, DelayStrategy, ExponentialBackoff, RetryState},
    command::{
        Command, CommandBehavior, CommandDispatcher, CommandError, CommandInterceptionContext,
        CommandInterceptor, NonQueryContext, ReaderContext, ScalarContext, Value,
    },
    error::{BuildError, ExecutionError, InterceptionError, RetryLimitExceeded},
    interception::{InterceptionContext, InterceptorDispatcher, TaskStatus},
    jitter::Jitter,
    logging::CommandLogFormatter,
    presets::resilient_commands,
    retry::{RetryExecutor, RetryExecutorBuilder, RetryLayer},
    settings::RetrySettings,
    transaction::TransactionScope,
    CancellationToken,
};
