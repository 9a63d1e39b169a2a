use super::{
    Command, CommandError, CommandInterceptionContext, CommandInterceptor, DataReader,
    NonQueryContext, ReaderContext, ScalarContext, Value,
};
use crate::interception::InterceptorDispatcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Runs commands through the registered [`CommandInterceptor`]s.
///
/// Each call builds a fresh typed interception context; the caller's
/// [`CommandInterceptionContext`] is passed to interceptors as-is (or as an async copy) and is
/// never modified.
#[derive(Debug, Default)]
pub struct CommandDispatcher {
    interceptors: InterceptorDispatcher<dyn CommandInterceptor>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interceptors(&self) -> &InterceptorDispatcher<dyn CommandInterceptor> {
        &self.interceptors
    }

    pub fn add(&self, interceptor: Arc<dyn CommandInterceptor>) {
        self.interceptors.add(interceptor);
    }

    pub fn remove(&self, interceptor: &Arc<dyn CommandInterceptor>) {
        self.interceptors.remove(interceptor);
    }

    /// A suppressed command with no result set yields `0`.
    pub fn non_query(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
    ) -> Result<u64, CommandError> {
        trace!(target: "dbexec::interception", kind = "non_query", "dispatching command");
        let mut interception = NonQueryContext::new();
        self.interceptors
            .dispatch_intercepted(
                &mut interception,
                || command.execute_non_query(),
                |i, ctx| i.non_query_executing(command, context, ctx),
                |i, ctx| i.non_query_executed(command, context, ctx),
            )
            .map(Option::unwrap_or_default)
    }

    /// A suppressed command with no result set yields [`Value::Null`].
    pub fn scalar(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
    ) -> Result<Value, CommandError> {
        trace!(target: "dbexec::interception", kind = "scalar", "dispatching command");
        let mut interception = ScalarContext::new();
        self.interceptors
            .dispatch_intercepted(
                &mut interception,
                || command.execute_scalar(),
                |i, ctx| i.scalar_executing(command, context, ctx),
                |i, ctx| i.scalar_executed(command, context, ctx),
            )
            .map(Option::unwrap_or_default)
    }

    pub fn reader(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
    ) -> Result<Option<Arc<dyn DataReader>>, CommandError> {
        trace!(target: "dbexec::interception", kind = "reader", "dispatching command");
        let behavior = context.behavior();
        let mut interception = ReaderContext::new();
        self.interceptors.dispatch_intercepted(
            &mut interception,
            || command.execute_reader(behavior),
            |i, ctx| i.reader_executing(command, context, ctx),
            |i, ctx| i.reader_executed(command, context, ctx),
        )
    }

    pub async fn non_query_async(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        cancel: &CancellationToken,
    ) -> Result<u64, CommandError> {
        trace!(target: "dbexec::interception", kind = "non_query", "dispatching async command");
        let context = context.as_async();
        let mut interception = NonQueryContext::new_async();
        self.interceptors
            .dispatch_intercepted_cancellable(
                &mut interception,
                || command.execute_non_query_async(),
                cancel,
                || CommandError::Canceled,
                |i, ctx| i.non_query_executing(command, &context, ctx),
                |i, ctx| i.non_query_executed(command, &context, ctx),
            )
            .await
            .map(Option::unwrap_or_default)
    }

    pub async fn scalar_async(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        cancel: &CancellationToken,
    ) -> Result<Value, CommandError> {
        trace!(target: "dbexec::interception", kind = "scalar", "dispatching async command");
        let context = context.as_async();
        let mut interception = ScalarContext::new_async();
        self.interceptors
            .dispatch_intercepted_cancellable(
                &mut interception,
                || command.execute_scalar_async(),
                cancel,
                || CommandError::Canceled,
                |i, ctx| i.scalar_executing(command, &context, ctx),
                |i, ctx| i.scalar_executed(command, &context, ctx),
            )
            .await
            .map(Option::unwrap_or_default)
    }

    pub async fn reader_async(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<dyn DataReader>>, CommandError> {
        trace!(target: "dbexec::interception", kind = "reader", "dispatching async command");
        let context = context.as_async();
        let behavior = context.behavior();
        let mut interception = ReaderContext::new_async();
        self.interceptors
            .dispatch_intercepted_cancellable(
                &mut interception,
                || command.execute_reader_async(behavior),
                cancel,
                || CommandError::Canceled,
                |i, ctx| i.reader_executing(command, &context, ctx),
                |i, ctx| i.reader_executed(command, &context, ctx),
            )
            .await
    }
}
