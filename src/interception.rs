//! Observer registry and three-phase interception protocol.
//!
//! An [`InterceptorDispatcher`] holds the observers registered for one capability trait `I`.
//! Registration is copy-on-write: every dispatch works on a point-in-time snapshot, so adding
//! or removing observers concurrently with a dispatch never blocks it and never corrupts it.
//!
//! The interception protocol around an operation:
//! 1. every observer's *executing* callback runs, in registration order, and may pre-empt the
//!    operation by setting a result or an error on the [`InterceptionContext`];
//! 2. unless suppressed, the operation runs and its outcome is recorded in the context, both as
//!    the current value and as an immutable original;
//! 3. every observer's *executed* callback runs and may replace or clear the outcome;
//! 4. the context's error, if any, is returned; otherwise its result.
//!
//! A callback returning `Err` aborts the rest of its phase and the error is returned as is.
//!
//! Every dispatch starts by clearing the outcome and flags left in the context by an earlier
//! dispatch, so one context may be reused for successive operations.

use crate::error::InterceptionError;
use arc_swap::ArcSwap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Final state of an awaited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    RanToCompletion,
    Faulted,
    Canceled,
}

/// Mutable outcome of one intercepted operation, shared by all observers of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptionContext<T, E> {
    result: Option<T>,
    original_result: Option<T>,
    exception: Option<E>,
    original_exception: Option<E>,
    is_async: bool,
    is_execution_suppressed: bool,
    has_executed: bool,
    execution_point_passed: bool,
    task_status: Option<TaskStatus>,
}

impl<T, E> Default for InterceptionContext<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> InterceptionContext<T, E> {
    pub fn new() -> Self {
        Self {
            result: None,
            original_result: None,
            exception: None,
            original_exception: None,
            is_async: false,
            is_execution_suppressed: false,
            has_executed: false,
            execution_point_passed: false,
            task_status: None,
        }
    }

    /// Context for an operation that is awaited.
    pub fn new_async() -> Self {
        Self { is_async: true, ..Self::new() }
    }

    pub fn result(&self) -> Option<&T> {
        self.result.as_ref()
    }

    /// The value the operation produced, untouched by observers.
    pub fn original_result(&self) -> Option<&T> {
        self.original_result.as_ref()
    }

    pub fn exception(&self) -> Option<&E> {
        self.exception.as_ref()
    }

    /// The error the operation produced, untouched by observers.
    pub fn original_exception(&self) -> Option<&E> {
        self.original_exception.as_ref()
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn is_execution_suppressed(&self) -> bool {
        self.is_execution_suppressed
    }

    pub fn has_executed(&self) -> bool {
        self.has_executed
    }

    /// Set only on the async paths, and only when the operation was actually awaited.
    pub fn task_status(&self) -> Option<TaskStatus> {
        self.task_status
    }

    /// Replace the result. Before execution this also suppresses the operation.
    pub fn set_result(&mut self, result: T) {
        self.suppress_if_pending();
        self.result = Some(result);
    }

    /// Replace the error. Before execution this also suppresses the operation.
    pub fn set_exception(&mut self, exception: E) {
        self.suppress_if_pending();
        self.exception = Some(exception);
    }

    /// Drop the error so that the dispatch returns the result instead.
    pub fn clear_exception(&mut self) {
        self.suppress_if_pending();
        self.exception = None;
    }

    /// Skip the operation without providing an outcome.
    pub fn suppress_execution(&mut self) -> Result<(), InterceptionError> {
        if self.execution_point_passed {
            return Err(InterceptionError::SuppressionAfterExecution);
        }
        self.is_execution_suppressed = true;
        Ok(())
    }

    fn suppress_if_pending(&mut self) {
        if !self.execution_point_passed {
            self.is_execution_suppressed = true;
        }
    }

    fn begin(&mut self) {
        *self = Self { is_async: self.is_async, ..Self::new() };
    }

    fn pass_execution_point(&mut self) {
        self.execution_point_passed = true;
    }

    /// `started` tells whether the operation was invoked before the token fired.
    fn record_canceled(&mut self, started: bool, exception: E, original: E) {
        self.has_executed = started;
        self.exception = Some(exception);
        self.original_exception = Some(original);
        self.task_status = Some(TaskStatus::Canceled);
    }
}

impl<T: Clone, E: Clone> InterceptionContext<T, E> {
    fn record(&mut self, outcome: Result<T, E>) {
        self.has_executed = true;
        match outcome {
            Ok(value) => {
                self.result = Some(value.clone());
                self.original_result = Some(value);
                if self.is_async {
                    self.task_status = Some(TaskStatus::RanToCompletion);
                }
            }
            Err(err) => {
                self.exception = Some(err.clone());
                self.original_exception = Some(err);
                if self.is_async {
                    self.task_status = Some(TaskStatus::Faulted);
                }
            }
        }
    }

    /// The error if one is set, otherwise the result.
    pub fn outcome(&self) -> Result<Option<T>, E> {
        match &self.exception {
            Some(err) => Err(err.clone()),
            None => Ok(self.result.clone()),
        }
    }
}

/// Registry of observers for one capability trait, with fan-out helpers.
pub struct InterceptorDispatcher<I: ?Sized> {
    observers: ArcSwap<Vec<Arc<I>>>,
}

impl<I: ?Sized> Default for InterceptorDispatcher<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ?Sized> fmt::Debug for InterceptorDispatcher<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorDispatcher").field("observers", &self.len()).finish()
    }
}

impl<I: ?Sized> InterceptorDispatcher<I> {
    pub fn new() -> Self {
        Self { observers: ArcSwap::from_pointee(Vec::new()) }
    }

    /// Register `observer` at the end of the dispatch order. Duplicates are not detected.
    pub fn add(&self, observer: Arc<I>) {
        self.observers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(observer.clone());
            next
        });
        debug!(target: "dbexec::interception", observers = self.len(), "observer added");
    }

    /// Unregister the first registration of `observer`. Absent observers are ignored.
    pub fn remove(&self, observer: &Arc<I>) {
        let target = Arc::as_ptr(observer).cast::<()>();
        let position = |list: &[Arc<I>]| list.iter().position(|o| Arc::as_ptr(o).cast::<()>() == target);
        if position(self.observers.load().as_slice()).is_none() {
            return;
        }
        self.observers.rcu(|current| {
            let mut next: Vec<Arc<I>> = current.iter().cloned().collect();
            if let Some(index) = position(next.as_slice()) {
                next.remove(index);
            }
            next
        });
        debug!(target: "dbexec::interception", observers = self.len(), "observer removed");
    }

    pub fn len(&self) -> usize {
        self.observers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.load().is_empty()
    }

    /// Point-in-time view of the registered observers.
    pub fn snapshot(&self) -> Arc<Vec<Arc<I>>> {
        self.observers.load_full()
    }

    /// Call `f` once per observer, in registration order.
    pub fn dispatch<F>(&self, mut f: F)
    where
        F: FnMut(&I),
    {
        for observer in self.snapshot().iter() {
            f(observer.as_ref());
        }
    }

    /// Like [`dispatch`](Self::dispatch) but stops at the first error.
    pub fn try_dispatch<E, F>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&I) -> Result<(), E>,
    {
        for observer in self.snapshot().iter() {
            f(observer.as_ref())?;
        }
        Ok(())
    }

    /// Left fold over the observers. Returns `seed` when none are registered.
    pub fn dispatch_fold<R, F>(&self, seed: R, mut accumulate: F) -> R
    where
        F: FnMut(R, &I) -> R,
    {
        self.snapshot().iter().fold(seed, |acc, observer| accumulate(acc, observer.as_ref()))
    }

    /// Run `operation` inside the three-phase protocol.
    pub fn dispatch_intercepted<T, E, Op, Before, After>(
        &self,
        ctx: &mut InterceptionContext<T, E>,
        operation: Op,
        executing: Before,
        executed: After,
    ) -> Result<Option<T>, E>
    where
        T: Clone,
        E: Clone,
        Op: FnOnce() -> Result<T, E>,
        Before: FnMut(&I, &mut InterceptionContext<T, E>) -> Result<(), E>,
        After: FnMut(&I, &mut InterceptionContext<T, E>) -> Result<(), E>,
    {
        let observers = self.snapshot();
        ctx.begin();
        notify(&observers, ctx, executing)?;
        ctx.pass_execution_point();
        if ctx.is_execution_suppressed() {
            debug!(target: "dbexec::interception", observers = observers.len(), "execution suppressed by observer");
        } else {
            ctx.record(operation());
        }
        notify(&observers, ctx, executed)?;
        ctx.outcome()
    }

    /// Async form of [`dispatch_intercepted`](Self::dispatch_intercepted).
    pub async fn dispatch_intercepted_async<T, E, Op, Fut, Before, After>(
        &self,
        ctx: &mut InterceptionContext<T, E>,
        operation: Op,
        executing: Before,
        executed: After,
    ) -> Result<Option<T>, E>
    where
        T: Clone,
        E: Clone,
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Before: FnMut(&I, &mut InterceptionContext<T, E>) -> Result<(), E>,
        After: FnMut(&I, &mut InterceptionContext<T, E>) -> Result<(), E>,
    {
        let observers = self.snapshot();
        ctx.begin();
        notify(&observers, ctx, executing)?;
        ctx.pass_execution_point();
        if ctx.is_execution_suppressed() {
            debug!(target: "dbexec::interception", observers = observers.len(), "execution suppressed by observer");
        } else {
            let outcome = operation().await;
            ctx.record(outcome);
        }
        notify(&observers, ctx, executed)?;
        ctx.outcome()
    }

    /// Async protocol whose operation is raced against `cancel`.
    ///
    /// On cancellation the context records [`TaskStatus::Canceled`] and the error built by
    /// `on_cancel`; observers still see the executed phase.
    pub async fn dispatch_intercepted_cancellable<T, E, Op, Fut, C, Before, After>(
        &self,
        ctx: &mut InterceptionContext<T, E>,
        operation: Op,
        cancel: &CancellationToken,
        on_cancel: C,
        executing: Before,
        executed: After,
    ) -> Result<Option<T>, E>
    where
        T: Clone,
        E: Clone,
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce() -> E,
        Before: FnMut(&I, &mut InterceptionContext<T, E>) -> Result<(), E>,
        After: FnMut(&I, &mut InterceptionContext<T, E>) -> Result<(), E>,
    {
        let observers = self.snapshot();
        ctx.begin();
        notify(&observers, ctx, executing)?;
        ctx.pass_execution_point();
        if ctx.is_execution_suppressed() {
            debug!(target: "dbexec::interception", observers = observers.len(), "execution suppressed by observer");
        } else if cancel.is_cancelled() {
            let err = on_cancel();
            ctx.record_canceled(false, err.clone(), err);
        } else {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = operation() => Some(outcome),
            };
            match outcome {
                Some(outcome) => ctx.record(outcome),
                None => {
                    debug!(target: "dbexec::interception", "operation canceled");
                    let err = on_cancel();
                    ctx.record_canceled(true, err.clone(), err);
                }
            }
        }
        notify(&observers, ctx, executed)?;
        ctx.outcome()
    }
}

fn notify<I, T, E, F>(
    observers: &[Arc<I>],
    ctx: &mut InterceptionContext<T, E>,
    mut callback: F,
) -> Result<(), E>
where
    I: ?Sized,
    F: FnMut(&I, &mut InterceptionContext<T, E>) -> Result<(), E>,
{
    for observer in observers {
        callback(observer.as_ref(), ctx)?;
    }
    Ok(())
}
