//! Retrying execution strategy.
//!
//! Semantics:
//! - Preconditions run before the first attempt, in order: ambient transaction check (retrying
//!   executors only), for the async path the cancellation check, then the single-use check. A
//!   call refused by an earlier check does not use up a single-use executor.
//! - A failure is unwrapped through the executor's wrapper predicate and the innermost cause is
//!   classified. A [`RetryLimitExceeded`] from a nested executor, or an error whose `source()` is
//!   one, is always unwrapped, so an outer executor classifies the inner cause. Non-retriable failures are returned as `ExecutionError::Operation` carrying the
//!   original error.
//! - For retriable failures the delay strategy is consulted with the running retry count. `None`
//!   ends the loop with `RetryLimitExceeded`; a negative delay ends it with `NegativeDelay`.
//! - On success neither the classifier nor the delay strategy is consulted.
//! - Retry bookkeeping lives on the stack of each call, so one executor can serve concurrent
//!   operations.
//!
//! Example
//! ```rust
//! use dbexec::{InstantSleeper, RetryExecutor};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Debug)]
//! struct Busy;
//! impl std::fmt::Display for Busy {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "busy") }
//! }
//! impl std::error::Error for Busy {}
//!
//! let executor = RetryExecutor::builder()
//!     .max_retry_count(3)
//!     .should_retry_on(|e| e.is_some_and(|e| e.is::<Busy>()))
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//!
//! let calls = AtomicUsize::new(0);
//! let value = executor.execute(|| {
//!     if calls.fetch_add(1, Ordering::SeqCst) < 2 { Err(Busy) } else { Ok(42) }
//! });
//! assert_eq!(value.unwrap(), 42);
//! assert_eq!(calls.load(Ordering::SeqCst), 3);
//! ```

use crate::backoff::{DelayStrategy, ExponentialBackoff, RetryState};
use crate::error::{BuildError, ExecutionError, RetryLimitExceeded, MAX_UNWRAP_DEPTH};
use crate::settings::RetrySettings;
use crate::sleeper::{Sleeper, SystemSleeper};
use crate::transaction::{ScopedTransactions, TransactionProbe};
use chrono::TimeDelta;
use futures::future::BoxFuture;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, error, warn};

type Classifier = Arc<dyn Fn(Option<&(dyn Error + 'static)>) -> bool + Send + Sync>;
type WrapperPredicate = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

const DEFAULT_NAME: &str = "RetryExecutor";

/// Unwrap `err` through `is_wrapper` and hand the innermost cause to `classify`.
///
/// Retry-limit errors of nested executors are unwrapped as well. A wrapper without a source
/// yields `classify(None)`. The verdict is returned unchanged.
pub fn unwrap_and_handle<R>(
    err: &(dyn Error + 'static),
    is_wrapper: impl Fn(&(dyn Error + 'static)) -> bool,
    classify: impl FnOnce(Option<&(dyn Error + 'static)>) -> R,
) -> R {
    let (cause, _) = unwrap_cause(err, &is_wrapper);
    classify(cause)
}

fn unwrap_cause<'a>(
    err: &'a (dyn Error + 'static),
    is_wrapper: &dyn Fn(&(dyn Error + 'static)) -> bool,
) -> (Option<&'a (dyn Error + 'static)>, usize) {
    let mut current = err;
    let mut depth = 0;
    while depth < MAX_UNWRAP_DEPTH && (is_retry_limit(current) || is_wrapper(current)) {
        depth += 1;
        match current.source() {
            Some(inner) => current = inner,
            None => return (None, depth),
        }
    }
    (Some(current), depth)
}

fn is_retry_limit(err: &(dyn Error + 'static)) -> bool {
    err.is::<RetryLimitExceeded>() || err.source().is_some_and(|e| e.is::<RetryLimitExceeded>())
}

/// States of one execution, as reported in `tracing` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    NotStarted,
    Attempting,
    Delaying,
    Succeeded,
    FailedPermanently,
    FailedRetryLimitExceeded,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::NotStarted => "not_started",
            ExecutionPhase::Attempting => "attempting",
            ExecutionPhase::Delaying => "delaying",
            ExecutionPhase::Succeeded => "succeeded",
            ExecutionPhase::FailedPermanently => "failed_permanently",
            ExecutionPhase::FailedRetryLimitExceeded => "failed_retry_limit_exceeded",
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Step<E> {
    Retry(Duration),
    Fail(ExecutionError<E>),
}

/// Execution strategy that re-runs an operation on transient failures.
pub struct RetryExecutor {
    name: String,
    settings: RetrySettings,
    retries_on_failure: bool,
    should_retry_on: Classifier,
    is_wrapper: WrapperPredicate,
    delay: Arc<dyn DelayStrategy>,
    transactions: Arc<dyn TransactionProbe>,
    sleeper: Arc<dyn Sleeper>,
    single_use: bool,
    executed: AtomicBool,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("retries_on_failure", &self.retries_on_failure)
            .field("single_use", &self.single_use)
            .field("sleeper", &self.sleeper)
            .field("should_retry_on", &"<predicate>")
            .field("delay", &"<strategy>")
            .finish()
    }
}

impl RetryExecutor {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryExecutorBuilder {
        RetryExecutorBuilder::new()
    }

    /// Executor that runs each operation exactly once and ignores ambient transactions.
    pub fn no_retry() -> Self {
        Self {
            name: "NoRetryExecutor".to_string(),
            settings: RetrySettings::default(),
            retries_on_failure: false,
            should_retry_on: Arc::new(|_| false),
            is_wrapper: Arc::new(|_| false),
            delay: Arc::new(|_: &RetryState<'_>| -> Option<TimeDelta> { None }),
            transactions: Arc::new(ScopedTransactions),
            sleeper: Arc::new(SystemSleeper),
            single_use: false,
            executed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    /// Whether this executor may re-run an operation.
    pub fn retries_on_failure(&self) -> bool {
        self.retries_on_failure
    }

    /// Run `operation` synchronously, sleeping on the calling thread between attempts.
    pub fn execute<T, E, F>(&self, mut operation: F) -> Result<T, ExecutionError<E>>
    where
        E: Error + Send + Sync + 'static,
        F: FnMut() -> Result<T, E>,
    {
        self.check_preconditions(None)?;
        let mut retries = 0;
        let mut attempts = 0;
        loop {
            attempts += 1;
            self.trace_attempt(attempts);
            let delay = match operation() {
                Ok(value) => {
                    self.trace_success(attempts);
                    return Ok(value);
                }
                Err(err) => match self.after_failure(err, &mut retries, attempts) {
                    Step::Retry(delay) => delay,
                    Step::Fail(e) => return Err(e),
                },
            };
            self.sleeper.sleep_blocking(delay);
        }
    }

    /// Run `operation` asynchronously. Cancellation is observed before every attempt and while
    /// waiting out a delay.
    pub async fn execute_async<T, E, F, Fut>(
        &self,
        mut operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, ExecutionError<E>>
    where
        E: Error + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check_preconditions(Some(cancel))?;
        let mut retries = 0;
        let mut attempts = 0;
        loop {
            if attempts > 0 && cancel.is_cancelled() {
                debug!(target: "dbexec::retry", strategy = %self.name, attempts, "execution canceled");
                return Err(ExecutionError::Canceled);
            }
            attempts += 1;
            self.trace_attempt(attempts);
            let delay = match operation().await {
                Ok(value) => {
                    self.trace_success(attempts);
                    return Ok(value);
                }
                Err(err) => match self.after_failure(err, &mut retries, attempts) {
                    Step::Retry(delay) => delay,
                    Step::Fail(e) => return Err(e),
                },
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(target: "dbexec::retry", strategy = %self.name, attempts, "execution canceled while delaying");
                    return Err(ExecutionError::Canceled);
                }
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }

    fn check_preconditions<E>(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), ExecutionError<E>> {
        if self.retries_on_failure && self.transactions.in_transaction() {
            return Err(ExecutionError::ExistingTransaction { strategy: self.name.clone() });
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            debug!(target: "dbexec::retry", strategy = %self.name, "execution canceled before the first attempt");
            return Err(ExecutionError::Canceled);
        }
        if self.single_use && self.executed.swap(true, Ordering::SeqCst) {
            return Err(ExecutionError::AlreadyExecuted { strategy: self.name.clone() });
        }
        debug!(target: "dbexec::retry", strategy = %self.name, phase = %ExecutionPhase::NotStarted, "execution starting");
        Ok(())
    }

    fn trace_attempt(&self, attempt: usize) {
        debug!(target: "dbexec::retry", strategy = %self.name, phase = %ExecutionPhase::Attempting, attempt, "running operation");
    }

    fn trace_success(&self, attempts: usize) {
        debug!(target: "dbexec::retry", strategy = %self.name, phase = %ExecutionPhase::Succeeded, attempts, "operation succeeded");
    }

    fn after_failure<E>(&self, err: E, retries: &mut usize, attempts: usize) -> Step<E>
    where
        E: Error + Send + Sync + 'static,
    {
        if !self.retries_on_failure {
            return Step::Fail(ExecutionError::Operation(err));
        }

        let (cause, cause_depth) = unwrap_cause(&err, &*self.is_wrapper);
        if !(self.should_retry_on)(cause) {
            debug!(target: "dbexec::retry", strategy = %self.name, phase = %ExecutionPhase::FailedPermanently, attempts, error = %err, "failure is not retriable");
            return Step::Fail(ExecutionError::Operation(err));
        }

        *retries += 1;
        let state = RetryState { retries: *retries, last_error: cause };
        let Some(delay) = self.delay.next_delay(&state) else {
            error!(
                target: "dbexec::retry",
                strategy = %self.name,
                phase = %ExecutionPhase::FailedRetryLimitExceeded,
                attempts,
                error = %err,
                "retry limit exceeded"
            );
            let limit = RetryLimitExceeded::new(attempts, err, cause_depth);
            return Step::Fail(ExecutionError::RetryLimitExceeded(limit));
        };

        match delay.to_std() {
            Ok(wait) => {
                warn!(
                    target: "dbexec::retry",
                    strategy = %self.name,
                    phase = %ExecutionPhase::Delaying,
                    retry = *retries,
                    delay_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "retrying after transient failure"
                );
                Step::Retry(wait)
            }
            Err(_) => Step::Fail(ExecutionError::NegativeDelay { delay }),
        }
    }
}

/// Builder for `RetryExecutor`.
pub struct RetryExecutorBuilder {
    name: String,
    settings: RetrySettings,
    max_retry_count: Option<i64>,
    max_delay: Option<TimeDelta>,
    should_retry_on: Classifier,
    is_wrapper: WrapperPredicate,
    delay: Option<Arc<dyn DelayStrategy>>,
    transactions: Arc<dyn TransactionProbe>,
    sleeper: Arc<dyn Sleeper>,
    single_use: bool,
}

impl RetryExecutorBuilder {
    /// Create a builder with defaults: 5 retries, 30s cap, nothing classified as transient.
    pub fn new() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            settings: RetrySettings::default(),
            max_retry_count: None,
            max_delay: None,
            should_retry_on: Arc::new(|_| false),
            is_wrapper: Arc::new(|_| false),
            delay: None,
            transactions: Arc::new(ScopedTransactions),
            sleeper: Arc::new(SystemSleeper),
            single_use: false,
        }
    }

    /// Name reported in errors and logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Start from already-validated settings, e.g. loaded from configuration.
    pub fn settings(mut self, settings: RetrySettings) -> Self {
        self.settings = settings;
        self.max_retry_count = None;
        self.max_delay = None;
        self
    }

    /// Validated at `build()`; negative values are rejected.
    pub fn max_retry_count(mut self, count: i64) -> Self {
        self.max_retry_count = Some(count);
        self
    }

    /// Validated at `build()`; negative values are rejected.
    pub fn max_delay(mut self, delay: TimeDelta) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Classifier for the unwrapped cause of a failure. `None` means a wrapper had no cause.
    pub fn should_retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(Option<&(dyn Error + 'static)>) -> bool + Send + Sync + 'static,
    {
        self.should_retry_on = Arc::new(predicate);
        self
    }

    /// Predicate recognising wrapper errors whose `source()` should be classified instead.
    pub fn unwrap_with<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.is_wrapper = Arc::new(predicate);
        self
    }

    /// Replace the default exponential backoff.
    pub fn delay_strategy<D>(mut self, strategy: D) -> Self
    where
        D: DelayStrategy + 'static,
    {
        self.delay = Some(Arc::new(strategy));
        self
    }

    /// Replace the default exponential backoff with a closure.
    pub fn next_delay<F>(self, f: F) -> Self
    where
        F: Fn(&RetryState<'_>) -> Option<TimeDelta> + Send + Sync + 'static,
    {
        self.delay_strategy(f)
    }

    pub fn transaction_probe<P>(mut self, probe: P) -> Self
    where
        P: TransactionProbe + 'static,
    {
        self.transactions = Arc::new(probe);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Refuse a second `execute` on the same instance.
    pub fn single_use(mut self, single_use: bool) -> Self {
        self.single_use = single_use;
        self
    }

    /// Build the executor, validating settings.
    pub fn build(self) -> Result<RetryExecutor, BuildError> {
        let settings = match (self.max_retry_count, self.max_delay) {
            (None, None) => self.settings,
            (count, delay) => RetrySettings::new(
                count.unwrap_or_else(|| {
                    i64::try_from(self.settings.max_retry_count()).unwrap_or(i64::MAX)
                }),
                delay.unwrap_or_else(|| {
                    TimeDelta::from_std(self.settings.max_delay()).unwrap_or(TimeDelta::MAX)
                }),
            )?,
        };
        let delay = self.delay.unwrap_or_else(|| Arc::new(ExponentialBackoff::new(settings)));
        Ok(RetryExecutor {
            name: self.name,
            settings,
            retries_on_failure: true,
            should_retry_on: self.should_retry_on,
            is_wrapper: self.is_wrapper,
            delay,
            transactions: self.transactions,
            sleeper: self.sleeper,
            single_use: self.single_use,
            executed: AtomicBool::new(false),
        })
    }
}

impl Default for RetryExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Tower layer running every request through a shared [`RetryExecutor`].
#[derive(Debug, Clone)]
pub struct RetryLayer {
    executor: Arc<RetryExecutor>,
    cancel: CancellationToken,
}

impl RetryLayer {
    pub fn new(executor: RetryExecutor) -> Self {
        Self { executor: Arc::new(executor), cancel: CancellationToken::new() }
    }

    /// Use `token` to cancel in-flight retries of every service produced by this layer.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RetryService { inner: service, executor: self.executor.clone(), cancel: self.cancel.clone() }
    }
}

/// Retry service produced by `RetryLayer`.
#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    executor: Arc<RetryExecutor>,
    cancel: CancellationToken,
}

impl<S, Request> Service<Request> for RetryService<S>
where
    Request: Clone + Send + 'static,
    S: Service<Request> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Error + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = ExecutionError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ExecutionError::Operation)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let executor = self.executor.clone();
        let cancel = self.cancel.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            executor
                .execute_async(
                    move || {
                        let svc = inner.clone();
                        let req = req.clone();
                        async move { svc.oneshot(req).await }
                    },
                    &cancel,
                )
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ConstantBackoff;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use crate::transaction::{NoTransactions, TransactionScope};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl Error for TestError {}

    #[derive(Debug)]
    struct Wrapped(Option<TestError>);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "wrapped")
        }
    }

    impl Error for Wrapped {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            self.0.as_ref().map(|e| e as &(dyn Error + 'static))
        }
    }

    fn is_wrapped(e: &(dyn Error + 'static)) -> bool {
        e.is::<Wrapped>()
    }

    fn retry_all() -> RetryExecutorBuilder {
        RetryExecutor::builder().should_retry_on(|_| true).with_sleeper(InstantSleeper)
    }

    #[test]
    fn success_consults_neither_classifier_nor_delay() {
        let classified = Arc::new(AtomicUsize::new(0));
        let delayed = Arc::new(AtomicUsize::new(0));
        let (c, d) = (classified.clone(), delayed.clone());
        let executor = RetryExecutor::builder()
            .should_retry_on(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                true
            })
            .next_delay(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
                Some(TimeDelta::zero())
            })
            .build()
            .expect("builder");

        let result: Result<i32, ExecutionError<TestError>> = executor.execute(|| Ok(1));
        assert_eq!(result.unwrap(), 1);
        assert_eq!(classified.load(Ordering::SeqCst), 0);
        assert_eq!(delayed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retries_until_delay_strategy_gives_up() {
        let executor = retry_all()
            .next_delay(|s| (s.retries < 3).then(TimeDelta::zero))
            .build()
            .expect("builder");
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = executor.execute(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError(format!("attempt {}", n)))
        });

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        match &err {
            ExecutionError::RetryLimitExceeded(limit) => assert_eq!(limit.attempts(), 3),
            other => panic!("expected RetryLimitExceeded, got {:?}", other),
        }
        assert_eq!(err.last_error(), Some(&TestError("attempt 2".into())));
    }

    #[test]
    fn retry_limit_source_is_unwrapped_cause() {
        let executor = retry_all()
            .unwrap_with(is_wrapped)
            .delay_strategy(ConstantBackoff::new(TimeDelta::zero()).with_limit(1))
            .build()
            .expect("builder");

        let err = executor
            .execute(|| Err::<(), _>(Wrapped(Some(TestError("deadlock".into())))))
            .unwrap_err();

        let cause = err.source().and_then(|limit| limit.source()).expect("cause");
        assert_eq!(cause.downcast_ref::<TestError>(), Some(&TestError("deadlock".into())));
        assert!(err.last_error().is_some_and(|last| last.0.is_some()));
    }

    #[test]
    fn non_retriable_error_is_returned_unchanged() {
        let executor = RetryExecutor::builder()
            .should_retry_on(|e| e.is_some_and(|e| e.to_string().contains("retryable")))
            .with_sleeper(InstantSleeper)
            .build()
            .expect("builder");
        let calls = AtomicUsize::new(0);

        let err = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError("fatal".into()))
            })
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.as_operation(), Some(&TestError("fatal".into())));
    }

    #[test]
    fn negative_delay_fails_after_one_attempt() {
        let executor = retry_all()
            .delay_strategy(ConstantBackoff::new(TimeDelta::milliseconds(-1)))
            .build()
            .expect("builder");
        let calls = AtomicUsize::new(0);

        let err = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError("boom".into()))
            })
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ExecutionError::NegativeDelay { delay } if delay == TimeDelta::milliseconds(-1)));
    }

    #[test]
    fn default_backoff_sleeps_between_attempts() {
        let sleeper = TrackingSleeper::new();
        let executor = RetryExecutor::builder()
            .should_retry_on(|_| true)
            .with_sleeper(sleeper.clone())
            .build()
            .expect("builder");
        let calls = AtomicUsize::new(0);

        let err = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError("down".into()))
            })
            .unwrap_err();

        assert!(err.is_retry_limit_exceeded());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        let delays = sleeper.calls();
        assert_eq!(delays.len(), 5);
        for (actual, expected) in delays.iter().zip([0u64, 1, 3, 7, 15]) {
            let expected = Duration::from_secs(expected);
            assert!(*actual >= expected && *actual <= expected + expected / 10 + Duration::from_millis(1));
        }
    }

    #[test]
    fn rejects_ambient_transaction_without_running() {
        let executor = retry_all().name("SqlServerRetry").build().expect("builder");
        let calls = AtomicUsize::new(0);
        let _scope = TransactionScope::enter();

        let err = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
            .unwrap_err();

        assert!(err.is_existing_transaction());
        assert!(err.to_string().contains("'SqlServerRetry'"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_retry_runs_inside_transactions_once() {
        let executor = RetryExecutor::no_retry();
        assert!(!executor.retries_on_failure());
        let _scope = TransactionScope::enter();
        let calls = AtomicUsize::new(0);

        let err = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError("once".into()))
            })
            .unwrap_err();

        assert!(err.is_operation());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transaction_probe_is_injectable() {
        let executor = retry_all().transaction_probe(NoTransactions).build().expect("builder");
        let _scope = TransactionScope::enter();
        assert_eq!(executor.execute(|| Ok::<_, TestError>(7)).unwrap(), 7);
    }

    #[test]
    fn single_use_executor_refuses_second_run() {
        let executor = retry_all().single_use(true).build().expect("builder");
        assert!(executor.execute(|| Ok::<_, TestError>(())).is_ok());
        let err = executor.execute(|| Ok::<_, TestError>(())).unwrap_err();
        assert!(matches!(err, ExecutionError::AlreadyExecuted { .. }));
    }

    #[test]
    fn executors_are_reusable_by_default() {
        let executor = retry_all().build().expect("builder");
        for _ in 0..3 {
            assert!(executor.execute(|| Ok::<_, TestError>(())).is_ok());
        }
    }

    #[test]
    fn builder_rejects_negative_settings() {
        let err = RetryExecutor::builder().max_retry_count(-1).build().unwrap_err();
        assert_eq!(err.parameter(), "max_retry_count");
        let err = RetryExecutor::builder().max_delay(TimeDelta::seconds(-1)).build().unwrap_err();
        assert_eq!(err.parameter(), "max_delay");
    }

    #[test]
    fn builder_overrides_apply_on_top_of_settings() {
        let executor = RetryExecutor::builder()
            .settings(RetrySettings::new(2, TimeDelta::seconds(10)).unwrap())
            .max_retry_count(4)
            .build()
            .expect("builder");
        assert_eq!(executor.settings().max_retry_count(), 4);
        assert_eq!(executor.settings().max_delay(), Duration::from_secs(10));
    }

    #[test]
    fn unwrap_and_handle_walks_wrappers() {
        let err = Wrapped(Some(TestError("inner".into())));
        let seen = unwrap_and_handle(&err, is_wrapped, |cause| {
            cause.and_then(|c| c.downcast_ref::<TestError>()).cloned()
        });
        assert_eq!(seen, Some(TestError("inner".into())));
    }

    #[test]
    fn unwrap_and_handle_passes_none_for_empty_wrapper() {
        let err = Wrapped(None);
        assert!(unwrap_and_handle(&err, is_wrapped, |cause| cause.is_none()));
    }

    #[test]
    fn unwrap_and_handle_classifies_non_wrappers_directly() {
        let err = TestError("plain".into());
        let verdict = unwrap_and_handle(&err, is_wrapped, |cause| {
            cause.map(|c| c.to_string()).unwrap_or_default()
        });
        assert_eq!(verdict, "TestError: plain");
    }

    #[test]
    fn classifier_sees_unwrapped_cause() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let executor = RetryExecutor::builder()
            .unwrap_with(is_wrapped)
            .should_retry_on(move |cause| {
                sink.lock().unwrap().push(cause.map(|c| c.to_string()));
                false
            })
            .build()
            .expect("builder");

        let _ = executor.execute(|| Err::<(), _>(Wrapped(Some(TestError("x".into())))));
        let _ = executor.execute(|| Err::<(), _>(Wrapped(None)));

        assert_eq!(*seen.lock().unwrap(), vec![Some("TestError: x".to_string()), None]);
    }

    #[test]
    fn nested_retries_stop_at_the_shared_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let nested = |calls: Arc<AtomicUsize>| {
            RetryExecutor::builder()
                .should_retry_on(|e| e.is_some_and(|e| e.is::<TestError>()))
                .next_delay(move |_| {
                    (calls.load(Ordering::SeqCst) < 3).then(TimeDelta::zero)
                })
                .with_sleeper(InstantSleeper)
                .build()
                .expect("builder")
        };
        let outer = nested(calls.clone());
        let inner = nested(calls.clone());

        let err = outer
            .execute(|| {
                inner.execute(|| {
                    assert!(calls.fetch_add(1, Ordering::SeqCst) < 3, "ran past the limit");
                    Err::<(), _>(TestError("external".into()))
                })
            })
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.is_retry_limit_exceeded());
        assert!(err.last_error().is_some_and(ExecutionError::is_retry_limit_exceeded));
        let cause = err.source().and_then(|limit| limit.source()).expect("cause");
        assert_eq!(cause.downcast_ref::<TestError>(), Some(&TestError("external".into())));
    }

    #[test]
    fn unwrap_and_handle_sees_through_retry_limits() {
        let inner: ExecutionError<TestError> = ExecutionError::RetryLimitExceeded(
            RetryLimitExceeded::new(2, TestError("busy".into()), 0),
        );
        let verdict = unwrap_and_handle(&inner, |_| false, |cause| {
            cause.and_then(|e| e.downcast_ref::<TestError>()).cloned()
        });
        assert_eq!(verdict, Some(TestError("busy".into())));
    }

    #[tokio::test]
    async fn async_retries_then_succeeds() {
        let executor = retry_all().build().expect("builder");
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let result = executor
            .execute_async(
                || {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(TestError("transient".into()))
                        } else {
                            Ok(42)
                        }
                    }
                },
                &token,
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn async_canceled_before_first_attempt() {
        let executor = retry_all().build().expect("builder");
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicUsize::new(0);

        let err = executor
            .execute_async(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, TestError>(()) }
                },
                &token,
            )
            .await
            .unwrap_err();

        assert!(err.is_canceled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn canceled_call_leaves_single_use_executor_unused() {
        let executor = retry_all().single_use(true).build().expect("builder");
        let canceled = CancellationToken::new();
        canceled.cancel();

        let err = executor
            .execute_async(|| async { Ok::<_, TestError>(()) }, &canceled)
            .await
            .unwrap_err();
        assert!(err.is_canceled());

        let result = executor
            .execute_async(|| async { Ok::<_, TestError>(7) }, &CancellationToken::new())
            .await;
        assert_eq!(result.unwrap(), 7);

        let err = executor
            .execute_async(|| async { Ok::<_, TestError>(()) }, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::AlreadyExecuted { .. }));
    }

    #[tokio::test]
    async fn async_transaction_check_precedes_cancellation() {
        let executor = retry_all().build().expect("builder");
        let token = CancellationToken::new();
        token.cancel();
        let _scope = TransactionScope::enter();

        let err = executor
            .execute_async(|| async { Ok::<_, TestError>(()) }, &token)
            .await
            .unwrap_err();

        assert!(err.is_existing_transaction());
    }

    #[tokio::test(start_paused = true)]
    async fn async_cancellation_interrupts_delay() {
        let executor = RetryExecutor::builder()
            .should_retry_on(|_| true)
            .delay_strategy(ConstantBackoff::new(TimeDelta::seconds(60)))
            .build()
            .expect("builder");
        let token = CancellationToken::new();
        let trigger = token.clone();
        let calls = Arc::new(AtomicUsize::new(0));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = executor
            .execute_async(
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(TestError("slow".into()))
                    }
                },
                &token,
            )
            .await
            .unwrap_err();

        assert!(err.is_canceled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn logs_retries_and_exhaustion() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let executor = retry_all()
            .name("logged")
            .delay_strategy(ConstantBackoff::new(TimeDelta::zero()).with_limit(1))
            .build()
            .expect("builder");
        let _ = executor.execute(|| Err::<(), _>(TestError("flaky".into())));

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("dbexec::retry"));
        assert!(logs.contains("retrying after transient failure"));
        assert!(logs.contains("retry limit exceeded"));
        assert!(logs.contains("strategy=logged"));
    }
}
