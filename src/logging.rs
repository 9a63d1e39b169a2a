//! Human-readable command log, produced by an interceptor.
//!
//! Output for one command:
//!
//! ```text
//! update Orders set Total = @p0 where Id = @p1
//! -- p0: '7.7' (Type = Decimal, Precision = 18, Scale = 2)
//! -- p1: '42' (Type = Int32, IsNullable = false)
//! -- Executing at 2024-05-01 10:15:02 +00:00
//! -- Completed in 3 ms with result: 1
//!
//! ```
//!
//! The writer is called once per line and every line carries the platform line terminator.
//! Start times are kept per interception context, so one formatter can time overlapping
//! commands.

use crate::clock::{Clock, MonotonicClock};
use crate::command::{
    Command, CommandError, CommandInterceptionContext, CommandInterceptor, DataReader,
    NonQueryContext, Parameter, ParameterDirection, ReaderContext, ScalarContext, Value,
};
use crate::interception::{InterceptionContext, TaskStatus};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Line terminator appended to every emitted line.
#[cfg(windows)]
pub const LINE_ENDING: &str = "\r\n";
/// Line terminator appended to every emitted line.
#[cfg(not(windows))]
pub const LINE_ENDING: &str = "\n";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S %:z";

type LineWriter = Arc<dyn Fn(&str) + Send + Sync>;

/// How a command result is rendered in the log.
pub trait LoggedResult {
    fn describe(&self) -> String;
}

impl LoggedResult for u64 {
    fn describe(&self) -> String {
        self.to_string()
    }
}

impl LoggedResult for Value {
    fn describe(&self) -> String {
        self.to_string()
    }
}

impl LoggedResult for Arc<dyn DataReader> {
    fn describe(&self) -> String {
        self.kind().to_string()
    }
}

/// Interceptor that writes each command, its parameters, and its outcome to a line sink.
pub struct CommandLogFormatter {
    writer: LineWriter,
    context_tag: Option<String>,
    clock: Arc<dyn Clock>,
    started_at: Mutex<HashMap<usize, u64>>,
    elapsed: AtomicU64,
}

impl fmt::Debug for CommandLogFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandLogFormatter")
            .field("context_tag", &self.context_tag)
            .field("clock", &self.clock)
            .field("writer", &"<writer>")
            .finish()
    }
}

impl CommandLogFormatter {
    pub fn new<W>(writer: W) -> Self
    where
        W: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            writer: Arc::new(writer),
            context_tag: None,
            clock: Arc::new(MonotonicClock::default()),
            started_at: Mutex::new(HashMap::new()),
            elapsed: AtomicU64::new(0),
        }
    }

    /// Formatter that forwards every non-empty line to `tracing` at info level.
    pub fn tracing() -> Self {
        Self::new(|line: &str| {
            let line = line.trim_end_matches(LINE_ENDING);
            if !line.is_empty() {
                info!(target: "dbexec::command_log", "{}", line);
            }
        })
    }

    /// Only log commands issued under `tag`.
    pub fn for_context(mut self, tag: impl Into<String>) -> Self {
        self.context_tag = Some(tag.into());
        self
    }

    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Milliseconds the most recently finished command took.
    pub fn elapsed_millis(&self) -> u64 {
        self.elapsed.load(Ordering::SeqCst)
    }

    /// Log the command text, its parameters, and the start marker.
    pub fn log_command(&self, command: &dyn Command, context: &CommandInterceptionContext) {
        match command.text() {
            Some(text) if text.ends_with(LINE_ENDING) => (self.writer)(text),
            Some(text) => self.write_line(text),
            None => self.write_line("<null>"),
        }
        for parameter in command.parameters() {
            self.log_parameter(parameter);
        }
        let now = chrono::Local::now().format(TIMESTAMP_FORMAT);
        if context.is_async() {
            self.write_line(&format!("-- Executing asynchronously at {}", now));
        } else {
            self.write_line(&format!("-- Executing at {}", now));
        }
    }

    pub fn log_parameter(&self, parameter: &Parameter) {
        let mut line = format!(
            "-- {}: '{}' (Type = {}",
            parameter.name, parameter.value, parameter.db_type
        );
        if parameter.direction != ParameterDirection::Input {
            line.push_str(&format!(", Direction = {}", parameter.direction));
        }
        if !parameter.is_nullable {
            line.push_str(", IsNullable = false");
        }
        if parameter.size != 0 {
            line.push_str(&format!(", Size = {}", parameter.size));
        }
        if parameter.precision != 0 {
            line.push_str(&format!(", Precision = {}", parameter.precision));
        }
        if parameter.scale != 0 {
            line.push_str(&format!(", Scale = {}", parameter.scale));
        }
        line.push(')');
        self.write_line(&line);
    }

    /// Log the outcome followed by an empty line.
    pub fn log_result<T: LoggedResult>(&self, interception: &InterceptionContext<T, CommandError>) {
        self.log_outcome(interception, self.elapsed_millis());
    }

    fn log_outcome<T: LoggedResult>(
        &self,
        interception: &InterceptionContext<T, CommandError>,
        elapsed: u64,
    ) {
        if interception.task_status() == Some(TaskStatus::Canceled) {
            self.write_line(&format!("-- Canceled in {} ms", elapsed));
        } else if let Some(err) = interception.exception() {
            self.write_line(&format!("-- Failed in {} ms with error: {}", elapsed, err));
        } else {
            let result =
                interception.result().map_or_else(|| "null".to_string(), LoggedResult::describe);
            self.write_line(&format!("-- Completed in {} ms with result: {}", elapsed, result));
        }
        self.write_line("");
    }

    fn executing<T>(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &InterceptionContext<T, CommandError>,
    ) {
        if !self.should_log(context) {
            return;
        }
        let now = self.clock.now_millis();
        self.started().insert(dispatch_key(interception), now);
        self.log_command(command, context);
    }

    fn executed<T: LoggedResult>(
        &self,
        context: &CommandInterceptionContext,
        interception: &InterceptionContext<T, CommandError>,
    ) {
        if !self.should_log(context) {
            return;
        }
        let now = self.clock.now_millis();
        let started = self.started().remove(&dispatch_key(interception)).unwrap_or(now);
        let elapsed = now.saturating_sub(started);
        self.elapsed.store(elapsed, Ordering::SeqCst);
        self.log_outcome(interception, elapsed);
    }

    fn started(&self) -> MutexGuard<'_, HashMap<usize, u64>> {
        self.started_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_log(&self, context: &CommandInterceptionContext) -> bool {
        match &self.context_tag {
            Some(tag) => context.context_tag() == Some(tag.as_str()),
            None => true,
        }
    }

    fn write_line(&self, line: &str) {
        (self.writer)(&format!("{}{}", line, LINE_ENDING));
    }
}

// A context stays at one address for the whole of its dispatch.
fn dispatch_key<T>(interception: &InterceptionContext<T, CommandError>) -> usize {
    interception as *const InterceptionContext<T, CommandError> as usize
}

impl CommandInterceptor for CommandLogFormatter {
    fn non_query_executing(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &mut NonQueryContext,
    ) -> Result<(), CommandError> {
        self.executing(command, context, interception);
        Ok(())
    }

    fn non_query_executed(
        &self,
        _command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &mut NonQueryContext,
    ) -> Result<(), CommandError> {
        self.executed(context, interception);
        Ok(())
    }

    fn scalar_executing(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &mut ScalarContext,
    ) -> Result<(), CommandError> {
        self.executing(command, context, interception);
        Ok(())
    }

    fn scalar_executed(
        &self,
        _command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &mut ScalarContext,
    ) -> Result<(), CommandError> {
        self.executed(context, interception);
        Ok(())
    }

    fn reader_executing(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &mut ReaderContext,
    ) -> Result<(), CommandError> {
        self.executing(command, context, interception);
        Ok(())
    }

    fn reader_executed(
        &self,
        _command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &mut ReaderContext,
    ) -> Result<(), CommandError> {
        self.executed(context, interception);
        Ok(())
    }
}
