//! Typed command pipeline built on [`InterceptorDispatcher`](crate::InterceptorDispatcher).
//!
//! Commands are opaque collaborators supplied by the caller through the [`Command`] trait; this
//! module only defines the shapes interceptors and the log formatter need to see.

mod dispatcher;

pub use dispatcher::CommandDispatcher;

use crate::interception::InterceptionContext;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// A scalar value bound to a parameter or returned by a scalar command.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact decimal in its textual form.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Decimal(d) => f.write_str(d),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(bytes) => {
                f.write_str("0x")?;
                bytes.iter().try_for_each(|b| write!(f, "{:02X}", b))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Declared store type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DbType {
    AnsiString,
    Binary,
    Boolean,
    Byte,
    Currency,
    Date,
    DateTime,
    DateTimeOffset,
    Decimal,
    Double,
    Guid,
    Int16,
    Int32,
    Int64,
    Single,
    #[default]
    String,
    Time,
    Xml,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::AnsiString => "AnsiString",
            DbType::Binary => "Binary",
            DbType::Boolean => "Boolean",
            DbType::Byte => "Byte",
            DbType::Currency => "Currency",
            DbType::Date => "Date",
            DbType::DateTime => "DateTime",
            DbType::DateTimeOffset => "DateTimeOffset",
            DbType::Decimal => "Decimal",
            DbType::Double => "Double",
            DbType::Guid => "Guid",
            DbType::Int16 => "Int16",
            DbType::Int32 => "Int32",
            DbType::Int64 => "Int64",
            DbType::Single => "Single",
            DbType::String => "String",
            DbType::Time => "Time",
            DbType::Xml => "Xml",
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl fmt::Display for ParameterDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParameterDirection::Input => "Input",
            ParameterDirection::Output => "Output",
            ParameterDirection::InputOutput => "InputOutput",
            ParameterDirection::ReturnValue => "ReturnValue",
        })
    }
}

/// How a reader command should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandBehavior {
    #[default]
    Default,
    SingleResult,
    SchemaOnly,
    KeyInfo,
    SingleRow,
    SequentialAccess,
    CloseConnection,
}

/// A command parameter as seen by interceptors.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub direction: ParameterDirection,
    pub is_nullable: bool,
    pub db_type: DbType,
    /// `0` means unset; `-1` conventionally means "max".
    pub size: i32,
    pub precision: u8,
    pub scale: u8,
    pub value: Value,
}

impl Parameter {
    /// Nullable input parameter with no size, precision or scale.
    pub fn new(name: impl Into<String>, db_type: DbType, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            direction: ParameterDirection::Input,
            is_nullable: true,
            db_type,
            size: 0,
            precision: 0,
            scale: 0,
            value: value.into(),
        }
    }

    pub fn with_direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn nullable(mut self, is_nullable: bool) -> Self {
        self.is_nullable = is_nullable;
        self
    }

    pub fn with_size(mut self, size: i32) -> Self {
        self.size = size;
        self
    }

    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_scale(mut self, scale: u8) -> Self {
        self.scale = scale;
        self
    }
}

/// Result set handle produced by a reader command.
pub trait DataReader: fmt::Debug + Send + Sync {
    /// Short type name used in logs.
    fn kind(&self) -> &str;
}

/// Failures of command execution.
#[derive(Debug, Clone)]
pub enum CommandError {
    /// The server rejected the command with a numbered error.
    Database { code: i32, message: String },
    Timeout,
    Connection(String),
    /// Wrapper raised while saving changes; the cause, if any, is its `source()`.
    Update { message: String, inner: Option<Arc<dyn Error + Send + Sync>> },
    Canceled,
    /// An interceptor rejected the command.
    Interceptor(String),
}

impl CommandError {
    pub fn database(code: i32, message: impl Into<String>) -> Self {
        CommandError::Database { code, message: message.into() }
    }

    pub fn update<E>(message: impl Into<String>, inner: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        CommandError::Update { message: message.into(), inner: Some(Arc::new(inner)) }
    }

    /// Wrapper predicate suitable for `RetryExecutorBuilder::unwrap_with`.
    pub fn is_wrapper(err: &(dyn Error + 'static)) -> bool {
        matches!(err.downcast_ref::<CommandError>(), Some(CommandError::Update { .. }))
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Database { code, message } => {
                write!(f, "database error {}: {}", code, message)
            }
            CommandError::Timeout => write!(f, "command timed out"),
            CommandError::Connection(msg) => write!(f, "connection failure: {}", msg),
            CommandError::Update { message, .. } => f.write_str(message),
            CommandError::Canceled => write!(f, "command was canceled"),
            CommandError::Interceptor(msg) => write!(f, "interceptor failed: {}", msg),
        }
    }
}

impl Error for CommandError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CommandError::Update { inner, .. } => {
                inner.as_deref().map(|e| e as &(dyn Error + 'static))
            }
            _ => None,
        }
    }
}

/// A command the caller can execute against a store.
///
/// The async methods default to the blocking ones.
#[async_trait]
pub trait Command: Send + Sync {
    /// `None` when the command has no text.
    fn text(&self) -> Option<&str>;

    fn parameters(&self) -> &[Parameter];

    fn execute_non_query(&self) -> Result<u64, CommandError>;

    fn execute_scalar(&self) -> Result<Value, CommandError>;

    fn execute_reader(&self, behavior: CommandBehavior)
        -> Result<Arc<dyn DataReader>, CommandError>;

    async fn execute_non_query_async(&self) -> Result<u64, CommandError> {
        self.execute_non_query()
    }

    async fn execute_scalar_async(&self) -> Result<Value, CommandError> {
        self.execute_scalar()
    }

    async fn execute_reader_async(
        &self,
        behavior: CommandBehavior,
    ) -> Result<Arc<dyn DataReader>, CommandError> {
        self.execute_reader(behavior)
    }
}

/// Caller-supplied template for one dispatch. Dispatch never mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandInterceptionContext {
    is_async: bool,
    behavior: CommandBehavior,
    context_tag: Option<String>,
}

impl CommandInterceptionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of this context marked as asynchronous.
    pub fn as_async(&self) -> Self {
        Self { is_async: true, ..self.clone() }
    }

    pub fn with_behavior(mut self, behavior: CommandBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Tag identifying the unit of work issuing commands; used by log filters.
    pub fn with_context_tag(mut self, tag: impl Into<String>) -> Self {
        self.context_tag = Some(tag.into());
        self
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn behavior(&self) -> CommandBehavior {
        self.behavior
    }

    pub fn context_tag(&self) -> Option<&str> {
        self.context_tag.as_deref()
    }
}

pub type NonQueryContext = InterceptionContext<u64, CommandError>;
pub type ScalarContext = InterceptionContext<Value, CommandError>;
pub type ReaderContext = InterceptionContext<Arc<dyn DataReader>, CommandError>;

/// Observer of command execution. Every hook defaults to doing nothing.
#[allow(unused_variables)]
pub trait CommandInterceptor: Send + Sync {
    fn non_query_executing(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &mut NonQueryContext,
    ) -> Result<(), CommandError> {
        Ok(())
    }

    fn non_query_executed(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &mut NonQueryContext,
    ) -> Result<(), CommandError> {
        Ok(())
    }

    fn scalar_executing(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &mut ScalarContext,
    ) -> Result<(), CommandError> {
        Ok(())
    }

    fn scalar_executed(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &mut ScalarContext,
    ) -> Result<(), CommandError> {
        Ok(())
    }

    fn reader_executing(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &mut ReaderContext,
    ) -> Result<(), CommandError> {
        Ok(())
    }

    fn reader_executed(
        &self,
        command: &dyn Command,
        context: &CommandInterceptionContext,
        interception: &mut ReaderContext,
    ) -> Result<(), CommandError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_display() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::from("Not Null").to_string(), "Not Null");
        assert_eq!(Value::Decimal("7.7".into()).to_string(), "7.7");
        assert_eq!(Value::Bytes(vec![0x0a, 0xff]).to_string(), "0x0AFF");
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(3i64)), Value::Int(3));
    }

    #[test]
    fn parameter_defaults_to_nullable_input() {
        let p = Parameter::new("Param1", DbType::String, "value");
        assert_eq!(p.direction, ParameterDirection::Input);
        assert!(p.is_nullable);
        assert_eq!((p.size, p.precision, p.scale), (0, 0, 0));
    }

    #[test]
    fn update_error_exposes_inner_as_source() {
        let err = CommandError::update("save failed", CommandError::database(1205, "deadlock"));
        assert!(CommandError::is_wrapper(&err));
        let inner = err.source().and_then(|e| e.downcast_ref::<CommandError>());
        assert!(matches!(inner, Some(CommandError::Database { code: 1205, .. })));
    }

    #[test]
    fn only_update_is_a_wrapper() {
        assert!(!CommandError::is_wrapper(&CommandError::Timeout));
        assert!(!CommandError::is_wrapper(&std::fmt::Error));
        let empty = CommandError::Update { message: "m".into(), inner: None };
        assert!(CommandError::is_wrapper(&empty));
        assert!(empty.source().is_none());
    }

    #[test]
    fn async_template_is_a_copy() {
        let base = CommandInterceptionContext::new()
            .with_behavior(CommandBehavior::SequentialAccess)
            .with_context_tag("orders");
        let copy = base.as_async();
        assert!(copy.is_async());
        assert!(!base.is_async());
        assert_eq!(copy.behavior(), CommandBehavior::SequentialAccess);
        assert_eq!(copy.context_tag(), Some("orders"));
    }
}
