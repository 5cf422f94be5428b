//! Wire-driver seam.
//!
//! `tether` never speaks the database wire protocol itself. It drives a
//! [`Session`] obtained from a [`SessionDriver`], which any driver crate can
//! implement: the contract is parameterized SQL execution, a fatal-event
//! stream for asynchronous termination, and graceful shutdown. The
//! `tether-testing` crate ships a scripted implementation for tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A parameter or result value crossing the driver seam.
///
/// Only the shapes the client itself binds or reads are modeled; drivers
/// may map richer types on their own API surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// Any integer width; drivers narrow as needed.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// Text.
    Text(String),
    /// `int4[]` parameter, used for the reaper's pid batch.
    IntArray(Vec<i32>),
}

/// One result row, positionally indexed.
#[derive(Debug, Clone, Default)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    /// Build a row from its column values, left to right.
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    /// Raw value at `idx`.
    pub fn get(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }

    /// Integer at `idx`, if present and integral.
    pub fn as_i64(&self, idx: usize) -> Option<i64> {
        match self.values.get(idx) {
            Some(SqlValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Float at `idx`; integers widen.
    pub fn as_f64(&self, idx: usize) -> Option<f64> {
        match self.values.get(idx) {
            Some(SqlValue::Float(v)) => Some(*v),
            Some(SqlValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    /// Boolean at `idx`.
    pub fn as_bool(&self, idx: usize) -> Option<bool> {
        match self.values.get(idx) {
            Some(SqlValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// Text at `idx`.
    pub fn as_str(&self, idx: usize) -> Option<&str> {
        match self.values.get(idx) {
            Some(SqlValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// Result of one `execute` call.
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    /// Result rows, if the statement produced any.
    pub rows: Vec<Row>,
    /// Rows written by a data-modifying statement.
    pub rows_affected: u64,
}

impl QueryOutcome {
    /// Outcome carrying only result rows.
    pub fn rows(rows: Vec<Row>) -> Self {
        Self { rows, rows_affected: 0 }
    }
}

/// Error surfaced by a driver, carrying whatever the wire exposed.
///
/// `code` is the transport-level error name (`ECONNRESET`, ...), `sqlstate`
/// the five-character SQLSTATE. Both are optional; classification in
/// [`crate::retry`] treats absent fields as non-matching.
#[derive(Debug, Clone, Default)]
pub struct SessionError {
    /// Human-readable description.
    pub message: String,
    /// Transport error name (`ECONNRESET`, ...).
    pub code: Option<String>,
    /// Five-character SQLSTATE.
    pub sqlstate: Option<String>,
    /// OS error number, when the failure came from a syscall.
    pub errno: Option<i32>,
    /// Failing syscall name.
    pub syscall: Option<String>,
    /// Remote address involved, if known.
    pub address: Option<String>,
    /// Remote port involved, if known.
    pub port: Option<u16>,
    /// Server-reported severity (`FATAL`, `ERROR`, ...).
    pub severity: Option<String>,
    /// Server-side routine that raised the error.
    pub routine: Option<String>,
}

impl SessionError {
    /// Socket-level failure identified by a transport code name.
    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Server-side failure identified by SQLSTATE.
    pub fn sqlstate(state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sqlstate: Some(state.into()),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Failure with nothing but a message.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " ({code})")?;
        }
        if let Some(state) = &self.sqlstate {
            write!(f, " [{state}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for SessionError {}

/// Where a fatal event originated on the driver side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalSource {
    /// The driver raised an asynchronous error on the session.
    Error,
    /// The session ended without a preceding error.
    End,
}

impl fmt::Display for FatalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalSource::Error => write!(f, "error"),
            FatalSource::End => write!(f, "end"),
        }
    }
}

/// Asynchronous session-termination notice.
#[derive(Debug, Clone)]
pub struct FatalEvent {
    /// Which driver signal produced the event.
    pub source: FatalSource,
    /// The error carried by an `Error`-sourced event.
    pub error: Option<SessionError>,
}

/// One live database session.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Execute parameterized SQL. Interpolation is never used by the client;
    /// every dynamic value arrives through `params`.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome, SessionError>;

    /// Hand over the fatal-event stream (driver errors, server-side
    /// termination, socket end). The channel exists from session
    /// construction, so events raised during the connect handshake are
    /// buffered and not lost. Yields the receiver exactly once; later
    /// calls return `None`.
    fn take_fatal_events(&self) -> Option<mpsc::UnboundedReceiver<FatalEvent>>;

    /// Gracefully shut the session down. Idempotent.
    async fn close(&self);
}

/// Factory for sessions.
#[async_trait]
pub trait SessionDriver: Send + Sync + 'static {
    /// Concrete session type this driver produces.
    type Session: Session;

    /// Open a session whose startup identity carries `application_name`
    /// as its database-visible session label.
    async fn connect(&self, application_name: &str) -> Result<Arc<Self::Session>, SessionError>;
}

#[async_trait]
impl<D: SessionDriver + ?Sized> SessionDriver for Arc<D> {
    type Session = D::Session;

    async fn connect(&self, application_name: &str) -> Result<Arc<Self::Session>, SessionError> {
        D::connect(self, application_name).await
    }
}
