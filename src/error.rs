//! Error types for the client.

use snafu::Snafu;

use crate::session::SessionError;

/// Errors surfaced to callers of [`crate::Client`].
///
/// Transient driver errors are absorbed by the connect/query retry loops
/// and only appear here once a budget is exhausted; permanent driver errors
/// surface immediately as [`TetherError::Database`]. Fatal session events
/// never surface directly; they mark the client dead and the next call
/// reconnects or raises its own error.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TetherError {
    /// Invalid configuration, rejected before any I/O.
    #[snafu(display("invalid configuration: {message}"))]
    Config {
        /// What was wrong with the supplied options.
        message: String,
    },

    /// An internal invariant would be violated; always a bug, never retried.
    #[snafu(display("invariant violation: {message}"))]
    InvariantViolation {
        /// The invariant that failed.
        message: String,
    },

    /// Permanent database error, raised without retry.
    #[snafu(display("database error: {source}"))]
    Database {
        /// The underlying driver error.
        source: SessionError,
    },

    /// Retry budget exhausted; carries the last transient error observed.
    #[snafu(display("retries exhausted after {attempts} attempt(s): {source}"))]
    RetriesExhausted {
        /// Attempts performed before giving up.
        attempts: u32,
        /// The last transient error.
        source: SessionError,
    },

    /// Heartbeat failed and `heartbeat_error_mode` is `Throw`.
    #[snafu(display("lease heartbeat failed: {source}"))]
    Heartbeat {
        /// The underlying driver or timeout error.
        source: SessionError,
    },

    /// Reaper pass failed and `reaper_error_mode` is `Throw`.
    #[snafu(display("reaper pass failed: {source}"))]
    Reap {
        /// The underlying driver error.
        source: SessionError,
    },

    /// The client was explicitly closed; no further operations are accepted.
    #[snafu(display("client is closed"))]
    Closed,
}

pub type Result<T, E = TetherError> = std::result::Result<T, E>;
