//! Transient-error classification and decorrelated-jitter backoff.
//!
//! Connect and query retry loops both lean on this module: classification
//! decides whether an attempt may be retried at all, backoff decides how
//! long to sleep before it is.

use rand::Rng;

use crate::session::SessionError;

/// Transport-level error codes that indicate a retryable network condition.
pub const TRANSIENT_TRANSPORT_CODES: [&str; 9] = [
    "ECONNRESET",
    "EPIPE",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ENETUNREACH",
    "EHOSTUNREACH",
    "EAI_AGAIN",
    "ECONNABORTED",
    "EADDRINUSE",
];

/// Admin-initiated termination, crash shutdown, cannot-connect-now, and
/// too-many-connections.
const TRANSIENT_SQLSTATES: [&str; 4] = ["57P01", "57P02", "57P03", "53300"];

/// Driver messages that carry no code but still mean the connection is gone.
const TRANSIENT_MESSAGE_MARKERS: [&str; 2] =
    ["Connection terminated unexpectedly", "sorry, too many clients already"];

/// Classify a driver error as retryable or not.
///
/// Serialization failures (40001, 40P01) are deliberately non-transient:
/// retrying them inside the client would risk duplicating non-idempotent
/// writes. Integrity violations (23xxx) and syntax errors (42xxx) fall out
/// the same way.
pub fn is_transient(err: &SessionError) -> bool {
    if let Some(code) = &err.code {
        if TRANSIENT_TRANSPORT_CODES.contains(&code.as_str()) {
            return true;
        }
    }
    if let Some(state) = &err.sqlstate {
        // Class 08: connection exception.
        if state.starts_with("08") {
            return true;
        }
        if TRANSIENT_SQLSTATES.contains(&state.as_str()) {
            return true;
        }
    }
    TRANSIENT_MESSAGE_MARKERS.iter().any(|marker| err.message.contains(marker))
}

/// Per-operation-class backoff memory for decorrelated jitter.
///
/// `next_delay_ms` draws `min(cap, uniform(base, prev * 3))`, where `prev`
/// starts at `base` on the first retry. Connect and query each own one of
/// these; success resets it.
#[derive(Debug, Clone)]
pub struct BackoffState {
    base_ms: u64,
    cap_ms: u64,
    prev_ms: u64,
}

impl BackoffState {
    /// New state with no retry history. Requires `base_ms <= cap_ms`
    /// (enforced by config validation).
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self { base_ms, cap_ms, prev_ms: 0 }
    }

    /// Draw the next delay and remember it for the following draw.
    pub fn next_delay_ms(&mut self) -> u64 {
        let prev = if self.prev_ms == 0 { self.base_ms } else { self.prev_ms };
        let upper = prev.saturating_mul(3);
        let delay = rand::rng().random_range(self.base_ms..=upper).min(self.cap_ms);
        self.prev_ms = delay;
        delay
    }

    /// Forget retry history after a successful attempt.
    pub fn reset(&mut self) {
        self.prev_ms = 0;
    }
}
