//! Tether library entry point.
//!
//! A resilient single-session database client for serverless workers.
//! Every connection carries a signed, self-expiring lease in its
//! database-visible session label; live clients renew their lease with
//! heartbeats and cooperatively terminate same-service sessions whose
//! lease expired (zombie connections left behind by frozen workers).
//!
//! The crate is driver-agnostic: implement [`SessionDriver`] and
//! [`Session`] over your wire driver of choice and hand the driver to
//! [`Client`]. The database side needs nothing beyond stock PostgreSQL
//! primitives (`pg_stat_activity`, advisory locks, `pg_terminate_backend`,
//! `set_config`).

#![warn(missing_docs)]

/// Client core: connect/query/close lifecycle and reconciliation.
pub mod client;
/// Recognized options and their validation.
pub mod config;
/// Error types surfaced to callers.
pub mod error;
/// Lifecycle observer hooks.
pub mod hooks;
/// Signed, self-expiring session leases.
pub mod lease;
/// Distributed zombie-connection reaper.
pub mod reaper;
/// Transient-error classification and decorrelated-jitter backoff.
pub mod retry;
/// Wire-driver seam.
pub mod session;
/// Injectable time source.
pub mod time;

pub use client::Client;
pub use client::ClientState;
pub use config::HeartbeatErrorMode;
pub use config::LeaseMode;
pub use config::ReaperErrorMode;
pub use config::TetherConfig;
pub use error::Result;
pub use error::TetherError;
pub use hooks::Hooks;
pub use lease::LeaseManager;
pub use lease::MAX_LABEL_LEN;
pub use lease::VerifiedLease;
pub use reaper::REAPER_LOCK_NAMESPACE;
pub use reaper::ReapOutcome;
pub use session::FatalEvent;
pub use session::FatalSource;
pub use session::QueryOutcome;
pub use session::Row;
pub use session::Session;
pub use session::SessionDriver;
pub use session::SessionError;
pub use session::SqlValue;
pub use time::Clock;
pub use time::SystemClock;
