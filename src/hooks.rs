//! Lifecycle observer hooks.
//!
//! Hooks are plain callbacks fired around connects, queries, heartbeats,
//! reaper passes, and death events. They run synchronously but off the hot
//! path (after the outcome is decided), must be short, and may not take the
//! client down: panics inside a hook are caught and discarded.

use std::panic;
use std::panic::AssertUnwindSafe;

use crate::reaper::ReapOutcome;
use crate::session::FatalSource;
use crate::session::SessionError;

/// Driver metadata attached to a death notice.
///
/// Extracted from the underlying [`SessionError`] so hook consumers never
/// hold the error itself alive.
#[derive(Debug, Clone, Default)]
pub struct ErrorMeta {
    /// Transport error name.
    pub code: Option<String>,
    /// Five-character SQLSTATE.
    pub sqlstate: Option<String>,
    /// OS error number.
    pub errno: Option<i32>,
    /// Failing syscall name.
    pub syscall: Option<String>,
    /// Remote address.
    pub address: Option<String>,
    /// Remote port.
    pub port: Option<u16>,
    /// Server-reported severity.
    pub severity: Option<String>,
    /// Server-side routine.
    pub routine: Option<String>,
}

impl From<&SessionError> for ErrorMeta {
    fn from(err: &SessionError) -> Self {
        Self {
            code: err.code.clone(),
            sqlstate: err.sqlstate.clone(),
            errno: err.errno,
            syscall: err.syscall.clone(),
            address: err.address.clone(),
            port: err.port,
            severity: err.severity.clone(),
            routine: err.routine.clone(),
        }
    }
}

/// A fresh session was installed.
#[derive(Debug, Clone)]
pub struct ConnectEvent {
    /// Generation the session was installed under.
    pub generation: u64,
}

/// A connect attempt failed transiently and will be retried.
#[derive(Debug, Clone)]
pub struct ReconnectEvent {
    /// Generation being connected.
    pub generation: u64,
    /// Attempts so far.
    pub retries: u32,
    /// Sleep before the next attempt.
    pub delay_ms: u64,
    /// The transient failure.
    pub error: SessionError,
}

/// A query is about to run.
#[derive(Debug, Clone)]
pub struct QueryStartEvent {
    /// Statement text.
    pub sql: String,
    /// Wall-clock start.
    pub started_at_ms: u64,
}

/// A query completed successfully.
#[derive(Debug, Clone)]
pub struct QueryEndEvent {
    /// Statement text.
    pub sql: String,
    /// Result row count.
    pub rows: usize,
    /// Total time including retries.
    pub duration_ms: u64,
}

/// A query failed for good.
#[derive(Debug, Clone)]
pub struct QueryErrorEvent {
    /// Statement text.
    pub sql: String,
    /// The terminal failure.
    pub error: SessionError,
    /// Total time including retries.
    pub duration_ms: u64,
}

/// A query attempt failed transiently and will be retried.
#[derive(Debug, Clone)]
pub struct QueryRetryEvent {
    /// Attempts so far.
    pub retries: u32,
    /// Sleep before the next attempt.
    pub delay_ms: u64,
    /// The transient failure.
    pub error: SessionError,
}

/// The lease was renewed over the live session.
#[derive(Debug, Clone)]
pub struct HeartbeatEvent {
    /// Generation the renewal was committed under.
    pub generation: u64,
}

/// A lease renewal attempt failed.
#[derive(Debug, Clone)]
pub struct HeartbeatFailEvent {
    /// Generation at failure time.
    pub generation: u64,
    /// What went wrong (driver error or timeout).
    pub error: SessionError,
}

/// A reaper pass finished.
#[derive(Debug, Clone)]
pub struct ReapEvent {
    /// Generation of the session the pass ran over.
    pub generation: u64,
    /// What the pass did.
    pub outcome: ReapOutcome,
    /// Pass duration.
    pub duration_ms: u64,
}

/// The underlying session died out from under the client.
#[derive(Debug, Clone)]
pub struct ClientDeadEvent {
    /// Which driver signal killed it.
    pub source: FatalSource,
    /// The error carried by the signal, if any.
    pub error: Option<SessionError>,
    /// Driver metadata extracted from the error.
    pub meta: ErrorMeta,
}

type Hook<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Named lifecycle callbacks. All optional.
#[derive(Default)]
pub struct Hooks {
    /// Fired after a session is installed.
    pub on_connect: Option<Hook<ConnectEvent>>,
    /// Fired before each connect retry sleep.
    pub on_reconnect: Option<Hook<ReconnectEvent>>,
    /// Fired as a query enters the client.
    pub on_query_start: Option<Hook<QueryStartEvent>>,
    /// Fired after a query succeeds.
    pub on_query_end: Option<Hook<QueryEndEvent>>,
    /// Fired when a query fails terminally.
    pub on_query_error: Option<Hook<QueryErrorEvent>>,
    /// Fired before each query retry sleep.
    pub on_query_retry: Option<Hook<QueryRetryEvent>>,
    /// Fired when a lease renewal commits.
    pub on_heartbeat: Option<Hook<HeartbeatEvent>>,
    /// Fired when a lease renewal fails.
    pub on_heartbeat_fail: Option<Hook<HeartbeatFailEvent>>,
    /// Fired after each completed reaper pass.
    pub on_reap: Option<Hook<ReapEvent>>,
    /// Fired when the current session dies out from under the client.
    pub on_client_dead: Option<Hook<ClientDeadEvent>>,
}

impl Hooks {
    /// No hooks registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the connect hook.
    pub fn on_connect(mut self, f: impl Fn(&ConnectEvent) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    /// Register the reconnect hook.
    pub fn on_reconnect(mut self, f: impl Fn(&ReconnectEvent) + Send + Sync + 'static) -> Self {
        self.on_reconnect = Some(Box::new(f));
        self
    }

    /// Register the query-start hook.
    pub fn on_query_start(mut self, f: impl Fn(&QueryStartEvent) + Send + Sync + 'static) -> Self {
        self.on_query_start = Some(Box::new(f));
        self
    }

    /// Register the query-end hook.
    pub fn on_query_end(mut self, f: impl Fn(&QueryEndEvent) + Send + Sync + 'static) -> Self {
        self.on_query_end = Some(Box::new(f));
        self
    }

    /// Register the query-error hook.
    pub fn on_query_error(mut self, f: impl Fn(&QueryErrorEvent) + Send + Sync + 'static) -> Self {
        self.on_query_error = Some(Box::new(f));
        self
    }

    /// Register the query-retry hook.
    pub fn on_query_retry(mut self, f: impl Fn(&QueryRetryEvent) + Send + Sync + 'static) -> Self {
        self.on_query_retry = Some(Box::new(f));
        self
    }

    /// Register the heartbeat hook.
    pub fn on_heartbeat(mut self, f: impl Fn(&HeartbeatEvent) + Send + Sync + 'static) -> Self {
        self.on_heartbeat = Some(Box::new(f));
        self
    }

    /// Register the heartbeat-failure hook.
    pub fn on_heartbeat_fail(
        mut self,
        f: impl Fn(&HeartbeatFailEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_heartbeat_fail = Some(Box::new(f));
        self
    }

    /// Register the reap hook.
    pub fn on_reap(mut self, f: impl Fn(&ReapEvent) + Send + Sync + 'static) -> Self {
        self.on_reap = Some(Box::new(f));
        self
    }

    /// Register the client-dead hook.
    pub fn on_client_dead(mut self, f: impl Fn(&ClientDeadEvent) + Send + Sync + 'static) -> Self {
        self.on_client_dead = Some(Box::new(f));
        self
    }

    /// Fire one hook, isolating the client from panics inside it.
    pub(crate) fn fire<T>(hook: &Option<Hook<T>>, event: &T) {
        if let Some(f) = hook {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| f(event)));
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_reconnect", &self.on_reconnect.is_some())
            .field("on_query_start", &self.on_query_start.is_some())
            .field("on_query_end", &self.on_query_end.is_some())
            .field("on_query_error", &self.on_query_error.is_some())
            .field("on_query_retry", &self.on_query_retry.is_some())
            .field("on_heartbeat", &self.on_heartbeat.is_some())
            .field("on_heartbeat_fail", &self.on_heartbeat_fail.is_some())
            .field("on_reap", &self.on_reap.is_some())
            .field("on_client_dead", &self.on_client_dead.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    #[test]
    fn test_fire_invokes_hook() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let hooks = Hooks::new().on_connect(move |ev| {
            assert_eq!(ev.generation, 7);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        Hooks::fire(&hooks.on_connect, &ConnectEvent { generation: 7 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fire_swallows_panics() {
        let hooks = Hooks::new().on_connect(|_| panic!("observer bug"));
        Hooks::fire(&hooks.on_connect, &ConnectEvent { generation: 1 });
    }

    #[test]
    fn test_fire_on_absent_hook_is_noop() {
        let hooks = Hooks::new();
        Hooks::fire(&hooks.on_connect, &ConnectEvent { generation: 1 });
    }
}
