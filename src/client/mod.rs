//! Client core: connect/query/close lifecycle over one leased session.
//!
//! The client owns at most one underlying session and reconciles every
//! asynchronous path against it with a generation counter:
//!
//! - connect bumps the generation and installs a session only if no newer
//!   generation started while its handshake was in flight;
//! - fatal driver events bump the generation and detach the session if it
//!   is still the current one;
//! - heartbeats capture `(generation, session)` at launch and only commit
//!   a renewed expiry if both still match at completion.
//!
//! Suspension points are the connect handshake, queries, backoff sleeps,
//! the heartbeat race, reaper passes, and session close. State mutation
//! between suspension points happens under short non-async locks.

mod heartbeat;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use snafu::ResultExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use crate::config::TetherConfig;
use crate::error::ClosedSnafu;
use crate::error::DatabaseSnafu;
use crate::error::Result;
use crate::error::RetriesExhaustedSnafu;
use crate::hooks::ClientDeadEvent;
use crate::hooks::ConnectEvent;
use crate::hooks::ErrorMeta;
use crate::hooks::Hooks;
use crate::hooks::QueryEndEvent;
use crate::hooks::QueryErrorEvent;
use crate::hooks::QueryRetryEvent;
use crate::hooks::QueryStartEvent;
use crate::hooks::ReapEvent;
use crate::hooks::ReconnectEvent;
use crate::lease::LeaseManager;
use crate::lease::MAX_LABEL_LEN;
use crate::lease::sanitize;
use crate::reaper::ReapOutcome;
use crate::reaper::Reaper;
use crate::reaper::ReaperSchedule;
use crate::retry::BackoffState;
use crate::retry::is_transient;
use crate::session::FatalEvent;
use crate::session::QueryOutcome;
use crate::session::Session;
use crate::session::SessionDriver;
use crate::session::SessionError;
use crate::session::SqlValue;
use crate::time::Clock;
use crate::time::SystemClock;

/// Observable client state, derived from the live flags.
///
/// Connecting is a phase inside `connect()` and is not observable from
/// outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No session yet.
    Idle,
    /// A session is installed and believed healthy.
    Connected,
    /// The session died or was disposed; the next call reconnects.
    Dead,
    /// `close()` was called; every further operation fails.
    Closed,
}

/// The one mutable slot everything reconciles against.
struct SessionSlot<S> {
    session: Option<Arc<S>>,
    dead: bool,
    lease_expires_at_ms: u64,
}

impl<S> Default for SessionSlot<S> {
    fn default() -> Self {
        Self { session: None, dead: false, lease_expires_at_ms: 0 }
    }
}

pub(crate) struct ClientInner<D: SessionDriver> {
    /// Self-reference for the detached tasks this client spawns
    /// (fatal-event listeners, heartbeat flights, reaper passes).
    this: Weak<ClientInner<D>>,
    driver: D,
    pub(crate) config: TetherConfig,
    pub(crate) hooks: Hooks,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) leases: Option<Arc<LeaseManager>>,
    reaper: Option<Reaper>,
    pub(crate) generation: AtomicU64,
    closed: AtomicBool,
    slot: StdMutex<SessionSlot<D::Session>>,
    /// Serializes connects (single-flight) and carries connect backoff
    /// memory across them.
    connect_gate: AsyncMutex<BackoffState>,
    query_backoff: StdMutex<BackoffState>,
    pub(crate) heartbeat_flight:
        StdMutex<Option<watch::Receiver<Option<std::result::Result<(), SessionError>>>>>,
    reaper_schedule: StdMutex<ReaperSchedule>,
}

/// Leased single-session database client.
///
/// Cheap to clone; clones share the same underlying session and state.
pub struct Client<D: SessionDriver> {
    inner: Arc<ClientInner<D>>,
}

impl<D: SessionDriver> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<D: SessionDriver> std::fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// Take a std mutex without propagating poisoning; the guarded state stays
/// consistent because every critical section is short and panic-free.
pub(crate) fn relock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<D: SessionDriver> Client<D> {
    /// Build a client with default hooks and the system clock.
    pub fn new(driver: D, config: TetherConfig) -> Result<Self> {
        Self::with_parts(driver, config, Hooks::default(), Arc::new(SystemClock))
    }

    /// Build a client with explicit hooks.
    pub fn with_hooks(driver: D, config: TetherConfig, hooks: Hooks) -> Result<Self> {
        Self::with_parts(driver, config, hooks, Arc::new(SystemClock))
    }

    /// Fully explicit construction; the injectable clock is what the
    /// deterministic tests use.
    pub fn with_parts(
        driver: D,
        config: TetherConfig,
        hooks: Hooks,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let leases = if config.leasing_enabled() {
            let instance_id = config.instance_id.clone().unwrap_or_else(default_instance_id);
            Some(Arc::new(LeaseManager::from_config(&config, &instance_id, clock.clone())?))
        } else {
            None
        };
        let reaper = match (&leases, config.reaper) {
            (Some(leases), true) => Some(Reaper::new(leases.clone(), &config)),
            _ => None,
        };

        let connect_backoff = BackoffState::new(config.min_backoff_ms, config.max_backoff_ms);
        let query_backoff = BackoffState::new(config.min_backoff_ms, config.max_backoff_ms);
        let schedule = ReaperSchedule::new(config.reaper_cooldown_ms);

        let inner = Arc::new_cyclic(|this| ClientInner {
            this: this.clone(),
            driver,
            hooks,
            clock,
            leases,
            reaper,
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            slot: StdMutex::new(SessionSlot::default()),
            connect_gate: AsyncMutex::new(connect_backoff),
            query_backoff: StdMutex::new(query_backoff),
            heartbeat_flight: StdMutex::new(None),
            reaper_schedule: StdMutex::new(schedule),
            config,
        });
        Ok(Self { inner })
    }

    /// Current reconciliation generation. Non-decreasing.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Derived lifecycle state.
    pub fn state(&self) -> ClientState {
        if self.inner.closed.load(Ordering::SeqCst) {
            return ClientState::Closed;
        }
        let slot = relock(&self.inner.slot);
        match (&slot.session, slot.dead) {
            (_, true) => ClientState::Dead,
            (Some(_), false) => ClientState::Connected,
            (None, false) => ClientState::Idle,
        }
    }

    /// Millisecond expiry of the current lease; 0 when leasing is disabled
    /// or nothing is connected.
    pub fn lease_expires_at_ms(&self) -> u64 {
        relock(&self.inner.slot).lease_expires_at_ms
    }

    /// Establish the underlying session.
    ///
    /// Idempotent and single-flight: when already connected this is a
    /// no-op, and concurrent callers share one attempt. Retries transient
    /// failures under the `max_connect_retry_time_ms` budget.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return ClosedSnafu.fail();
        }
        let mut backoff = self.inner.connect_gate.lock().await;
        {
            let slot = relock(&self.inner.slot);
            if slot.session.is_some() && !slot.dead {
                return Ok(());
            }
        }
        self.inner.connect_cycle(&mut backoff).await
    }

    /// Run one query with lease upkeep, reconnection, and bounded retries.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return ClosedSnafu.fail();
        }

        let started_at_ms = inner.clock.now_ms();
        Hooks::fire(
            &inner.hooks.on_query_start,
            &QueryStartEvent { sql: sql.to_string(), started_at_ms },
        );

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let needs_connect = {
                let slot = relock(&inner.slot);
                slot.session.is_none() || slot.dead
            };
            if needs_connect {
                self.connect().await?;
            } else {
                inner.heartbeat_if_needed().await?;
            }

            let Some(session) = relock(&inner.slot).session.clone() else {
                // Connect returned without installing (a concurrent fatal
                // event invalidated its generation); go around again, but
                // not forever.
                if attempt >= inner.config.retries {
                    let err = SessionError::other("connection superseded before query could run");
                    return Err(err).context(RetriesExhaustedSnafu { attempts: attempt });
                }
                continue;
            };

            match inner.execute_bounded(&session, sql, params).await {
                Ok(outcome) => {
                    relock(&inner.query_backoff).reset();
                    Hooks::fire(
                        &inner.hooks.on_query_end,
                        &QueryEndEvent {
                            sql: sql.to_string(),
                            rows: outcome.rows.len(),
                            duration_ms: inner.clock.now_ms().saturating_sub(started_at_ms),
                        },
                    );
                    return Ok(outcome);
                }
                Err(err) => {
                    let elapsed_ms = inner.clock.now_ms().saturating_sub(started_at_ms);
                    let out_of_budget = attempt >= inner.config.retries
                        || elapsed_ms >= inner.config.max_query_retry_time_ms;
                    if !is_transient(&err) || out_of_budget {
                        Hooks::fire(
                            &inner.hooks.on_query_error,
                            &QueryErrorEvent {
                                sql: sql.to_string(),
                                error: err.clone(),
                                duration_ms: elapsed_ms,
                            },
                        );
                        return if is_transient(&err) {
                            Err(err).context(RetriesExhaustedSnafu { attempts: attempt })
                        } else {
                            Err(err).context(DatabaseSnafu)
                        };
                    }

                    inner.mark_dead_and_dispose("query failure").await;
                    let delay_ms = relock(&inner.query_backoff).next_delay_ms();
                    Hooks::fire(
                        &inner.hooks.on_query_retry,
                        &QueryRetryEvent { retries: attempt, delay_ms, error: err },
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    /// Run a reaper pass right now on the current session, bypassing the
    /// probability gate and cooldown. With `reaper_error_mode = Throw`
    /// failures surface here.
    pub async fn reap(&self) -> Result<ReapOutcome> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return ClosedSnafu.fail();
        }
        let Some(reaper) = &inner.reaper else {
            return Ok(ReapOutcome::default());
        };
        self.connect().await?;
        let Some(session) = relock(&inner.slot).session.clone() else {
            return Ok(ReapOutcome::default());
        };

        let started = inner.clock.now_ms();
        let outcome = reaper.run(&*session).await?;
        let now = inner.clock.now_ms();
        relock(&inner.reaper_schedule).record(now, outcome.locked);
        Hooks::fire(
            &inner.hooks.on_reap,
            &ReapEvent {
                generation: inner.generation.load(Ordering::SeqCst),
                outcome: outcome.clone(),
                duration_ms: now.saturating_sub(started),
            },
        );
        Ok(outcome)
    }

    /// Dispose the session and refuse all further operations.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.dispose("close", true).await;
    }
}

impl<D: SessionDriver> ClientInner<D> {
    /// The label installed when leasing is disabled: just the sanitized
    /// service name, truncated to the database limit.
    fn plain_label(&self) -> String {
        let mut label = sanitize(&self.config.service_name);
        label.truncate(MAX_LABEL_LEN);
        label
    }

    async fn connect_cycle(&self, backoff: &mut BackoffState) -> Result<()> {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let started_ms = self.clock.now_ms();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            // A dead prior session is replaced, not reused; its disposal
            // must not bump the generation we are connecting under.
            self.dispose("reconnect", false).await;

            let lease_expires_at_ms;
            let label = match &self.leases {
                Some(leases) => {
                    lease_expires_at_ms = self.clock.now_ms() + self.config.lease_ttl_ms;
                    leases.mint(lease_expires_at_ms)?
                }
                None => {
                    lease_expires_at_ms = 0;
                    self.plain_label()
                }
            };

            match self.driver.connect(&label).await {
                Ok(session) => {
                    let mut fatal_rx = session.take_fatal_events();

                    // Drain anything the driver raised during the handshake
                    // so the generation guard below sees it.
                    if let Some(rx) = fatal_rx.as_mut() {
                        while let Ok(event) = rx.try_recv() {
                            self.handle_fatal(&Arc::downgrade(&session), event);
                        }
                    }

                    if self.generation.load(Ordering::SeqCst) != gen {
                        // Another generation started while the handshake was
                        // in flight; this session is already stale.
                        debug!(gen, "connect superseded, discarding fresh session");
                        session.close().await;
                        return Ok(());
                    }

                    {
                        let mut slot = relock(&self.slot);
                        slot.session = Some(session.clone());
                        slot.dead = false;
                        slot.lease_expires_at_ms = lease_expires_at_ms;
                    }
                    backoff.reset();
                    if let Some(rx) = fatal_rx {
                        self.spawn_fatal_listener(&session, rx);
                    }
                    Hooks::fire(&self.hooks.on_connect, &ConnectEvent { generation: gen });
                    debug!(gen, "session connected");

                    self.maybe_reap(session, gen);
                    return Ok(());
                }
                Err(err) => {
                    let elapsed_ms = self.clock.now_ms().saturating_sub(started_ms);
                    if !is_transient(&err) {
                        return Err(err).context(DatabaseSnafu);
                    }
                    if elapsed_ms >= self.config.max_connect_retry_time_ms {
                        return Err(err).context(RetriesExhaustedSnafu { attempts: attempt });
                    }
                    let delay_ms = backoff.next_delay_ms();
                    warn!(gen, attempt, delay_ms, error = %err, "connect failed, retrying");
                    Hooks::fire(
                        &self.hooks.on_reconnect,
                        &ReconnectEvent { generation: gen, retries: attempt, delay_ms, error: err },
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    /// Detach and gracefully close the current session, if any.
    pub(crate) async fn dispose(&self, reason: &str, bump_generation: bool) {
        let detached = {
            let mut slot = relock(&self.slot);
            slot.session.take()
        };
        if let Some(session) = detached {
            if bump_generation {
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            debug!(reason, "disposing session");
            session.close().await;
        }
    }

    /// Mark the client dead and dispose, bumping the generation.
    pub(crate) async fn mark_dead_and_dispose(&self, reason: &str) {
        relock(&self.slot).dead = true;
        self.dispose(reason, true).await;
    }

    /// One fatal-event listener runs per installed session. It holds only
    /// weak handles, so a detached session (or a dropped client) can
    /// actually go away and end the stream.
    fn spawn_fatal_listener(
        &self,
        session: &Arc<D::Session>,
        mut rx: mpsc::UnboundedReceiver<FatalEvent>,
    ) {
        let weak_session = Arc::downgrade(session);
        let weak_inner = self.this.clone();
        tokio::spawn(async move {
            // The first fatal event is terminal for its session.
            if let Some(event) = rx.recv().await {
                if let Some(inner) = weak_inner.upgrade() {
                    inner.handle_fatal(&weak_session, event);
                }
            }
        });
    }

    /// Fatal-event handler. Must never panic: it runs on detached tasks in
    /// environments where an escaped panic kills the worker.
    fn handle_fatal(&self, source_session: &Weak<D::Session>, event: FatalEvent) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let detached = {
            let mut slot = relock(&self.slot);
            let is_current = match &slot.session {
                Some(current) => Weak::ptr_eq(&Arc::downgrade(current), source_session),
                None => false,
            };
            if is_current {
                slot.dead = true;
                slot.session.take()
            } else {
                // A stale session's event must not touch the current
                // session's state; the generation bump above is enough for
                // in-flight reconcilers.
                None
            }
        };

        let Some(session) = detached else {
            debug!(source = %event.source, "fatal event from non-current session");
            return;
        };

        warn!(source = %event.source, "session died");
        let meta = event.error.as_ref().map(ErrorMeta::from).unwrap_or_default();
        Hooks::fire(
            &self.hooks.on_client_dead,
            &ClientDeadEvent { source: event.source, error: event.error, meta },
        );

        // Best-effort close, not awaited here.
        tokio::spawn(async move {
            session.close().await;
        });
    }

    async fn execute_bounded(
        &self,
        session: &Arc<D::Session>,
        sql: &str,
        params: &[SqlValue],
    ) -> std::result::Result<QueryOutcome, SessionError> {
        match self.config.default_query_timeout_ms {
            None => session.execute(sql, params).await,
            Some(timeout_ms) => {
                match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    session.execute(sql, params),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SessionError::transport(
                        "ETIMEDOUT",
                        format!("query timed out after {timeout_ms}ms"),
                    )),
                }
            }
        }
    }

    /// Fire-and-forget reaper pass after a successful connect, gated by the
    /// run probability first and the cooldown second.
    fn maybe_reap(&self, session: Arc<D::Session>, gen: u64) {
        if self.reaper.is_none() {
            return;
        }
        let probability = self.config.reaper_run_probability;
        if probability < 1.0 && rand::rng().random::<f64>() >= probability {
            debug!(gen, "reaper pass skipped by probability gate");
            return;
        }
        let now = self.clock.now_ms();
        if !relock(&self.reaper_schedule).due(now) {
            return;
        }

        let Some(inner) = self.this.upgrade() else { return };
        tokio::spawn(async move {
            let Some(reaper) = &inner.reaper else { return };
            let started = inner.clock.now_ms();
            match reaper.run(&*session).await {
                Ok(outcome) => {
                    let now = inner.clock.now_ms();
                    relock(&inner.reaper_schedule).record(now, outcome.locked);
                    Hooks::fire(
                        &inner.hooks.on_reap,
                        &ReapEvent {
                            generation: gen,
                            outcome,
                            duration_ms: now.saturating_sub(started),
                        },
                    );
                }
                Err(err) => {
                    // Throw mode has no caller on this path; the error is
                    // still confined to the reaper.
                    let now = inner.clock.now_ms();
                    relock(&inner.reaper_schedule).record(now, false);
                    warn!(gen, error = %err, "background reaper pass failed");
                }
            }
        });
    }
}

fn default_instance_id() -> String {
    format!("{}-{:08x}", std::process::id(), rand::rng().random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_instance_id_shape() {
        let id = default_instance_id();
        let (pid, hex) = id.split_once('-').unwrap();
        assert!(pid.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_relock_recovers_poisoned_mutex() {
        let mutex = Arc::new(StdMutex::new(5u32));
        let cloned = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison it");
        })
        .join();
        assert_eq!(*relock(&mutex), 5);
    }
}
