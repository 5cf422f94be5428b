//! Lease renewal over the live session.
//!
//! Renewal is cheap (one `set_config` round trip) but races against
//! everything else the client does, so every flight captures the
//! generation and session it was launched for and only commits the new
//! expiry when both still match. At most one flight exists at a time;
//! queries arriving while one is pending attach to it instead of starting
//! another.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use snafu::ResultExt;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use super::ClientInner;
use super::relock;
use crate::config::HeartbeatErrorMode;
use crate::error::HeartbeatSnafu;
use crate::error::Result;
use crate::hooks::HeartbeatEvent;
use crate::hooks::HeartbeatFailEvent;
use crate::hooks::Hooks;
use crate::session::Session;
use crate::session::SessionDriver;
use crate::session::SessionError;
use crate::session::SqlValue;

/// Installs the renewed label over the live session. Parameterized; the
/// label never enters the SQL text.
const SET_LABEL_SQL: &str = "SELECT set_config('application_name', $1, false)";

/// `None` while the flight is pending, `Some(result)` once finished.
type FlightResult = Option<std::result::Result<(), SessionError>>;

impl<D: SessionDriver> ClientInner<D> {
    /// Renew the lease when it is close to expiring.
    ///
    /// Above the soft threshold this is a no-op. Between soft and hard the
    /// renewal runs in the background. Below the hard threshold the caller
    /// waits for it, because issuing a query on a lease about to lapse
    /// invites a concurrent reaper to kill the session mid-flight.
    pub(crate) async fn heartbeat_if_needed(&self) -> Result<()> {
        if self.leases.is_none() {
            return Ok(());
        }
        let remaining_ms = {
            let slot = relock(&self.slot);
            if slot.session.is_none() {
                return Ok(());
            }
            slot.lease_expires_at_ms.saturating_sub(self.clock.now_ms())
        };
        if remaining_ms > self.config.heartbeat_soft_remaining_ms {
            return Ok(());
        }

        let rx = self.ensure_heartbeat_flight();

        if remaining_ms < self.config.heartbeat_hard_wait_remaining_ms {
            if let Some(Err(err)) = await_flight(rx).await {
                if self.config.heartbeat_error_mode == HeartbeatErrorMode::Throw {
                    return Err(err).context(HeartbeatSnafu);
                }
            }
        }
        Ok(())
    }

    /// Return the pending flight, or launch one.
    fn ensure_heartbeat_flight(&self) -> watch::Receiver<FlightResult> {
        let mut flight = relock(&self.heartbeat_flight);
        if let Some(rx) = flight.as_ref() {
            if rx.borrow().is_none() {
                return rx.clone();
            }
        }

        let (tx, rx) = watch::channel(None);
        *flight = Some(rx.clone());
        drop(flight);

        match self.this.upgrade() {
            Some(inner) => {
                tokio::spawn(async move {
                    let result = inner.heartbeat_once().await;
                    inner.finish_heartbeat(&result).await;
                    // Clear before publishing so late arrivals start a
                    // fresh flight instead of attaching to a finished one.
                    *relock(&inner.heartbeat_flight) = None;
                    let _ = tx.send(Some(result));
                });
            }
            None => {
                // Client is being torn down; nothing to renew.
                *relock(&self.heartbeat_flight) = None;
            }
        }
        rx
    }

    /// One renewal attempt: mint, race against the timeout, commit if the
    /// captured state is still current.
    async fn heartbeat_once(&self) -> std::result::Result<(), SessionError> {
        let Some(leases) = &self.leases else {
            return Ok(());
        };
        let (session, gen) = {
            let slot = relock(&self.slot);
            let Some(session) = slot.session.clone() else {
                return Err(SessionError::other("no session to heartbeat"));
            };
            (session, self.generation.load(Ordering::SeqCst))
        };

        let new_expiry_ms = self.clock.now_ms() + self.config.lease_ttl_ms;
        let label = leases
            .mint(new_expiry_ms)
            .map_err(|err| SessionError::other(err.to_string()))?;

        let timeout_ms = self.config.heartbeat_timeout_ms;
        let params = [SqlValue::Text(label)];
        let update = session.execute(SET_LABEL_SQL, &params);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), update).await {
            Err(_) => Err(SessionError::other(format!("heartbeat timed out after {timeout_ms}ms"))),
            Ok(Err(err)) => Err(err),
            Ok(Ok(_)) => {
                // The database confirmed the new label; it becomes our
                // local expiry only if nothing reconnected meanwhile.
                let committed = {
                    let mut slot = relock(&self.slot);
                    let still_current = self.generation.load(Ordering::SeqCst) == gen
                        && slot.session.as_ref().is_some_and(|current| Arc::ptr_eq(current, &session));
                    if still_current {
                        slot.lease_expires_at_ms = new_expiry_ms;
                    }
                    still_current
                };
                if committed {
                    debug!(gen, "lease renewed");
                    Hooks::fire(&self.hooks.on_heartbeat, &HeartbeatEvent { generation: gen });
                } else {
                    debug!(gen, "heartbeat completed for a superseded session");
                }
                Ok(())
            }
        }
    }

    /// Apply the configured error mode before the flight result is
    /// published, so a hard-waiting query observes the post-failure state.
    async fn finish_heartbeat(&self, result: &std::result::Result<(), SessionError>) {
        let Err(err) = result else { return };
        let gen = self.generation.load(Ordering::SeqCst);
        Hooks::fire(
            &self.hooks.on_heartbeat_fail,
            &HeartbeatFailEvent { generation: gen, error: err.clone() },
        );
        match self.config.heartbeat_error_mode {
            HeartbeatErrorMode::Reconnect => {
                warn!(gen, error = %err, "heartbeat failed, reconnecting");
                self.mark_dead_and_dispose("heartbeat failure").await;
            }
            HeartbeatErrorMode::Swallow => {
                warn!(gen, error = %err, "heartbeat failed, swallowed");
            }
            // Surfaced to hard-waiting callers; background flights have no
            // caller, so the log line is all that remains of them.
            HeartbeatErrorMode::Throw => {
                warn!(gen, error = %err, "heartbeat failed");
            }
        }
    }
}

/// Wait for a flight to publish its result. `None` means the flight went
/// away without publishing (its task was torn down mid-shutdown).
async fn await_flight(mut rx: watch::Receiver<FlightResult>) -> FlightResult {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return Some(result);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}
