//! Distributed zombie-connection reaper.
//!
//! A zombie is an idle session whose lease expired: its owning worker was
//! frozen or destroyed without closing the connection. Any live client of
//! the same service can collect them. The pass runs over the client's own
//! session, serialized across instances by a database advisory lock, and
//! only ever terminates sessions whose lease *verifies* under the shared
//! secret and is expired. Anything unverifiable belongs to someone else
//! and is skipped.

use std::sync::Arc;

use rand::Rng;
use snafu::ResultExt;
use tracing::debug;
use tracing::warn;

use crate::config::ReaperErrorMode;
use crate::config::TetherConfig;
use crate::error::ReapSnafu;
use crate::error::Result;
use crate::lease::LeaseManager;
use crate::session::Session;
use crate::session::SessionError;
use crate::session::SqlValue;

/// Advisory-lock namespace shared by every instance of this crate
/// (`PGAQ` in ASCII). An unrelated system colliding on
/// `(namespace, hashtext(service))` would serialize with us needlessly;
/// that failure mode is benign.
pub const REAPER_LOCK_NAMESPACE: i32 = 0x5047_4151;

/// Ceiling for the contention-grown cooldown interval.
const MAX_COOLDOWN_INTERVAL_MS: u64 = 600_000;

const ACQUIRE_LOCK_SQL: &str = "SELECT pg_try_advisory_lock($1, hashtext($2))";

const RELEASE_LOCK_SQL: &str = "SELECT pg_advisory_unlock($1, hashtext($2))";

/// The LIKE prefix is a coarse server-side filter; `_` in a service name is
/// a LIKE wildcard, so over-matching is possible. Authoritative
/// verification happens client-side on every row.
const SCAN_SQL: &str = "SELECT pid, application_name, \
     extract(epoch FROM now() - state_change) AS idle_s \
     FROM pg_stat_activity \
     WHERE datname = current_database() \
       AND state = 'idle' \
       AND pid <> pg_backend_pid() \
       AND application_name LIKE $1";

const TERMINATE_SQL: &str =
    "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE pid = ANY($1::int[])";

/// What one reaper pass did.
#[derive(Debug, Clone, Default)]
pub struct ReapOutcome {
    /// Whether the advisory lock was held for a completed pass.
    pub locked: bool,
    /// Sessions terminated.
    pub killed: u64,
    /// Swallowed failure, if the pass aborted.
    pub error: Option<String>,
}

/// An idle session holding a verified, expired lease.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Candidate {
    pub pid: i32,
    pub expires_at_ms: u64,
    pub idle_s: f64,
}

/// Executes reap passes for one service identity.
pub struct Reaper {
    leases: Arc<LeaseManager>,
    service: String,
    min_idle_s: f64,
    max_kill: usize,
    error_mode: ReaperErrorMode,
}

impl Reaper {
    /// Reaper for the service identity of `leases`.
    pub fn new(leases: Arc<LeaseManager>, config: &TetherConfig) -> Self {
        Self {
            service: leases.service().to_string(),
            min_idle_s: config.min_connection_idle_time_sec as f64,
            max_kill: config.max_idle_connections_to_kill,
            error_mode: config.reaper_error_mode,
            leases,
        }
    }

    /// Run one pass over `session`.
    ///
    /// Non-blocking: if another instance holds the lock, returns
    /// `{locked: false}` immediately. Scan or terminate failures release
    /// the lock and are swallowed into the outcome unless the error mode
    /// is `Throw`.
    pub async fn run<S: Session>(&self, session: &S) -> Result<ReapOutcome> {
        let lock_params =
            [SqlValue::Int(REAPER_LOCK_NAMESPACE as i64), SqlValue::Text(self.service.clone())];

        let locked = match session.execute(ACQUIRE_LOCK_SQL, &lock_params).await {
            Ok(outcome) => outcome.rows.first().and_then(|row| row.as_bool(0)).unwrap_or(false),
            Err(err) => return self.swallow_or_throw(err),
        };
        if !locked {
            debug!(service = %self.service, "reaper lock busy, skipping pass");
            return Ok(ReapOutcome { locked: false, killed: 0, error: None });
        }

        let pass = self.scan_and_terminate(session).await;

        // The lock is released no matter how the pass went; a failed unlock
        // only matters until this session ends.
        if let Err(err) = session.execute(RELEASE_LOCK_SQL, &lock_params).await {
            debug!(service = %self.service, error = %err, "advisory unlock failed");
        }

        match pass {
            Ok(killed) => Ok(ReapOutcome { locked: true, killed, error: None }),
            Err(err) => self.swallow_or_throw(err),
        }
    }

    async fn scan_and_terminate<S: Session>(&self, session: &S) -> Result<u64, SessionError> {
        let prefix = format!("{}%", self.leases.service_prefix());
        let scan =
            session.execute(SCAN_SQL, &[SqlValue::Text(prefix)]).await?;

        let mut candidates = Vec::new();
        for row in &scan.rows {
            let (Some(pid), Some(label), Some(idle_s)) =
                (row.as_i64(0), row.as_str(1), row.as_f64(2))
            else {
                continue;
            };
            if idle_s < self.min_idle_s {
                continue;
            }
            match self.leases.parse_and_verify(label) {
                Some(lease) if lease.is_expired => {
                    candidates.push(Candidate {
                        pid: pid as i32,
                        expires_at_ms: lease.expires_at_ms,
                        idle_s,
                    });
                }
                Some(_) => {} // healthy peer, leave it alone
                None => {
                    // Bad format or foreign secret; never ours to kill.
                    debug!(pid, "skipping unverifiable session label");
                }
            }
        }

        if candidates.is_empty() {
            return Ok(0);
        }

        order_candidates(&mut candidates);
        let pids: Vec<i32> = candidates.iter().take(self.max_kill).map(|c| c.pid).collect();
        debug!(service = %self.service, pids = ?pids, "terminating expired sessions");

        session.execute(TERMINATE_SQL, &[SqlValue::IntArray(pids.clone())]).await?;
        Ok(pids.len() as u64)
    }

    fn swallow_or_throw(&self, err: SessionError) -> Result<ReapOutcome> {
        warn!(service = %self.service, error = %err, "reaper pass failed");
        match self.error_mode {
            ReaperErrorMode::Throw => Err(err).context(ReapSnafu),
            ReaperErrorMode::Swallow => Ok(ReapOutcome {
                locked: false,
                killed: 0,
                error: Some(err.to_string()),
            }),
        }
    }
}

/// Staleest lease first; deterministic tie-break on longer idle, then pid.
pub(crate) fn order_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.expires_at_ms
            .cmp(&b.expires_at_ms)
            .then_with(|| b.idle_s.total_cmp(&a.idle_s))
            .then_with(|| a.pid.cmp(&b.pid))
    });
}

/// Cooldown scheduling for reap attempts.
///
/// Grown multiplicatively while peers hold the lock so a fleet of idle
/// instances stops hammering the same advisory lock; reset (with fresh
/// jitter) whenever a pass completes.
#[derive(Debug, Clone)]
pub struct ReaperSchedule {
    cooldown_ms: u64,
    current_interval_ms: u64,
    next_run_at_ms: u64,
}

impl ReaperSchedule {
    /// Schedule with the first pass immediately eligible.
    pub fn new(cooldown_ms: u64) -> Self {
        Self { cooldown_ms, current_interval_ms: cooldown_ms, next_run_at_ms: 0 }
    }

    /// Whether a pass may run at `now_ms`.
    pub fn due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_run_at_ms
    }

    /// Record a pass outcome and schedule the next eligibility window.
    pub fn record(&mut self, now_ms: u64, locked: bool) {
        let mut rng = rand::rng();
        if locked {
            // Base interval: configured cooldown plus up to one third jitter.
            self.current_interval_ms =
                self.cooldown_ms + rng.random_range(0..=self.cooldown_ms / 3);
        } else {
            self.current_interval_ms =
                ((self.current_interval_ms as f64 * 1.5) as u64).min(MAX_COOLDOWN_INTERVAL_MS);
        }
        self.next_run_at_ms =
            now_ms + self.current_interval_ms + rng.random_range(0..=self.current_interval_ms / 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_staleest_lease_first() {
        let mut candidates = vec![
            Candidate { pid: 300, expires_at_ms: 9_000, idle_s: 10.0 },
            Candidate { pid: 100, expires_at_ms: 5_000, idle_s: 20.0 },
            Candidate { pid: 200, expires_at_ms: 5_000, idle_s: 25.0 },
        ];
        order_candidates(&mut candidates);
        let pids: Vec<i32> = candidates.iter().map(|c| c.pid).collect();
        // 5_000 expiries first; among them the longer-idle pid 200 wins.
        assert_eq!(pids, vec![200, 100, 300]);
    }

    #[test]
    fn test_order_pid_breaks_full_ties() {
        let mut candidates = vec![
            Candidate { pid: 7, expires_at_ms: 1, idle_s: 3.0 },
            Candidate { pid: 3, expires_at_ms: 1, idle_s: 3.0 },
        ];
        order_candidates(&mut candidates);
        assert_eq!(candidates[0].pid, 3);
    }

    #[test]
    fn test_schedule_first_pass_is_due() {
        let schedule = ReaperSchedule::new(60_000);
        assert!(schedule.due(0));
        assert!(schedule.due(1));
    }

    #[test]
    fn test_schedule_success_resets_interval() {
        let mut schedule = ReaperSchedule::new(60_000);
        for _ in 0..8 {
            schedule.record(1_000, false);
        }
        let grown = schedule.current_interval_ms;
        assert!(grown > 60_000);

        schedule.record(1_000, true);
        assert!(schedule.current_interval_ms >= 60_000);
        assert!(schedule.current_interval_ms <= 80_000, "cooldown plus at most 1/3 jitter");
    }

    #[test]
    fn test_schedule_contention_growth_is_capped() {
        let mut schedule = ReaperSchedule::new(60_000);
        for _ in 0..64 {
            schedule.record(0, false);
        }
        assert_eq!(schedule.current_interval_ms, MAX_COOLDOWN_INTERVAL_MS);
    }

    #[test]
    fn test_schedule_next_run_in_jitter_window() {
        let mut schedule = ReaperSchedule::new(60_000);
        schedule.record(10_000, true);
        let interval = schedule.current_interval_ms;
        assert!(schedule.next_run_at_ms >= 10_000 + interval);
        assert!(schedule.next_run_at_ms <= 10_000 + interval + interval / 2);
        assert!(!schedule.due(10_000 + interval - 1));
    }
}
