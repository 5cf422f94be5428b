//! Deterministic test doubles for tether.
//!
//! [`ScriptedDriver`] and [`ScriptedSession`] stand in for a real wire
//! driver: tests script the replies per SQL pattern, inject fatal events,
//! and inspect every recorded call afterwards. [`SimulatedClock`] freezes
//! time so lease expiry is exact. No sockets, no database, no sleeps
//! beyond what the code under test itself awaits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tether::Clock;
use tether::FatalEvent;
use tether::QueryOutcome;
use tether::Session;
use tether::SessionDriver;
use tether::SessionError;
use tether::SqlValue;
use tokio::sync::mpsc;

/// Manually driven clock.
#[derive(Debug)]
pub struct SimulatedClock {
    now_ms: AtomicU64,
}

impl SimulatedClock {
    /// Start the clock at `now_ms`.
    pub fn at(now_ms: u64) -> Arc<Self> {
        Arc::new(Self { now_ms: AtomicU64::new(now_ms) })
    }

    /// Advance by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// A scripted reply to one `execute` call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Resolve successfully with this outcome.
    Ok(QueryOutcome),
    /// Fail with this error.
    Err(SessionError),
    /// Never resolve; pairs with timeout-race tests.
    Hang,
}

impl Reply {
    /// Successful reply carrying `rows`.
    pub fn rows(rows: Vec<tether::Row>) -> Self {
        Reply::Ok(QueryOutcome::rows(rows))
    }

    /// Successful reply with a single one-column boolean row, the shape of
    /// `pg_try_advisory_lock` and `pg_advisory_unlock` results.
    pub fn boolean(value: bool) -> Self {
        Reply::rows(vec![tether::Row::new(vec![SqlValue::Bool(value)])])
    }

    /// Successful empty reply.
    pub fn empty() -> Self {
        Reply::Ok(QueryOutcome::default())
    }
}

/// One recorded `execute` call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Statement text as the client issued it.
    pub sql: String,
    /// Bound parameters, in order.
    pub params: Vec<SqlValue>,
}

struct Rule {
    pattern: String,
    queued: VecDeque<Reply>,
    default: Option<Reply>,
}

/// Scripted stand-in for one live session.
///
/// Replies are matched by substring of the SQL text: queued replies are
/// consumed one per call, the default reply answers everything after the
/// queue drains. Unmatched statements succeed with an empty outcome.
pub struct ScriptedSession {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<RecordedCall>>,
    fatal_tx: mpsc::UnboundedSender<FatalEvent>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<FatalEvent>>>,
    closed: AtomicBool,
}

impl ScriptedSession {
    /// Create a new scripted session.
    ///
    /// The session starts with no rules, no recorded calls, and an open
    /// fatal-event channel.
    pub fn new() -> Arc<Self> {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue a one-shot reply for statements containing `pattern`.
    pub fn enqueue(&self, pattern: &str, reply: Reply) {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.queued.push_back(reply),
            None => rules.push(Rule {
                pattern: pattern.to_string(),
                queued: VecDeque::from([reply]),
                default: None,
            }),
        }
    }

    /// Set the standing reply for statements containing `pattern`.
    pub fn set_default(&self, pattern: &str, reply: Reply) {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.default = Some(reply),
            None => rules.push(Rule {
                pattern: pattern.to_string(),
                queued: VecDeque::new(),
                default: Some(reply),
            }),
        }
    }

    /// Inject an asynchronous fatal event, as a driver would on a broken
    /// socket. Events injected before the client subscribes are buffered.
    pub fn emit_fatal(&self, event: FatalEvent) {
        let _ = self.fatal_tx.send(event);
    }

    /// Every call executed so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose SQL contains `pattern`.
    pub fn calls_matching(&self, pattern: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.sql.contains(pattern)).collect()
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn reply_for(&self, sql: &str) -> Reply {
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if !sql.contains(&rule.pattern) {
                continue;
            }
            if let Some(reply) = rule.queued.pop_front() {
                return reply;
            }
            if let Some(reply) = &rule.default {
                return reply.clone();
            }
        }
        Reply::empty()
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn execute(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<QueryOutcome, SessionError> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedCall { sql: sql.to_string(), params: params.to_vec() });
        match self.reply_for(sql) {
            Reply::Ok(outcome) => Ok(outcome),
            Reply::Err(err) => Err(err),
            Reply::Hang => std::future::pending().await,
        }
    }

    fn take_fatal_events(&self) -> Option<mpsc::UnboundedReceiver<FatalEvent>> {
        self.fatal_rx.lock().unwrap().take()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

enum ConnectStep {
    Session(Arc<ScriptedSession>),
    Fail(SessionError),
}

/// Scripted session factory.
///
/// Connects follow the scripted plan in order; once the plan is exhausted
/// every further connect yields a fresh blank session, so tests only
/// script the part they care about.
pub struct ScriptedDriver {
    plan: Mutex<VecDeque<ConnectStep>>,
    labels: Mutex<Vec<String>>,
}

impl ScriptedDriver {
    /// Create a new scripted driver.
    ///
    /// The driver starts with an empty connect plan and no recorded
    /// labels.
    pub fn new() -> Arc<Self> {
        Arc::new(Self { plan: Mutex::new(VecDeque::new()), labels: Mutex::new(Vec::new()) })
    }

    /// Next connect hands out `session`.
    pub fn push_session(&self, session: Arc<ScriptedSession>) {
        self.plan.lock().unwrap().push_back(ConnectStep::Session(session));
    }

    /// Next connect fails with `err`.
    pub fn push_connect_error(&self, err: SessionError) {
        self.plan.lock().unwrap().push_back(ConnectStep::Fail(err));
    }

    /// Session labels passed to every connect so far, in order.
    pub fn labels(&self) -> Vec<String> {
        self.labels.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionDriver for ScriptedDriver {
    type Session = ScriptedSession;

    async fn connect(&self, application_name: &str) -> Result<Arc<Self::Session>, SessionError> {
        self.labels.lock().unwrap().push(application_name.to_string());
        match self.plan.lock().unwrap().pop_front() {
            Some(ConnectStep::Session(session)) => Ok(session),
            Some(ConnectStep::Fail(err)) => Err(err),
            None => Ok(ScriptedSession::new()),
        }
    }
}
