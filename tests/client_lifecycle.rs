//! Client lifecycle scenarios: leases on connect, heartbeats, generation
//! reconciliation, retries, and death handling.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tether::Client;
use tether::ClientState;
use tether::Clock;
use tether::FatalEvent;
use tether::FatalSource;
use tether::Hooks;
use tether::LeaseManager;
use tether::LeaseMode;
use tether::SessionError;
use tether::TetherConfig;
use tether::TetherError;
use tether_testing::Reply;
use tether_testing::ScriptedDriver;
use tether_testing::ScriptedSession;
use tether_testing::SimulatedClock;

const SECRET: &str = "secret-1234567890";
const NOW_MS: u64 = 1_700_000_000_000;

fn config() -> TetherConfig {
    TetherConfig {
        coordination_secret: Some(SECRET.to_string()),
        service_name: "mysvc".to_string(),
        instance_id: Some("inst-1".to_string()),
        reaper: false,
        ..TetherConfig::default()
    }
}

fn client_with(
    driver: &Arc<ScriptedDriver>,
    cfg: TetherConfig,
    hooks: Hooks,
    clock: &Arc<SimulatedClock>,
) -> Client<Arc<ScriptedDriver>> {
    Client::with_parts(driver.clone(), cfg, hooks, clock.clone()).unwrap()
}

/// Wait for an asynchronously updated condition, bounded.
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_connect_installs_verifiable_lease_label() {
    let clock = SimulatedClock::at(NOW_MS);
    let driver = ScriptedDriver::new();
    let client = client_with(&driver, config(), Hooks::default(), &clock);

    client.connect().await.unwrap();

    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(client.lease_expires_at_ms(), NOW_MS + config().lease_ttl_ms);

    let labels = driver.labels();
    assert_eq!(labels.len(), 1);
    assert!(labels[0].len() <= tether::MAX_LABEL_LEN);

    let verifier = LeaseManager::new(SECRET, "mysvc", "inst-1", clock.clone()).unwrap();
    let lease = verifier.parse_and_verify(&labels[0]).unwrap();
    assert_eq!(lease.service, "mysvc");
    assert_eq!(lease.instance, "inst-1");
    assert!(!lease.is_expired);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let clock = SimulatedClock::at(NOW_MS);
    let driver = ScriptedDriver::new();
    let client = client_with(&driver, config(), Hooks::default(), &clock);

    client.connect().await.unwrap();
    let gen = client.generation();
    client.connect().await.unwrap();

    assert_eq!(driver.labels().len(), 1, "second connect must be a no-op");
    assert_eq!(client.generation(), gen);
}

#[tokio::test]
async fn test_plain_label_when_leasing_disabled() {
    let clock = SimulatedClock::at(NOW_MS);
    let driver = ScriptedDriver::new();
    let session = ScriptedSession::new();
    driver.push_session(session.clone());

    let cfg = TetherConfig {
        coordination_secret: None,
        lease_mode: LeaseMode::Optional,
        service_name: "my svc!".to_string(),
        ..config()
    };
    let client = client_with(&driver, cfg, Hooks::default(), &clock);

    client.connect().await.unwrap();
    client.query("SELECT 1", &[]).await.unwrap();

    assert_eq!(driver.labels(), vec!["my_svc_".to_string()]);
    assert_eq!(client.lease_expires_at_ms(), 0);
    // No lease means no heartbeat traffic, ever.
    assert!(session.calls_matching("set_config").is_empty());
}

#[tokio::test]
async fn test_heartbeat_hard_wait_failure_reconnects() {
    let clock = SimulatedClock::at(NOW_MS);
    let session1 = ScriptedSession::new();
    session1.set_default(
        "set_config",
        Reply::Err(SessionError::transport("ECONNRESET", "socket reset")),
    );
    let session2 = ScriptedSession::new();

    let driver = ScriptedDriver::new();
    driver.push_session(session1.clone());
    driver.push_session(session2.clone());

    let heartbeat_failures = Arc::new(AtomicUsize::new(0));
    let counted = heartbeat_failures.clone();
    let hooks = Hooks::new().on_heartbeat_fail(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    let mut cfg = config();
    cfg.lease_ttl_ms = 10;
    let client = client_with(&driver, cfg, hooks, &clock);

    client.connect().await.unwrap();
    clock.advance(100); // lease is now past expiry: hard-wait territory

    client.query("SELECT 1", &[]).await.unwrap();

    assert_eq!(heartbeat_failures.load(Ordering::SeqCst), 1);
    assert!(session1.is_closed(), "failed session must be disposed");
    assert_eq!(session2.calls_matching("SELECT 1").len(), 1);
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(driver.labels().len(), 2);
}

#[tokio::test]
async fn test_heartbeat_timeout_counts_as_failure() {
    let clock = SimulatedClock::at(NOW_MS);
    let session1 = ScriptedSession::new();
    session1.set_default("set_config", Reply::Hang);
    let session2 = ScriptedSession::new();

    let driver = ScriptedDriver::new();
    driver.push_session(session1.clone());
    driver.push_session(session2.clone());

    let heartbeat_failures = Arc::new(AtomicUsize::new(0));
    let counted = heartbeat_failures.clone();
    let hooks = Hooks::new().on_heartbeat_fail(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    let mut cfg = config();
    cfg.lease_ttl_ms = 10;
    cfg.heartbeat_timeout_ms = 5;
    let client = client_with(&driver, cfg, hooks, &clock);

    client.connect().await.unwrap();
    clock.advance(100);

    // The hanging heartbeat must resolve as a failure via the timeout and
    // the query must come back over a fresh session.
    client.query("SELECT 1", &[]).await.unwrap();

    assert_eq!(heartbeat_failures.load(Ordering::SeqCst), 1);
    assert!(session1.is_closed());
    assert_eq!(session2.calls_matching("SELECT 1").len(), 1);
}

#[tokio::test]
async fn test_heartbeat_soft_window_renews_in_background() {
    let clock = SimulatedClock::at(NOW_MS);
    let session = ScriptedSession::new();
    let driver = ScriptedDriver::new();
    driver.push_session(session.clone());

    let renewed = Arc::new(AtomicUsize::new(0));
    let counted = renewed.clone();
    let hooks = Hooks::new().on_heartbeat(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    let client = client_with(&driver, config(), hooks, &clock);

    client.connect().await.unwrap();
    // 20s remaining: inside the soft window, above the hard threshold.
    clock.advance(config().lease_ttl_ms - 20_000);

    client.query("SELECT 1", &[]).await.unwrap();

    let expected_expiry = clock.now_ms() + config().lease_ttl_ms;
    eventually(|| renewed.load(Ordering::SeqCst) == 1).await;
    assert_eq!(client.lease_expires_at_ms(), expected_expiry);
    assert_eq!(session.calls_matching("set_config").len(), 1);
}

#[tokio::test]
async fn test_heartbeat_noop_with_fresh_lease() {
    let clock = SimulatedClock::at(NOW_MS);
    let session = ScriptedSession::new();
    let driver = ScriptedDriver::new();
    driver.push_session(session.clone());
    let client = client_with(&driver, config(), Hooks::default(), &clock);

    client.connect().await.unwrap();
    clock.advance(1_000); // plenty of lease left

    client.query("SELECT 1", &[]).await.unwrap();
    assert!(session.calls_matching("set_config").is_empty());
}

#[tokio::test]
async fn test_generation_guard_discards_session_that_died_during_handshake() {
    let clock = SimulatedClock::at(NOW_MS);
    let session1 = ScriptedSession::new();
    // The fatal event is already queued when the handshake resolves.
    session1.emit_fatal(FatalEvent {
        source: FatalSource::Error,
        error: Some(SessionError::transport("ECONNRESET", "reset during startup")),
    });
    let session2 = ScriptedSession::new();

    let driver = ScriptedDriver::new();
    driver.push_session(session1.clone());
    driver.push_session(session2.clone());
    let client = client_with(&driver, config(), Hooks::default(), &clock);

    client.connect().await.unwrap();

    // The freshly handshaken session must not be installed.
    assert_ne!(client.state(), ClientState::Connected);
    assert!(session1.is_closed());

    client.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(session2.calls_matching("SELECT 1").len(), 1);
    assert!(session1.calls_matching("SELECT 1").is_empty());
}

#[tokio::test]
async fn test_fatal_event_marks_client_dead_and_next_query_reconnects() {
    let clock = SimulatedClock::at(NOW_MS);
    let session1 = ScriptedSession::new();
    let session2 = ScriptedSession::new();
    let driver = ScriptedDriver::new();
    driver.push_session(session1.clone());
    driver.push_session(session2.clone());

    let dead_codes = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = dead_codes.clone();
    let hooks = Hooks::new().on_client_dead(move |ev| {
        sink.lock().unwrap().push((ev.source, ev.meta.code.clone()));
    });
    let client = client_with(&driver, config(), hooks, &clock);

    client.connect().await.unwrap();
    let gen_before = client.generation();

    session1.emit_fatal(FatalEvent {
        source: FatalSource::Error,
        error: Some(SessionError::transport("ECONNRESET", "server closed the connection")),
    });

    eventually(|| client.state() == ClientState::Dead).await;
    assert!(client.generation() > gen_before);
    {
        let seen = dead_codes.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, FatalSource::Error);
        assert_eq!(seen[0].1.as_deref(), Some("ECONNRESET"));
    }

    client.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(session2.calls_matching("SELECT 1").len(), 1);
}

#[tokio::test]
async fn test_query_retries_transient_error_over_fresh_session() {
    let clock = SimulatedClock::at(NOW_MS);
    let session1 = ScriptedSession::new();
    session1.enqueue(
        "SELECT 1",
        Reply::Err(SessionError::transport("ECONNRESET", "socket reset")),
    );
    let session2 = ScriptedSession::new();

    let driver = ScriptedDriver::new();
    driver.push_session(session1.clone());
    driver.push_session(session2.clone());

    let retries = Arc::new(AtomicUsize::new(0));
    let counted = retries.clone();
    let hooks = Hooks::new().on_query_retry(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    let client = client_with(&driver, config(), hooks, &clock);

    client.query("SELECT 1", &[]).await.unwrap();

    assert_eq!(retries.load(Ordering::SeqCst), 1);
    assert!(session1.is_closed());
    assert_eq!(session2.calls_matching("SELECT 1").len(), 1);
}

#[tokio::test]
async fn test_query_raises_permanent_error_without_reconnect() {
    let clock = SimulatedClock::at(NOW_MS);
    let session = ScriptedSession::new();
    session.set_default(
        "INSERT",
        Reply::Err(SessionError::sqlstate("23505", "duplicate key value")),
    );
    let driver = ScriptedDriver::new();
    driver.push_session(session.clone());

    let errors = Arc::new(AtomicUsize::new(0));
    let counted = errors.clone();
    let hooks = Hooks::new().on_query_error(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    let client = client_with(&driver, config(), hooks, &clock);

    let err = client.query("INSERT INTO t VALUES (1)", &[]).await.unwrap_err();
    assert!(matches!(err, TetherError::Database { .. }));
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    // A permanent error leaves the healthy session in place.
    assert_eq!(client.state(), ClientState::Connected);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_query_exhausts_retry_attempts() {
    let clock = SimulatedClock::at(NOW_MS);
    let driver = ScriptedDriver::new();
    for _ in 0..4 {
        let session = ScriptedSession::new();
        session.set_default(
            "SELECT 1",
            Reply::Err(SessionError::transport("ECONNRESET", "socket reset")),
        );
        driver.push_session(session);
    }

    let mut cfg = config();
    cfg.retries = 3;
    cfg.min_backoff_ms = 1;
    cfg.max_backoff_ms = 2;
    let client = client_with(&driver, cfg, Hooks::default(), &clock);

    let err = client.query("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, TetherError::RetriesExhausted { attempts: 3, .. }));
}

#[tokio::test]
async fn test_connect_retries_transient_failures() {
    let clock = SimulatedClock::at(NOW_MS);
    let driver = ScriptedDriver::new();
    driver.push_connect_error(SessionError::transport("ECONNREFUSED", "connection refused"));
    driver.push_session(ScriptedSession::new());

    let reconnects = Arc::new(AtomicUsize::new(0));
    let counted = reconnects.clone();
    let hooks = Hooks::new().on_reconnect(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    let mut cfg = config();
    cfg.min_backoff_ms = 1;
    cfg.max_backoff_ms = 2;
    let client = client_with(&driver, cfg, hooks, &clock);

    client.connect().await.unwrap();

    assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(driver.labels().len(), 2);
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test]
async fn test_connect_raises_permanent_failure_immediately() {
    let clock = SimulatedClock::at(NOW_MS);
    let driver = ScriptedDriver::new();
    driver.push_connect_error(SessionError::sqlstate("28P01", "password authentication failed"));
    let client = client_with(&driver, config(), Hooks::default(), &clock);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, TetherError::Database { .. }));
    assert_eq!(driver.labels().len(), 1, "no retry on a permanent failure");
}

#[tokio::test]
async fn test_closed_client_refuses_operations() {
    let clock = SimulatedClock::at(NOW_MS);
    let session = ScriptedSession::new();
    let driver = ScriptedDriver::new();
    driver.push_session(session.clone());
    let client = client_with(&driver, config(), Hooks::default(), &clock);

    client.connect().await.unwrap();
    client.close().await;

    assert_eq!(client.state(), ClientState::Closed);
    assert!(session.is_closed());
    assert!(matches!(client.query("SELECT 1", &[]).await, Err(TetherError::Closed)));
    assert!(matches!(client.connect().await, Err(TetherError::Closed)));
}

#[tokio::test]
async fn test_generation_strictly_increases_across_disposals() {
    let clock = SimulatedClock::at(NOW_MS);
    let driver = ScriptedDriver::new();
    let session1 = ScriptedSession::new();
    session1.enqueue(
        "SELECT 1",
        Reply::Err(SessionError::transport("EPIPE", "broken pipe")),
    );
    driver.push_session(session1);
    driver.push_session(ScriptedSession::new());

    let client = client_with(&driver, config(), Hooks::default(), &clock);

    let gen0 = client.generation();
    client.connect().await.unwrap();
    let gen1 = client.generation();
    assert!(gen1 > gen0, "connect bumps the generation");

    client.query("SELECT 1", &[]).await.unwrap();
    let gen2 = client.generation();
    // One bump for the dispose-for-reconnect, one for the new connect.
    assert!(gen2 >= gen1 + 2);
}
