//! Integration tests for `Server`: startup, maintenance tasks and the
//! shutdown sequence, driven through fake collaborators.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use blockforge::prelude::*;
use blockforge::{
    Integration, IntegrationError, ProcessControl, ServerBuilder, ShutdownPhase,
    DEFAULT_SHUTDOWN_MESSAGE,
};
use blockforge_session::SessionId;
use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;

// =========================================================================
// Fakes
// =========================================================================

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct FakeSession {
    id: SessionId,
    addr: SocketAddr,
    created: Instant,
    last_active: Instant,
    online: Mutex<bool>,
    gone: Condvar,
    kicks: Mutex<Vec<String>>,
    leaves_on_kick: bool,
}

impl FakeSession {
    fn new() -> Arc<Self> {
        Self::build(Instant::now(), true)
    }

    fn idle_for(idle: Duration) -> Arc<Self> {
        let now = Instant::now();
        Self::build(now.checked_sub(idle).unwrap_or(now), true)
    }

    fn stubborn() -> Arc<Self> {
        Self::build(Instant::now(), false)
    }

    fn build(last_active: Instant, leaves_on_kick: bool) -> Arc<Self> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id: SessionId::new(id),
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, (id >> 8) as u8, id as u8)), 5000),
            created: Instant::now(),
            last_active,
            online: Mutex::new(true),
            gone: Condvar::new(),
            kicks: Mutex::new(Vec::new()),
            leaves_on_kick,
        })
    }

    fn kicks(&self) -> Vec<String> {
        self.kicks.lock().clone()
    }

    fn go_offline(&self) {
        *self.online.lock() = false;
        self.gone.notify_all();
    }
}

impl Session for FakeSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    fn created_at(&self) -> Instant {
        self.created
    }

    fn last_active(&self) -> Instant {
        self.last_active
    }

    fn is_online(&self) -> bool {
        *self.online.lock()
    }

    fn kick(&self, reason: &str) {
        self.kicks.lock().push(reason.to_string());
        if self.leaves_on_kick {
            self.go_offline();
        }
    }

    fn wait_for_disconnect(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut online = self.online.lock();
        while *online {
            if self.gone.wait_until(&mut online, deadline).timed_out() {
                break;
            }
        }
        !*online
    }

    fn close(&self) {
        self.go_offline();
    }
}

#[derive(Default)]
struct FakeNetwork {
    queue: Mutex<VecDeque<Arc<dyn Session>>>,
    stopped: AtomicBool,
}

impl FakeNetwork {
    fn push(&self, session: Arc<FakeSession>) {
        self.queue.lock().push_back(session);
    }
}

impl NetworkBackend for FakeNetwork {
    fn accept_pending(&self) -> Result<Option<Arc<dyn Session>>, SessionError> {
        Ok(self.queue.lock().pop_front())
    }

    fn stop_accepting(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct NumberedHandshake;

impl Handshake for NumberedHandshake {
    fn perform(&self, session: &Arc<dyn Session>) -> Result<Login, SessionError> {
        Ok(Login::new(format!("player{}", session.id().into_inner())))
    }
}

#[derive(Default)]
struct FakePersistence {
    loads: AtomicUsize,
    saves: Mutex<Vec<Store>>,
    compactions: AtomicUsize,
    fail_saves: bool,
}

impl PersistenceBackend for FakePersistence {
    fn load(&self, _store: &Store) -> Result<(), PersistenceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn save(&self, store: &Store) -> Result<(), PersistenceError> {
        self.saves.lock().push(store.clone());
        if self.fail_saves {
            return Err(PersistenceError::Unavailable("disk on fire".into()));
        }
        Ok(())
    }

    fn world_names(&self) -> Vec<String> {
        vec!["main".into()]
    }

    fn compact(&self) -> Result<(), PersistenceError> {
        self.compactions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeIntegration {
    disconnects: Mutex<Vec<String>>,
}

impl Integration for FakeIntegration {
    fn name(&self) -> &str {
        "fake-irc"
    }

    fn disconnect(&self, reason: &str) -> Result<(), IntegrationError> {
        self.disconnects.lock().push(reason.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeProcess {
    relaunches: AtomicUsize,
    exit_code: Mutex<Option<i32>>,
}

impl ProcessControl for FakeProcess {
    fn relaunch(&self) -> std::io::Result<()> {
        self.relaunches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn exit(&self, code: i32) {
        *self.exit_code.lock() = Some(code);
    }
}

struct Harness {
    server: Server,
    network: Arc<FakeNetwork>,
    persistence: Arc<FakePersistence>,
    integration: Arc<FakeIntegration>,
    process: Arc<FakeProcess>,
}

fn fast_config() -> ServerConfig {
    ServerConfig {
        accept_poll_interval_ms: 10,
        reap_interval_ms: 50,
        disconnect_timeout_ms: 200,
        worker_join_timeout_ms: 1000,
        ..ServerConfig::default()
    }
}

fn harness_with(config: ServerConfig, persistence: FakePersistence) -> Harness {
    let network = Arc::new(FakeNetwork::default());
    let persistence = Arc::new(persistence);
    let integration = Arc::new(FakeIntegration::default());
    let process = Arc::new(FakeProcess::default());
    let server = Server::builder()
        .config(config)
        .network(network.clone())
        .handshake(Arc::new(NumberedHandshake))
        .persistence(persistence.clone())
        .integration(integration.clone())
        .process(process.clone())
        .build()
        .unwrap();
    Harness {
        server,
        network,
        persistence,
        integration,
        process,
    }
}

fn harness() -> Harness {
    harness_with(fast_config(), FakePersistence::default())
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn drain(rx: &mut broadcast::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn began_count(events: &[ServerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ServerEvent::ShutdownBegan { .. }))
        .count()
}

fn ended_count(events: &[ServerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ServerEvent::ShutdownEnded { .. }))
        .count()
}

fn immediate() -> ShutdownParams {
    ShutdownParams::new(ShutdownReason::ShuttingDown)
}

// =========================================================================
// Builder and startup
// =========================================================================

#[test]
fn test_build_without_network_returns_missing_collaborator() {
    let err = ServerBuilder::new()
        .handshake(Arc::new(NumberedHandshake))
        .build()
        .unwrap_err();
    assert!(matches!(err, ServerError::MissingCollaborator("network")));
}

#[test]
fn test_start_loads_every_store() {
    let h = harness();
    h.server.start().unwrap();
    // player db, ban list, one world
    assert_eq!(h.persistence.loads.load(Ordering::SeqCst), 3);
    h.server.shutdown(immediate(), true);
}

#[test]
fn test_start_twice_returns_already_started() {
    let h = harness();
    h.server.start().unwrap();
    assert!(matches!(h.server.start(), Err(ServerError::AlreadyStarted)));
    h.server.shutdown(immediate(), true);
}

// =========================================================================
// Maintenance tasks
// =========================================================================

#[test]
fn test_accept_task_registers_players_and_publishes_list_change() {
    let h = harness();
    let mut events = h.server.subscribe();
    h.server.start().unwrap();

    h.network.push(FakeSession::new());
    assert!(wait_until(Duration::from_secs(2), || h.server.registry().player_count() == 1));
    assert!(wait_until(Duration::from_secs(2), || {
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, ServerEvent::PlayerListChanged { count: 1 }))
    }));

    h.server.shutdown(immediate(), true);
}

#[test]
fn test_reaper_removes_disconnected_players() {
    let h = harness();
    h.server.start().unwrap();

    let session = FakeSession::new();
    h.network.push(session.clone());
    assert!(wait_until(Duration::from_secs(2), || h.server.registry().player_count() == 1));

    session.close();
    assert!(wait_until(Duration::from_secs(2), || h.server.registry().player_count() == 0));
    h.server.shutdown(immediate(), true);
}

#[test]
fn test_idle_check_kicks_idle_players() {
    let h = harness_with(
        ServerConfig {
            max_idle_secs: Some(1),
            idle_check_interval_secs: 1,
            ..fast_config()
        },
        FakePersistence::default(),
    );
    h.server.start().unwrap();

    let idle = FakeSession::idle_for(Duration::from_secs(120));
    h.network.push(idle.clone());

    assert!(wait_until(Duration::from_secs(3), || !idle.kicks().is_empty()));
    assert_eq!(idle.kicks()[0], "Idle for more than 1 minute");
    h.server.shutdown(immediate(), true);
}

#[test]
fn test_request_compaction_runs_compact_once() {
    let h = harness_with(
        ServerConfig {
            compaction_interval_secs: 1,
            ..fast_config()
        },
        FakePersistence::default(),
    );
    h.server.start().unwrap();
    h.server.request_compaction();

    assert!(wait_until(Duration::from_secs(3), || {
        h.persistence.compactions.load(Ordering::SeqCst) == 1
    }));
    thread::sleep(Duration::from_millis(1200));
    assert_eq!(h.persistence.compactions.load(Ordering::SeqCst), 1);
    h.server.shutdown(immediate(), true);
}

#[test]
fn test_save_task_saves_periodically() {
    let h = harness_with(
        ServerConfig {
            save_interval_secs: 1,
            ..fast_config()
        },
        FakePersistence::default(),
    );
    h.server.start().unwrap();

    assert!(wait_until(Duration::from_secs(3), || h.persistence.saves.lock().len() >= 3));
    h.server.shutdown(immediate(), true);
}

#[test]
fn test_scheduled_restart_relaunches_and_exits_with_restart_code() {
    let h = harness_with(
        ServerConfig {
            restart_after_secs: Some(1),
            ..fast_config()
        },
        FakePersistence::default(),
    );
    h.server.start().unwrap();

    assert!(h.server.wait_until_stopped(Some(Duration::from_secs(5))));
    assert!(wait_until(Duration::from_secs(1), || h.process.exit_code.lock().is_some()));
    assert_eq!(h.process.relaunches.load(Ordering::SeqCst), 1);
    assert_eq!(*h.process.exit_code.lock(), Some(ShutdownReason::Restarting.exit_code()));
}

// =========================================================================
// Shutdown sequence
// =========================================================================

#[test]
fn test_shutdown_kicks_sessions_with_message_and_clears_registry() {
    let h = harness();
    h.server.start().unwrap();
    let a = FakeSession::new();
    let b = FakeSession::new();
    h.network.push(a.clone());
    h.network.push(b.clone());
    assert!(wait_until(Duration::from_secs(2), || h.server.registry().player_count() == 2));

    let outcome = h.server.shutdown(immediate().reason_text("Maintenance"), true);

    assert_eq!(outcome, ShutdownOutcome::Completed);
    assert_eq!(a.kicks(), vec!["Maintenance"]);
    assert_eq!(b.kicks(), vec!["Maintenance"]);
    assert_eq!(h.server.registry().session_count(), 0);
    assert!(h.network.stopped.load(Ordering::SeqCst));
    assert_eq!(h.server.shutdown_phase(), ShutdownPhase::Complete);
    assert_eq!(h.server.scheduler().task_count(), 0);
}

#[test]
fn test_shutdown_force_closes_sessions_that_ignore_the_kick() {
    let h = harness();
    let stubborn = FakeSession::stubborn();
    h.server.registry().register_session(stubborn.clone()).unwrap();

    let started = Instant::now();
    h.server.shutdown(immediate(), true);

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(!stubborn.is_online(), "closed after the disconnect timeout");
    assert_eq!(stubborn.kicks(), vec![DEFAULT_SHUTDOWN_MESSAGE]);
}

#[test]
fn test_shutdown_saves_stores_and_disconnects_integrations_once() {
    let h = harness();
    let mut events = h.server.subscribe();
    h.server.start().unwrap();

    h.server.shutdown(immediate(), true);

    assert_eq!(
        *h.persistence.saves.lock(),
        vec![Store::PlayerDb, Store::BanList, Store::World("main".into())]
    );
    assert_eq!(*h.integration.disconnects.lock(), vec![DEFAULT_SHUTDOWN_MESSAGE]);
    let events = drain(&mut events);
    assert_eq!(began_count(&events), 1);
    assert_eq!(ended_count(&events), 1);
}

#[test]
fn test_concurrent_shutdowns_run_side_effects_once() {
    let h = Arc::new(harness());
    let mut events = h.server.subscribe();
    h.server.start().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let h = Arc::clone(&h);
            thread::spawn(move || h.server.shutdown(immediate(), true))
        })
        .collect();
    let outcomes: Vec<ShutdownOutcome> = handles.into_iter().map(|t| t.join().unwrap()).collect();

    assert!(outcomes.contains(&ShutdownOutcome::Completed), "{outcomes:?}");
    assert!(outcomes.iter().all(|o| matches!(
        o,
        ShutdownOutcome::Completed | ShutdownOutcome::Cancelled | ShutdownOutcome::AlreadyInProgress
    )));
    assert!(h.server.wait_until_stopped(Some(Duration::from_secs(5))));
    assert_eq!(h.persistence.saves.lock().len(), 3);
    assert_eq!(h.integration.disconnects.lock().len(), 1);
    let events = drain(&mut events);
    assert_eq!(began_count(&events), 1);
    assert_eq!(ended_count(&events), 1);
}

#[test]
fn test_shutdown_after_completion_returns_already_in_progress() {
    let h = harness();
    assert_eq!(h.server.shutdown(immediate(), true), ShutdownOutcome::Completed);
    assert_eq!(
        h.server.shutdown(immediate(), true),
        ShutdownOutcome::AlreadyInProgress
    );
    assert_eq!(h.persistence.saves.lock().len(), 3);
}

#[test]
fn test_shutdown_without_wait_returns_scheduled() {
    let h = harness();
    let outcome = h.server.shutdown(immediate(), false);
    assert_eq!(outcome, ShutdownOutcome::Scheduled);
    assert!(h.server.wait_until_stopped(Some(Duration::from_secs(5))));
}

#[test]
fn test_persistence_failure_does_not_prevent_shutdown_ended() {
    let h = harness_with(
        fast_config(),
        FakePersistence {
            fail_saves: true,
            ..FakePersistence::default()
        },
    );
    let mut events = h.server.subscribe();
    h.server.start().unwrap();

    assert_eq!(h.server.shutdown(immediate(), true), ShutdownOutcome::Completed);
    // Every store is still attempted.
    assert_eq!(h.persistence.saves.lock().len(), 3);
    assert_eq!(ended_count(&drain(&mut events)), 1);
}

#[test]
fn test_cancel_pending_shutdown_performs_no_side_effects() {
    let h = Arc::new(harness());
    let mut events = h.server.subscribe();
    h.server.start().unwrap();

    let waiter = {
        let h = Arc::clone(&h);
        thread::spawn(move || {
            h.server
                .shutdown(immediate().delay(Duration::from_millis(300)), true)
        })
    };
    assert!(wait_until(Duration::from_secs(1), || {
        h.server.shutdown_phase() == ShutdownPhase::PendingDelay
    }));

    assert!(h.server.cancel_shutdown());
    assert_eq!(waiter.join().unwrap(), ShutdownOutcome::Cancelled);

    thread::sleep(Duration::from_millis(500));
    assert_eq!(h.server.shutdown_phase(), ShutdownPhase::Idle);
    assert!(h.persistence.saves.lock().is_empty());
    assert!(h.integration.disconnects.lock().is_empty());
    assert_eq!(began_count(&drain(&mut events)), 0);
    assert!(!h.server.scheduler().is_shutting_down());

    h.server.shutdown(immediate(), true);
}

#[test]
fn test_cancel_shutdown_when_idle_returns_false() {
    let h = harness();
    assert!(!h.server.cancel_shutdown());
}

#[test]
fn test_new_request_replaces_pending_one() {
    let h = harness();
    let first = h
        .server
        .shutdown(immediate().delay(Duration::from_secs(30)), false);
    assert_eq!(first, ShutdownOutcome::Scheduled);

    let started = Instant::now();
    let second = h.server.shutdown(immediate().reason_text("now"), true);

    assert_eq!(second, ShutdownOutcome::Completed);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(*h.integration.disconnects.lock(), vec!["now"]);
}

#[test]
fn test_kill_process_exits_with_reason_code() {
    let h = harness();
    h.server.shutdown(
        ShutdownParams::new(ShutdownReason::Crashed).kill_process(true),
        true,
    );
    assert!(wait_until(Duration::from_secs(1), || h.process.exit_code.lock().is_some()));
    assert_eq!(*h.process.exit_code.lock(), Some(4));
    assert_eq!(h.process.relaunches.load(Ordering::SeqCst), 0);
}

#[test]
fn test_unbounded_timeouts_do_not_break_shutdown() {
    let h = harness_with(
        ServerConfig {
            disconnect_timeout_ms: u64::MAX,
            worker_join_timeout_ms: u64::MAX,
            ..fast_config()
        },
        FakePersistence::default(),
    );
    h.server.start().unwrap();

    let pending = h
        .server
        .shutdown(immediate().delay(Duration::MAX), false);
    assert_eq!(pending, ShutdownOutcome::Scheduled);
    assert!(wait_until(Duration::from_secs(1), || {
        h.server.shutdown_phase() == ShutdownPhase::PendingDelay
    }));
    assert!(h.server.cancel_shutdown());

    assert_eq!(h.server.shutdown(immediate(), true), ShutdownOutcome::Completed);
    assert!(h.server.wait_until_stopped(Some(Duration::MAX)));
    assert_eq!(h.server.shutdown_phase(), ShutdownPhase::Complete);
}
