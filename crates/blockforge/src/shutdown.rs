//! Graceful shutdown.
//!
//! A shutdown request may carry a delay. Until the delay runs out it can be
//! cancelled or replaced by a newer request. After that the irrevocable
//! phase runs exactly once, on its own thread:
//!
//! ```text
//!  Idle ──shutdown()──▶ PendingDelay ──delay elapsed──▶ InProgress ──▶ Complete
//!   ▲                      │
//!   └──cancel_shutdown()───┘
//! ```
//!
//! Irrevocable phase, in order:
//!
//! 1. publish [`ServerEvent::ShutdownBegan`]
//! 2. stop every scheduled task
//! 3. stop accepting connections
//! 4. kick every session, wait (bounded) for them to leave, clear the registry
//! 5. disconnect integrations
//! 6. save every store
//! 7. join the scheduler workers (bounded)
//! 8. publish [`ServerEvent::ShutdownEnded`], then relaunch / exit as requested
//!
//! Failures in any step are logged and the sequence moves on.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use blockforge_scheduler::TaskScheduler;
use blockforge_session::SessionRegistry;
use flume::RecvTimeoutError;
use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::persistence::{self, PersistenceBackend};
use crate::{Integration, ProcessControl, ServerEvent};

/// Message shown to players when a shutdown carries no text of its own.
pub const DEFAULT_SHUTDOWN_MESSAGE: &str = "Server is shutting down.";

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Why the server is stopping. The numeric value is the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ShutdownReason {
    Unknown = 0,
    Other = 1,
    FailedToInitialize = 2,
    FailedToStart = 3,
    Crashed = 4,
    ShuttingDown = 5,
    Restarting = 6,
    ProcessClosing = 7,
}

impl ShutdownReason {
    /// The process exit code for this reason.
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unknown => "unknown",
            Self::Other => "other",
            Self::FailedToInitialize => "failed to initialize",
            Self::FailedToStart => "failed to start",
            Self::Crashed => "crashed",
            Self::ShuttingDown => "shutting down",
            Self::Restarting => "restarting",
            Self::ProcessClosing => "process closing",
        };
        f.write_str(text)
    }
}

/// A shutdown request.
///
/// ```
/// use std::time::Duration;
/// use blockforge::{ShutdownParams, ShutdownReason};
///
/// let params = ShutdownParams::new(ShutdownReason::Restarting)
///     .delay(Duration::from_secs(30))
///     .restart(true)
///     .reason_text("Scheduled restart")
///     .initiated_by("console");
/// assert_eq!(params.message(), "Scheduled restart");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownParams {
    pub reason: ShutdownReason,
    pub delay: Duration,
    pub restart: bool,
    pub kill_process: bool,
    pub reason_text: Option<String>,
    pub initiated_by: Option<String>,
}

impl ShutdownParams {
    /// An immediate shutdown that leaves the process running.
    pub fn new(reason: ShutdownReason) -> Self {
        Self {
            reason,
            delay: Duration::ZERO,
            restart: false,
            kill_process: false,
            reason_text: None,
            initiated_by: None,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    pub fn kill_process(mut self, kill: bool) -> Self {
        self.kill_process = kill;
        self
    }

    pub fn reason_text(mut self, text: impl Into<String>) -> Self {
        self.reason_text = Some(text.into());
        self
    }

    pub fn initiated_by(mut self, who: impl Into<String>) -> Self {
        self.initiated_by = Some(who.into());
        self
    }

    /// The text kicked players see.
    pub fn message(&self) -> &str {
        self.reason_text.as_deref().unwrap_or(DEFAULT_SHUTDOWN_MESSAGE)
    }
}

/// Where the coordinator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Idle,
    /// A request is waiting out its delay and can still be cancelled.
    PendingDelay,
    InProgress,
    Complete,
}

/// What a call to [`ShutdownCoordinator::shutdown`] led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Accepted; running in the background (caller did not wait).
    Scheduled,
    /// A shutdown is already past its delay; the request was ignored.
    AlreadyInProgress,
    /// The caller waited and the shutdown finished.
    Completed,
    /// The caller waited and the request was cancelled or replaced.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Everything the irrevocable phase acts on.
pub(crate) struct ShutdownTargets {
    pub scheduler: Arc<TaskScheduler>,
    pub registry: Arc<SessionRegistry>,
    pub persistence: Arc<dyn PersistenceBackend>,
    pub integrations: Vec<Arc<dyn Integration>>,
    pub process: Arc<dyn ProcessControl>,
    pub events: broadcast::Sender<ServerEvent>,
    pub disconnect_timeout: Duration,
}

struct State {
    phase: ShutdownPhase,
    /// Bumped by every request and cancellation; a delay worker whose
    /// generation is stale gives up.
    generation: u64,
    /// Dropping or signalling this wakes the pending delay worker.
    cancel: Option<flume::Sender<()>>,
}

/// Runs the shutdown sequence once, however many times it's requested.
pub struct ShutdownCoordinator {
    targets: ShutdownTargets,
    state: Mutex<State>,
    changed: Condvar,
    body_ran: AtomicBool,
}

impl ShutdownCoordinator {
    pub(crate) fn new(targets: ShutdownTargets) -> Arc<Self> {
        Arc::new(Self {
            targets,
            state: Mutex::new(State {
                phase: ShutdownPhase::Idle,
                generation: 0,
                cancel: None,
            }),
            changed: Condvar::new(),
            body_ran: AtomicBool::new(false),
        })
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.state.lock().phase
    }

    /// Requests a shutdown.
    ///
    /// Replaces a request that is still waiting out its delay. Once the
    /// irrevocable phase has begun, returns
    /// [`AlreadyInProgress`](ShutdownOutcome::AlreadyInProgress) and does
    /// nothing. With `wait_for_completion` the call blocks until the
    /// sequence finishes or this request is cancelled.
    ///
    /// Process effects (relaunch, exit) are applied on the shutdown thread
    /// after [`ServerEvent::ShutdownEnded`]; with `kill_process` a waiting
    /// caller may never return.
    pub fn shutdown(self: &Arc<Self>, params: ShutdownParams, wait_for_completion: bool) -> ShutdownOutcome {
        let (generation, cancel_rx) = {
            let mut state = self.state.lock();
            match state.phase {
                ShutdownPhase::InProgress | ShutdownPhase::Complete => {
                    info!(reason = %params.reason, "shutdown already in progress, request ignored");
                    return ShutdownOutcome::AlreadyInProgress;
                }
                ShutdownPhase::PendingDelay => {
                    info!("replacing pending shutdown request");
                    if let Some(cancel) = state.cancel.take() {
                        let _ = cancel.send(());
                    }
                }
                ShutdownPhase::Idle => {}
            }
            let (cancel_tx, cancel_rx) = flume::bounded(1);
            state.generation += 1;
            state.phase = ShutdownPhase::PendingDelay;
            state.cancel = Some(cancel_tx);
            (state.generation, cancel_rx)
        };
        self.changed.notify_all();

        info!(
            reason = %params.reason,
            delay_ms = params.delay.as_millis() as u64,
            restart = params.restart,
            initiated_by = params.initiated_by.as_deref().unwrap_or("-"),
            "shutdown requested"
        );

        let coordinator = Arc::clone(self);
        let worker_params = params.clone();
        let spawned = thread::Builder::new()
            .name("blockforge-shutdown".into())
            .spawn(move || coordinator.run(generation, worker_params, cancel_rx));
        if let Err(e) = spawned {
            // Without a worker the delay can't be cancelled; run it here.
            error!(error = %e, "failed to spawn shutdown thread, shutting down inline");
            let (_tx, rx) = flume::bounded(1);
            self.run(generation, params, rx);
        }

        if wait_for_completion {
            self.wait_for(generation)
        } else {
            ShutdownOutcome::Scheduled
        }
    }

    /// Cancels a request that is still waiting out its delay. Returns
    /// `false` if there was nothing to cancel.
    pub fn cancel_shutdown(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.phase != ShutdownPhase::PendingDelay {
                return false;
            }
            if let Some(cancel) = state.cancel.take() {
                let _ = cancel.send(());
            }
            state.generation += 1;
            state.phase = ShutdownPhase::Idle;
        }
        self.changed.notify_all();
        info!("pending shutdown cancelled");
        true
    }

    /// Blocks until the shutdown completes or `timeout` elapses. Returns
    /// whether it completed.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        // A timeout too large to represent waits without a deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();
        while state.phase != ShutdownPhase::Complete {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return state.phase == ShutdownPhase::Complete;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        true
    }

    fn wait_for(&self, generation: u64) -> ShutdownOutcome {
        let mut state = self.state.lock();
        loop {
            match state.phase {
                ShutdownPhase::Complete => return ShutdownOutcome::Completed,
                _ if state.generation != generation => return ShutdownOutcome::Cancelled,
                ShutdownPhase::Idle => return ShutdownOutcome::Cancelled,
                _ => self.changed.wait(&mut state),
            }
        }
    }

    /// Delay worker: sleeps on the cancel channel, then runs the sequence
    /// if this request is still the current one.
    fn run(&self, generation: u64, params: ShutdownParams, cancel: flume::Receiver<()>) {
        match recv_within(&cancel, params.delay) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!(generation, "shutdown delay interrupted");
                return;
            }
        }

        {
            let mut state = self.state.lock();
            if state.generation != generation || state.phase != ShutdownPhase::PendingDelay {
                return;
            }
            state.phase = ShutdownPhase::InProgress;
            state.cancel = None;
        }
        self.changed.notify_all();

        if self.body_ran.swap(true, Ordering::AcqRel) {
            return;
        }
        self.run_irrevocable(&params);

        self.state.lock().phase = ShutdownPhase::Complete;
        self.changed.notify_all();

        self.apply_process_effects(&params);
    }

    fn run_irrevocable(&self, params: &ShutdownParams) {
        let t = &self.targets;
        let message = params.message();
        let started = Instant::now();
        info!(reason = %params.reason, message, "shutdown began");
        let _ = t.events.send(ServerEvent::ShutdownBegan {
            reason: params.reason,
            message: message.to_string(),
        });

        t.scheduler.begin_shutdown();
        t.registry.stop_accepting();
        self.evict_sessions(message);

        for integration in &t.integrations {
            let name = integration.name().to_string();
            match catch_unwind(AssertUnwindSafe(|| integration.disconnect(message))) {
                Ok(Ok(())) => info!(integration = %name, "integration disconnected"),
                Ok(Err(e)) => warn!(integration = %name, error = %e, "integration disconnect failed"),
                Err(_) => error!(integration = %name, "integration panicked while disconnecting"),
            }
        }

        let failures = persistence::save_all(t.persistence.as_ref());
        if failures > 0 {
            warn!(failures, "some stores were not saved");
        }

        if let Err(e) = t.scheduler.end_shutdown() {
            warn!(error = %e, "scheduler workers did not stop cleanly");
        }

        info!(
            reason = %params.reason,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "shutdown ended"
        );
        let _ = t.events.send(ServerEvent::ShutdownEnded {
            reason: params.reason,
        });
    }

    /// Kicks every session, then waits for all of them against one shared
    /// deadline, force-closing stragglers.
    fn evict_sessions(&self, message: &str) {
        let t = &self.targets;
        let sessions = t.registry.sessions();
        for session in &sessions {
            session.kick(message);
        }
        let deadline = Instant::now().checked_add(t.disconnect_timeout);
        let mut forced = 0;
        for session in &sessions {
            let remaining = deadline.map_or(t.disconnect_timeout, |d| {
                d.saturating_duration_since(Instant::now())
            });
            if !session.wait_for_disconnect(remaining) {
                session.close();
                forced += 1;
            }
        }
        if forced > 0 {
            warn!(forced, "sessions did not disconnect in time and were closed");
        }
        t.registry.clear();
        info!(sessions = sessions.len(), "sessions disconnected");
    }

    fn apply_process_effects(&self, params: &ShutdownParams) {
        let process = &self.targets.process;
        if params.restart {
            if let Err(e) = process.relaunch() {
                error!(error = %e, "relaunch failed");
            }
        }
        if params.kill_process {
            process.exit(params.reason.exit_code());
        }
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// `recv_timeout` that treats a delay too large to add to the current
/// instant as no timeout at all.
fn recv_within<T>(rx: &flume::Receiver<T>, wait: Duration) -> Result<T, RecvTimeoutError> {
    match Instant::now().checked_add(wait) {
        Some(deadline) => rx.recv_deadline(deadline),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_within_unrepresentable_wait_returns_queued_value() {
        let (tx, rx) = flume::unbounded();
        tx.send(7).unwrap();
        assert_eq!(recv_within(&rx, Duration::MAX).unwrap(), 7);
    }

    #[test]
    fn test_recv_within_unrepresentable_wait_reports_disconnect() {
        let (tx, rx) = flume::bounded::<()>(0);
        drop(tx);
        assert!(matches!(
            recv_within(&rx, Duration::MAX),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn test_exit_code_is_numeric_reason() {
        assert_eq!(ShutdownReason::Unknown.exit_code(), 0);
        assert_eq!(ShutdownReason::Restarting.exit_code(), 6);
        assert_eq!(ShutdownReason::ProcessClosing.exit_code(), 7);
    }

    #[test]
    fn test_params_message_defaults_when_no_text() {
        let params = ShutdownParams::new(ShutdownReason::ShuttingDown);
        assert_eq!(params.message(), DEFAULT_SHUTDOWN_MESSAGE);
        assert_eq!(params.delay, Duration::ZERO);
        assert!(!params.restart);
        assert!(!params.kill_process);
    }

    #[test]
    fn test_params_builder_sets_fields() {
        let params = ShutdownParams::new(ShutdownReason::Other)
            .delay(Duration::from_secs(5))
            .kill_process(true)
            .reason_text("bye")
            .initiated_by("admin");
        assert_eq!(params.delay, Duration::from_secs(5));
        assert!(params.kill_process);
        assert_eq!(params.message(), "bye");
        assert_eq!(params.initiated_by.as_deref(), Some("admin"));
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(ShutdownReason::FailedToStart.to_string(), "failed to start");
    }
}
