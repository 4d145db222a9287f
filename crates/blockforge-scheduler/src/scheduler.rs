//! The task scheduler and its two worker loops.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use flume::RecvTimeoutError;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::task::{ScheduledTask, TaskResult, TaskWorker};
use crate::{SchedulerConfig, SchedulerError};

const PRIMARY_WORKER: &str = "blockforge-scheduler";
const BACKGROUND_WORKER: &str = "blockforge-background";

/// State shared between the scheduler handle, its workers, and every task
/// (tasks hold a `Weak` to it so run-entry calls can register themselves).
pub(crate) struct Shared {
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    /// The live task set. Only touched under this lock.
    tasks: Mutex<Vec<ScheduledTask>>,
    /// Immutable copy of the non-stopped tasks, read lock-free by the workers.
    snapshot: ArcSwap<Vec<ScheduledTask>>,
    background_tx: flume::Sender<ScheduledTask>,
    background_rx: flume::Receiver<ScheduledTask>,
    /// Set by `begin_shutdown`, under the `tasks` lock.
    shutting_down: AtomicBool,
    /// Tells both worker loops to exit.
    halted: AtomicBool,
}

impl Shared {
    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Inserts `task` into the live set (no-op if already present) and
    /// republishes the snapshot. The task only becomes runnable again here,
    /// after the shutdown check, so a worker iterating an older snapshot
    /// never sees a task revived once shutdown has begun.
    pub(crate) fn add_task(&self, task: ScheduledTask) {
        let mut tasks = self.tasks.lock();
        if self.shutting_down.load(Ordering::Acquire) {
            task.stop();
            warn!(task = %task.label(), "scheduler is shutting down, task not scheduled");
            return;
        }
        task.revive();
        if !tasks.contains(&task) {
            tasks.push(task);
        }
        self.publish(&mut tasks);
    }

    /// Drops stopped tasks from the live set and publishes the rest.
    /// Caller holds the `tasks` lock.
    fn publish(&self, tasks: &mut Vec<ScheduledTask>) {
        tasks.retain(|t| !t.is_stopped());
        self.snapshot.store(Arc::new(tasks.clone()));
    }

    fn sweep(&self) {
        let mut tasks = self.tasks.lock();
        self.publish(&mut tasks);
    }

    fn poll_primary(&self) -> usize {
        let snapshot = self.snapshot.load_full();
        let mut ran = 0;
        let mut saw_stopped = false;

        for task in snapshot.iter() {
            if self.shutting_down.load(Ordering::Acquire) {
                break;
            }
            if task.is_stopped() {
                saw_stopped = true;
                continue;
            }
            if task.is_background() && task.is_queued() {
                continue;
            }
            if !task.take_due(self.now()) {
                continue;
            }

            if task.is_background() {
                task.set_queued(true);
                // Both ends live in `Shared`, so the channel cannot be closed.
                let _ = self.background_tx.send(task.clone());
                continue;
            }

            let generation = task.invoke();
            task.finish(self.now(), generation);
            ran += 1;
            saw_stopped |= task.is_stopped();
        }

        if saw_stopped {
            self.sweep();
        }
        ran
    }

    fn poll_background(&self, wait: Duration) -> bool {
        let task = match recv_within(&self.background_rx, wait) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return false,
        };

        if task.is_stopped() || self.shutting_down.load(Ordering::Acquire) {
            debug!(task = %task.label(), "discarding stopped background task");
        } else {
            let generation = task.invoke();
            task.finish(self.now(), generation);
        }
        task.set_queued(false);
        true
    }

    fn primary_loop(&self) {
        debug!(quantum_ms = self.config.quantum.as_millis() as u64, "primary worker started");
        while !self.halted.load(Ordering::Acquire) {
            self.poll_primary();
            thread::sleep(self.config.quantum);
        }
        debug!("primary worker exiting");
    }

    fn background_loop(&self) {
        debug!("background worker started");
        while !self.halted.load(Ordering::Acquire) {
            self.poll_background(self.config.quantum);
        }
        debug!("background worker exiting");
    }
}

/// `recv_timeout` that treats a timeout too large to add to the current
/// instant as no timeout at all.
fn recv_within<T>(rx: &flume::Receiver<T>, wait: Duration) -> Result<T, RecvTimeoutError> {
    match Instant::now().checked_add(wait) {
        Some(deadline) => rx.recv_deadline(deadline),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    }
}

struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    /// Disconnects when the worker thread's closure is dropped, i.e. when
    /// the thread exits (normally or by panic).
    exited: flume::Receiver<()>,
}

fn spawn_worker(
    name: &'static str,
    shared: Arc<Shared>,
    body: fn(&Shared),
) -> Result<Worker, SchedulerError> {
    let (exit_tx, exited) = flume::bounded::<()>(0);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _exit_tx = exit_tx;
            body(&shared);
        })
        .map_err(SchedulerError::WorkerSpawn)?;
    Ok(Worker {
        name,
        handle,
        exited,
    })
}

/// Runs [`ScheduledTask`]s on a primary and a background worker thread.
///
/// One scheduler per server instance; nothing here is global, so tests can
/// run as many independent schedulers as they like.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Option<(Worker, Worker)>>,
    started: AtomicBool,
}

impl TaskScheduler {
    /// Creates a scheduler on the system clock. Workers are not started.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a scheduler reading time from `clock`.
    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let config = config.validated();
        let (background_tx, background_rx) = flume::unbounded();
        Self {
            shared: Arc::new(Shared {
                clock,
                config,
                tasks: Mutex::new(Vec::new()),
                snapshot: ArcSwap::from_pointee(Vec::new()),
                background_tx,
                background_rx,
                shutting_down: AtomicBool::new(false),
                halted: AtomicBool::new(false),
            }),
            workers: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the primary and background worker threads.
    ///
    /// # Errors
    /// - [`SchedulerError::AlreadyStarted`] on a second call.
    /// - [`SchedulerError::WorkerSpawn`] if a thread cannot be created.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyStarted);
        }

        let primary = spawn_worker(PRIMARY_WORKER, Arc::clone(&self.shared), Shared::primary_loop)?;
        let background =
            match spawn_worker(BACKGROUND_WORKER, Arc::clone(&self.shared), Shared::background_loop) {
                Ok(worker) => worker,
                Err(e) => {
                    // Don't leave the primary worker running on its own.
                    self.shared.halted.store(true, Ordering::Release);
                    return Err(e);
                }
            };

        *self.workers.lock() = Some((primary, background));
        info!(
            quantum_ms = self.shared.config.quantum.as_millis() as u64,
            "task scheduler started"
        );
        Ok(())
    }

    /// Creates an unscheduled task that runs on the primary worker.
    pub fn new_task<F>(&self, label: impl Into<String>, callback: F) -> ScheduledTask
    where
        F: FnMut(&ScheduledTask) -> TaskResult + Send + 'static,
    {
        ScheduledTask::new(&self.shared, label.into(), TaskWorker::Primary, None, Box::new(callback))
    }

    /// Creates an unscheduled task that runs on the background worker.
    pub fn new_background_task<F>(&self, label: impl Into<String>, callback: F) -> ScheduledTask
    where
        F: FnMut(&ScheduledTask) -> TaskResult + Send + 'static,
    {
        ScheduledTask::new(
            &self.shared,
            label.into(),
            TaskWorker::Background,
            None,
            Box::new(callback),
        )
    }

    /// Like [`new_task`](Self::new_task), carrying an opaque payload the
    /// callback can read back with [`ScheduledTask::user_state`].
    pub fn new_task_with_state<S, F>(
        &self,
        label: impl Into<String>,
        state: S,
        callback: F,
    ) -> ScheduledTask
    where
        S: Any + Send + Sync,
        F: FnMut(&ScheduledTask) -> TaskResult + Send + 'static,
    {
        ScheduledTask::new(
            &self.shared,
            label.into(),
            TaskWorker::Primary,
            Some(Arc::new(state)),
            Box::new(callback),
        )
    }

    /// Background counterpart of [`new_task_with_state`](Self::new_task_with_state).
    pub fn new_background_task_with_state<S, F>(
        &self,
        label: impl Into<String>,
        state: S,
        callback: F,
    ) -> ScheduledTask
    where
        S: Any + Send + Sync,
        F: FnMut(&ScheduledTask) -> TaskResult + Send + 'static,
    {
        ScheduledTask::new(
            &self.shared,
            label.into(),
            TaskWorker::Background,
            Some(Arc::new(state)),
            Box::new(callback),
        )
    }

    /// Stops every task and publishes an empty snapshot so the workers go
    /// idle. Does not join the workers; see [`end_shutdown`](Self::end_shutdown).
    ///
    /// Tasks armed after this call are stopped immediately.
    pub fn begin_shutdown(&self) {
        let stopped = {
            let mut tasks = self.shared.tasks.lock();
            self.shared.shutting_down.store(true, Ordering::Release);
            for task in tasks.iter() {
                task.stop();
            }
            let count = tasks.len();
            self.shared.publish(&mut tasks);
            count
        };

        // Anything already queued is stopped too; drain it so the
        // background worker doesn't even look at it.
        for task in self.shared.background_rx.try_iter() {
            task.set_queued(false);
        }

        info!(stopped, "task scheduler shutdown begun");
    }

    /// Halts both workers and waits for them to exit, up to
    /// [`SchedulerConfig::join_timeout`] in total.
    ///
    /// A worker that already exited, even by panicking, is not an
    /// error. Calling this before [`start`](Self::start) or twice is fine.
    ///
    /// # Errors
    /// [`SchedulerError::JoinTimeout`] if a worker is still running when the
    /// timeout elapses. It is left detached.
    pub fn end_shutdown(&self) -> Result<(), SchedulerError> {
        self.shared.halted.store(true, Ordering::Release);

        let Some((primary, background)) = self.workers.lock().take() else {
            debug!("end_shutdown: no workers to join");
            return Ok(());
        };

        let timeout = self.shared.config.join_timeout;
        // `None` when the timeout is too large to represent: wait unbounded.
        let deadline = Instant::now().checked_add(timeout);
        let current = thread::current().id();
        let mut stalled = Vec::new();

        for worker in [primary, background] {
            if worker.handle.thread().id() == current {
                warn!(worker = worker.name, "end_shutdown called from its own worker, not joining");
                continue;
            }

            let remaining = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
            match recv_within(&worker.exited, remaining) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        warn!(worker = worker.name, "scheduler worker had panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    error!(
                        worker = worker.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "scheduler worker did not exit in time, detaching"
                    );
                    stalled.push(worker.name);
                }
            }
        }

        if stalled.is_empty() {
            info!("task scheduler stopped");
            Ok(())
        } else {
            Err(SchedulerError::JoinTimeout {
                workers: stalled.join(", "),
                timeout,
            })
        }
    }

    /// Runs one pass of the primary loop on the calling thread and returns
    /// how many primary callbacks were invoked. Background tasks that are
    /// due get queued.
    ///
    /// The worker thread calls this every quantum; tests driving a
    /// [`ManualClock`](crate::ManualClock) call it directly.
    pub fn poll_primary(&self) -> usize {
        self.shared.poll_primary()
    }

    /// Takes at most one task off the background queue, waiting up to
    /// `wait` for one, and runs it on the calling thread. Returns whether a
    /// task was dequeued.
    pub fn poll_background(&self, wait: Duration) -> bool {
        self.shared.poll_background(wait)
    }

    /// The currently published task snapshot.
    pub fn snapshot(&self) -> Arc<Vec<ScheduledTask>> {
        self.shared.snapshot.load_full()
    }

    /// Number of tasks in the published snapshot.
    pub fn task_count(&self) -> usize {
        self.shared.snapshot.load().len()
    }

    /// Whether [`begin_shutdown`](Self::begin_shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// The scheduler's clock.
    pub fn now(&self) -> Instant {
        self.shared.now()
    }

    /// The (validated) configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        // Workers own an `Arc<Shared>`; make sure they wind down rather than
        // spin forever on an unreachable scheduler.
        self.shared.halted.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("tasks", &self.task_count())
            .field("started", &self.started.load(Ordering::Acquire))
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

// =========================================================================
// Tests
// =========================================================================
