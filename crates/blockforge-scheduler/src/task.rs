//! Scheduled tasks: the unit of work the scheduler runs.
//!
//! A [`ScheduledTask`] is a cheap, cloneable handle. Clones share the same
//! underlying task, so a callback can stop or re-arm "itself" through the
//! handle it is given.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::SchedulerError;
use crate::scheduler::Shared;

/// Error type a task callback may return.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Result type of a task callback.
pub type TaskResult = Result<(), TaskError>;

type Callback = Box<dyn FnMut(&ScheduledTask) -> TaskResult + Send>;

/// Interval used by [`ScheduledTask::run_manual`]: about a century, i.e.
/// "never again unless re-armed".
pub const MANUAL_INTERVAL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque task identity. Only meaningful for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Which worker thread runs a task's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskWorker {
    /// Runs inline on the primary polling worker.
    Primary,
    /// Queued onto the serial background worker.
    Background,
}

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created but never armed by a run-entry operation.
    Unscheduled,
    /// Registered with the scheduler and waiting for its due time.
    Scheduled,
    /// Will not run again unless re-armed.
    Stopped,
}

#[derive(Debug, Clone)]
struct Timing {
    next_time: Instant,
    delay: Duration,
    interval: Duration,
    /// `None` = unbounded.
    repeats_left: Option<u32>,
    recurring: bool,
}

struct TaskInner {
    id: TaskId,
    label: String,
    worker: TaskWorker,
    callback: Mutex<Callback>,
    user_state: Option<Arc<dyn Any + Send + Sync>>,
    timing: Mutex<Timing>,
    armed: AtomicBool,
    /// Bumped by every run-entry operation.
    generation: AtomicU64,
    stopped: AtomicBool,
    executing: AtomicBool,
    queued: AtomicBool,
    adjust_for_execution_time: AtomicBool,
    invocations: AtomicU64,
    failures: AtomicU64,
    scheduler: Weak<Shared>,
}

/// A unit of deferred or recurring work.
///
/// Created by [`TaskScheduler::new_task`](crate::TaskScheduler::new_task) or
/// [`TaskScheduler::new_background_task`](crate::TaskScheduler::new_background_task)
/// in the unscheduled state. One of the `run_*` operations arms it and
/// registers it with the scheduler; each returns the handle again so calls
/// chain.
#[derive(Clone)]
pub struct ScheduledTask {
    inner: Arc<TaskInner>,
}

impl ScheduledTask {
    pub(crate) fn new(
        scheduler: &Arc<Shared>,
        label: String,
        worker: TaskWorker,
        user_state: Option<Arc<dyn Any + Send + Sync>>,
        callback: Callback,
    ) -> Self {
        let now = scheduler.now();
        Self {
            inner: Arc::new(TaskInner {
                id: TaskId::next(),
                label,
                worker,
                callback: Mutex::new(callback),
                user_state,
                timing: Mutex::new(Timing {
                    next_time: now,
                    delay: Duration::ZERO,
                    interval: Duration::ZERO,
                    repeats_left: None,
                    recurring: false,
                }),
                armed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                executing: AtomicBool::new(false),
                queued: AtomicBool::new(false),
                adjust_for_execution_time: AtomicBool::new(true),
                invocations: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                scheduler: Arc::downgrade(scheduler),
            }),
        }
    }

    // -- Run-entry operations ---------------------------------------------

    /// Runs the callback exactly once, `delay` from now.
    pub fn run_once(&self, delay: Duration) -> Self {
        let now = self.now();
        self.arm(Timing {
            next_time: offset(now, delay),
            delay,
            interval: Duration::ZERO,
            repeats_left: None,
            recurring: false,
        })
    }

    /// Runs the callback exactly once, at `when` (immediately if `when` is
    /// already in the past).
    pub fn run_once_at(&self, when: Instant) -> Self {
        let delay = when.saturating_duration_since(self.now());
        self.run_once(delay)
    }

    /// Runs the callback every `interval`, forever. The first run happens
    /// one interval from now. A zero interval runs it on every poll.
    ///
    /// Returns `Result` for symmetry with
    /// [`run_repeating`](Self::run_repeating); every `Duration` is a valid
    /// interval.
    pub fn run_forever(&self, interval: Duration) -> Result<Self, SchedulerError> {
        self.run_forever_after(interval, interval)
    }

    /// Runs the callback every `interval`, forever, starting `delay` from
    /// now.
    pub fn run_forever_after(
        &self,
        interval: Duration,
        delay: Duration,
    ) -> Result<Self, SchedulerError> {
        let now = self.now();
        Ok(self.arm(Timing {
            next_time: offset(now, delay),
            delay,
            interval,
            repeats_left: None,
            recurring: true,
        }))
    }

    /// Runs the callback `times` times, `interval` apart, starting `delay`
    /// from now.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidArgument`] if `times` is zero.
    pub fn run_repeating(
        &self,
        delay: Duration,
        interval: Duration,
        times: u32,
    ) -> Result<Self, SchedulerError> {
        if times < 1 {
            return Err(SchedulerError::InvalidArgument(format!(
                "task {:?} must repeat at least once, got {times}",
                self.inner.label
            )));
        }
        let now = self.now();
        Ok(self.arm(Timing {
            next_time: offset(now, delay),
            delay,
            interval,
            repeats_left: Some(times),
            recurring: true,
        }))
    }

    /// Schedules one run `delay` from now, but keeps the task recurring with
    /// a [`MANUAL_INTERVAL`] so it can be re-armed later by calling any
    /// `run_*` operation again.
    pub fn run_manual(&self, delay: Duration) -> Self {
        let now = self.now();
        self.arm(Timing {
            next_time: offset(now, delay),
            delay,
            interval: MANUAL_INTERVAL,
            repeats_left: None,
            recurring: true,
        })
    }

    /// Like [`run_manual`](Self::run_manual), due at `when`.
    pub fn run_manual_at(&self, when: Instant) -> Self {
        let delay = when.saturating_duration_since(self.now());
        self.run_manual(delay)
    }

    /// Stops the task. It will not be invoked again, even if a worker is
    /// holding a snapshot that still contains it. Idempotent.
    pub fn stop(&self) -> Self {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            trace!(task = %self.inner.label, id = %self.inner.id, "task stopped");
        }
        self.clone()
    }

    /// Whether a recurring task measures its next due time from its previous
    /// due time (`true`, the default) or from when its callback returned.
    pub fn adjust_for_execution_time(&self, adjust: bool) -> Self {
        self.inner
            .adjust_for_execution_time
            .store(adjust, Ordering::Release);
        self.clone()
    }

    // -- Accessors ---------------------------------------------------------

    /// The task's identity.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// The label given at construction, used in log output.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Which worker runs this task.
    pub fn worker(&self) -> TaskWorker {
        self.inner.worker
    }

    /// Shorthand for `worker() == TaskWorker::Background`.
    pub fn is_background(&self) -> bool {
        self.inner.worker == TaskWorker::Background
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        if self.is_stopped() {
            TaskState::Stopped
        } else if self.inner.armed.load(Ordering::Acquire) {
            TaskState::Scheduled
        } else {
            TaskState::Unscheduled
        }
    }

    /// Whether the task has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// `true` only while the callback is running.
    pub fn is_executing(&self) -> bool {
        self.inner.executing.load(Ordering::Acquire)
    }

    /// Whether the last run-entry operation made the task recurring.
    pub fn is_recurring(&self) -> bool {
        self.inner.timing.lock().recurring
    }

    /// See [`adjust_for_execution_time`](Self::adjust_for_execution_time).
    pub fn adjusts_for_execution_time(&self) -> bool {
        self.inner.adjust_for_execution_time.load(Ordering::Acquire)
    }

    /// When the task is next due.
    pub fn next_time(&self) -> Instant {
        self.inner.timing.lock().next_time
    }

    /// The delay given to the last run-entry operation.
    pub fn delay(&self) -> Duration {
        self.inner.timing.lock().delay
    }

    /// The recurrence interval (zero for one-shot tasks).
    pub fn interval(&self) -> Duration {
        self.inner.timing.lock().interval
    }

    /// Remaining permitted invocations; `None` when unbounded.
    pub fn repeats_left(&self) -> Option<u32> {
        self.inner.timing.lock().repeats_left
    }

    /// Number of times the callback has been invoked.
    pub fn invocations(&self) -> u64 {
        self.inner.invocations.load(Ordering::Acquire)
    }

    /// Number of invocations that returned an error or panicked.
    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Acquire)
    }

    /// The opaque payload attached at construction, if it is a `T`.
    pub fn user_state<T: Any>(&self) -> Option<&T> {
        self.inner.user_state.as_deref()?.downcast_ref::<T>()
    }

    // -- Scheduler internals ----------------------------------------------

    fn now(&self) -> Instant {
        self.inner
            .scheduler
            .upgrade()
            .map_or_else(Instant::now, |shared| shared.now())
    }

    /// Installs new timing and registers the task. A stopped task stays
    /// stopped until the scheduler has checked, under the task-set lock,
    /// that it is not shutting down.
    fn arm(&self, timing: Timing) -> Self {
        *self.inner.timing.lock() = timing;
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.armed.store(true, Ordering::Release);

        match self.inner.scheduler.upgrade() {
            Some(shared) => shared.add_task(self.clone()),
            None => {
                warn!(task = %self.inner.label, "scheduler is gone, task not scheduled");
                self.inner.stopped.store(true, Ordering::Release);
            }
        }
        self.clone()
    }

    /// Clears the stopped flag. Only called by the scheduler while it holds
    /// the task-set lock and is not shutting down.
    pub(crate) fn revive(&self) {
        self.inner.stopped.store(false, Ordering::Release);
    }

    /// Returns `true` if the task is due at `now`. For recurring tasks that
    /// adjust for execution time, the next due time is advanced by one
    /// interval before the callback runs.
    pub(crate) fn take_due(&self, now: Instant) -> bool {
        let mut timing = self.inner.timing.lock();
        if timing.next_time > now {
            return false;
        }
        if timing.recurring && self.adjusts_for_execution_time() {
            timing.next_time = offset(timing.next_time, timing.interval);
        }
        true
    }

    /// Invokes the callback, containing any error or panic.
    ///
    /// Returns the arming generation observed before the callback ran; pass
    /// it to [`finish`](Self::finish).
    pub(crate) fn invoke(&self) -> u64 {
        let generation = self.inner.generation.load(Ordering::Acquire);
        let _executing = ExecutingGuard::enter(&self.inner.executing);
        self.inner.invocations.fetch_add(1, Ordering::AcqRel);

        let mut callback = self.inner.callback.lock();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (*callback)(self)));
        drop(callback);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.inner.failures.fetch_add(1, Ordering::AcqRel);
                error!(
                    task = %self.inner.label,
                    worker = ?self.inner.worker,
                    error = %e,
                    "scheduled task failed"
                );
            }
            Err(payload) => {
                self.inner.failures.fetch_add(1, Ordering::AcqRel);
                error!(
                    task = %self.inner.label,
                    worker = ?self.inner.worker,
                    panic = panic_message(payload.as_ref()),
                    "scheduled task panicked"
                );
            }
        }
        generation
    }

    /// Post-invocation bookkeeping: stop one-shot and exhausted tasks,
    /// count down bounded ones, and re-base tasks that do not adjust for
    /// execution time. Skipped when the callback re-armed its own task.
    pub(crate) fn finish(&self, now: Instant, generation: u64) {
        if self.inner.generation.load(Ordering::Acquire) != generation {
            return;
        }
        let mut timing = self.inner.timing.lock();
        if !timing.recurring || timing.repeats_left == Some(1) {
            drop(timing);
            self.stop();
            return;
        }
        if let Some(left) = timing.repeats_left.as_mut() {
            *left -= 1;
        }
        if !self.adjusts_for_execution_time() {
            timing.next_time = offset(now, timing.interval);
        }
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.inner.queued.load(Ordering::Acquire)
    }

    pub(crate) fn set_queued(&self, queued: bool) {
        self.inner.queued.store(queued, Ordering::Release);
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ScheduledTask {}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("worker", &self.inner.worker)
            .field("state", &self.state())
            .field("executing", &self.is_executing())
            .finish()
    }
}

/// Clears the executing flag on drop, so it is reset even when the callback
/// panics.
struct ExecutingGuard<'a>(&'a AtomicBool);

impl<'a> ExecutingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// `base + by`, saturating at [`MANUAL_INTERVAL`] past `base` if the
/// platform's `Instant` cannot represent the sum.
fn offset(base: Instant, by: Duration) -> Instant {
    base.checked_add(by)
        .or_else(|| base.checked_add(MANUAL_INTERVAL))
        .unwrap_or(base)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
