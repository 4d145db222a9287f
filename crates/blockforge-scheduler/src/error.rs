//! Error types for the scheduler.

use std::time::Duration;

/// Errors surfaced synchronously by the scheduler.
///
/// Failures *inside* a task's callback never show up here. They are caught
/// and logged, and the task keeps its schedule.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A run-entry operation was called with parameters that make no sense
    /// (zero interval, zero repeat count).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// [`TaskScheduler::start`](crate::TaskScheduler::start) was called twice.
    #[error("scheduler workers already started")]
    AlreadyStarted,

    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn scheduler worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// One or more workers did not exit within the join timeout.
    /// They are left detached.
    #[error("scheduler workers did not exit within {timeout:?}: {workers}")]
    JoinTimeout {
        /// Names of the workers still running.
        workers: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },
}
