//! Recurring and one-shot task scheduler for Blockforge.
//!
//! The scheduler owns a set of [`ScheduledTask`]s and drives them from two
//! dedicated worker threads:
//!
//! - the **primary** worker polls the task set every quantum (10 ms by
//!   default) and runs due tasks inline. Callbacks here must be short: a
//!   callback that never returns stalls every other primary task.
//! - the **background** worker drains a serial queue. Background tasks never
//!   overlap each other, which is what persistence saves and other heavy jobs
//!   rely on.
//!
//! # Snapshots
//!
//! The live task set is only mutated under a lock. After each mutation an
//! immutable array of the non-stopped tasks is published through an
//! [`arc_swap::ArcSwap`], and both workers iterate that array without
//! locking. A worker may see a task that was stopped a moment ago; the
//! per-task stopped flag filters it out.
//!
//! # Task lifecycle
//!
//! ```text
//! new_task() ──→ [Unscheduled] ──run_*()──→ [Scheduled] ──→ [Stopped]
//!                                               ↑                │
//!                                               └────run_*()─────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use blockforge_scheduler::{SchedulerConfig, TaskScheduler};
//!
//! let scheduler = TaskScheduler::new(SchedulerConfig::default());
//! scheduler.start().expect("spawn workers");
//!
//! scheduler
//!     .new_task("heartbeat", |_task| {
//!         tracing::debug!("still alive");
//!         Ok(())
//!     })
//!     .run_forever(Duration::from_secs(30))
//!     .expect("non-zero interval");
//! ```

mod clock;
mod error;
mod scheduler;
mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::SchedulerError;
pub use scheduler::TaskScheduler;
pub use task::{
    MANUAL_INTERVAL, ScheduledTask, TaskError, TaskId, TaskResult, TaskState, TaskWorker,
};

use std::time::Duration;

use tracing::warn;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the task scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long each worker sleeps between polls. Default: 10 ms.
    pub quantum: Duration,
    /// Upper bound on how long [`TaskScheduler::end_shutdown`] waits for
    /// both workers to exit. Default: 5 s.
    pub join_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quantum: Duration::from_millis(10),
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// Smallest polling quantum the workers accept.
    pub const MIN_QUANTUM: Duration = Duration::from_millis(1);

    /// Clamp out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`TaskScheduler::new`].
    pub fn validated(mut self) -> Self {
        if self.quantum < Self::MIN_QUANTUM {
            warn!(
                quantum_us = self.quantum.as_micros() as u64,
                "scheduler quantum below minimum, clamping"
            );
            self.quantum = Self::MIN_QUANTUM;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_ten_ms_quantum() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.quantum, Duration::from_millis(10));
        assert_eq!(cfg.join_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_validated_clamps_zero_quantum() {
        let cfg = SchedulerConfig {
            quantum: Duration::ZERO,
            ..SchedulerConfig::default()
        }
        .validated();
        assert_eq!(cfg.quantum, SchedulerConfig::MIN_QUANTUM);
    }
}
