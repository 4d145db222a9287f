//! Periodic housekeeping tasks installed by [`Server::start`](crate::Server::start).
//!
//! Every callback holds only a weak reference to the server, so a dropped
//! server's tasks stop themselves instead of keeping it alive.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use blockforge_scheduler::{ScheduledTask, SchedulerError, TaskResult};
use tracing::{debug, info};

use crate::persistence;
use crate::server::ServerInner;
use crate::{ShutdownParams, ShutdownReason};

pub(crate) const ACCEPT_TASK: &str = "accept-connections";
pub(crate) const REAPER_TASK: &str = "session-reaper";
pub(crate) const IDLE_TASK: &str = "idle-check";
pub(crate) const CPU_TASK: &str = "cpu-monitor";
pub(crate) const COMPACTION_TASK: &str = "compaction-request";
pub(crate) const SAVE_TASK: &str = "save-stores";
pub(crate) const RESTART_TASK: &str = "scheduled-restart";

/// Text shown to players kicked by a scheduled restart.
const RESTART_MESSAGE: &str = "Server is restarting.";

/// Runs `f` against the server if it still exists; otherwise stops `task`.
fn with_server(
    server: &Weak<ServerInner>,
    task: &ScheduledTask,
    f: impl FnOnce(&Arc<ServerInner>) -> TaskResult,
) -> TaskResult {
    match server.upgrade() {
        Some(inner) => f(&inner),
        None => {
            task.stop();
            Ok(())
        }
    }
}

/// Arms every maintenance task the config enables.
pub(crate) fn install(inner: &Arc<ServerInner>) -> Result<Vec<ScheduledTask>, SchedulerError> {
    let config = &inner.config;
    let scheduler = &inner.scheduler;
    let mut tasks = Vec::new();

    let server = Arc::downgrade(inner);
    tasks.push(
        scheduler
            .new_task(ACCEPT_TASK, move |task| {
                with_server(&server, task, |inner| {
                    inner.registry.accept_pending();
                    Ok(())
                })
            })
            .run_forever_after(config.accept_poll_interval(), Duration::ZERO)?,
    );

    let server = Arc::downgrade(inner);
    tasks.push(
        scheduler
            .new_task(REAPER_TASK, move |task| {
                with_server(&server, task, |inner| {
                    let reaped = inner.registry.reap_disconnected();
                    if reaped > 0 {
                        debug!(reaped, "reaped disconnected sessions");
                    }
                    Ok(())
                })
            })
            .run_forever(config.reap_interval())?,
    );

    if let Some(max_idle) = config.max_idle() {
        let server = Arc::downgrade(inner);
        let message = idle_kick_message(max_idle);
        tasks.push(
            scheduler
                .new_task(IDLE_TASK, move |task| {
                    with_server(&server, task, |inner| {
                        kick_idle_players(inner, max_idle, &message);
                        Ok(())
                    })
                })
                .run_forever(config.idle_check_interval())?,
        );
    }

    let server = Arc::downgrade(inner);
    tasks.push(
        scheduler
            .new_task(CPU_TASK, move |task| {
                with_server(&server, task, |inner| {
                    if let Some(usage) = inner.cpu.sample() {
                        info!(
                            cpu_percent = %format!("{usage:.1}"),
                            players = inner.registry.player_count(),
                            "resource usage"
                        );
                    }
                    Ok(())
                })
            })
            .run_forever_after(config.cpu_monitor_interval(), Duration::ZERO)?,
    );

    let server = Arc::downgrade(inner);
    tasks.push(
        scheduler
            .new_background_task(COMPACTION_TASK, move |task| {
                with_server(&server, task, |inner| {
                    if inner.compaction_requested.swap(false, Ordering::AcqRel) {
                        let started = Instant::now();
                        inner.persistence.compact()?;
                        info!(elapsed_ms = started.elapsed().as_millis() as u64, "compaction finished");
                    }
                    Ok(())
                })
            })
            .run_forever(config.compaction_interval())?,
    );

    let server = Arc::downgrade(inner);
    tasks.push(
        scheduler
            .new_background_task(SAVE_TASK, move |task| {
                with_server(&server, task, |inner| {
                    let failures = persistence::save_all(inner.persistence.as_ref());
                    if failures > 0 {
                        return Err(format!("{failures} store(s) failed to save").into());
                    }
                    debug!("stores saved");
                    Ok(())
                })
            })
            .run_forever(config.save_interval())?,
    );

    if let Some(after) = config.restart_after() {
        let server = Arc::downgrade(inner);
        tasks.push(
            scheduler
                .new_task(RESTART_TASK, move |task| {
                    with_server(&server, task, |inner| {
                        info!("scheduled restart is due");
                        let params = ShutdownParams::new(ShutdownReason::Restarting)
                            .restart(true)
                            .kill_process(true)
                            .reason_text(RESTART_MESSAGE)
                            .initiated_by(RESTART_TASK);
                        inner.coordinator.shutdown(params, false);
                        Ok(())
                    })
                })
                .run_once(after),
        );
    }

    debug!(count = tasks.len(), "maintenance tasks installed");
    Ok(tasks)
}

fn kick_idle_players(inner: &ServerInner, max_idle: Duration, message: &str) {
    let now = Instant::now();
    for player in inner.registry.players().iter() {
        let idle = now.saturating_duration_since(player.session().last_active());
        if idle > max_idle {
            info!(player = %player.name(), idle_secs = idle.as_secs(), "kicking idle player");
            player.kick(message);
        }
    }
}

/// "Idle for more than N minutes", rounded down but never below one.
pub(crate) fn idle_kick_message(max_idle: Duration) -> String {
    let minutes = (max_idle.as_secs() / 60).max(1);
    if minutes == 1 {
        "Idle for more than 1 minute".to_string()
    } else {
        format!("Idle for more than {minutes} minutes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_kick_message_whole_minutes() {
        assert_eq!(idle_kick_message(Duration::from_secs(600)), "Idle for more than 10 minutes");
    }

    #[test]
    fn test_idle_kick_message_under_a_minute_says_one() {
        assert_eq!(idle_kick_message(Duration::from_secs(20)), "Idle for more than 1 minute");
    }

    #[test]
    fn test_idle_kick_message_rounds_down() {
        assert_eq!(idle_kick_message(Duration::from_secs(150)), "Idle for more than 2 minutes");
    }
}
