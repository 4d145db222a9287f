//! Process CPU sampling.
//!
//! Reads the process's user and system time from `/proc/self/stat` and
//! turns the difference between two samples into a utilisation figure
//! (100.0 = one core fully busy). On platforms without procfs the monitor
//! simply never produces a value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Kernel clock ticks per second for `/proc/*/stat` times. Linux fixes
/// USER_HZ at 100 on every mainstream architecture.
const CLOCK_TICKS_PER_SEC: u64 = 100;

const NO_SAMPLE: u64 = u64::MAX;

#[derive(Debug)]
pub(crate) struct CpuMonitor {
    last: Mutex<Option<(Instant, Duration)>>,
    /// `f64` bits of the latest utilisation, or `NO_SAMPLE`.
    usage: AtomicU64,
}

impl CpuMonitor {
    pub(crate) fn new() -> Self {
        Self {
            last: Mutex::new(None),
            usage: AtomicU64::new(NO_SAMPLE),
        }
    }

    /// Takes a sample and returns the utilisation since the previous one.
    /// The first sample only sets the baseline.
    pub(crate) fn sample(&self) -> Option<f64> {
        let cpu = read_process_cpu_time()?;
        self.record(Instant::now(), cpu)
    }

    fn record(&self, now: Instant, cpu: Duration) -> Option<f64> {
        let previous = self.last.lock().replace((now, cpu));
        let (then, cpu_then) = previous?;
        let wall = now.saturating_duration_since(then);
        if wall.is_zero() {
            return None;
        }
        let used = cpu.saturating_sub(cpu_then);
        let percent = used.as_secs_f64() / wall.as_secs_f64() * 100.0;
        self.usage.store(percent.to_bits(), Ordering::Release);
        Some(percent)
    }

    /// The most recent utilisation, if two samples have been taken.
    pub(crate) fn usage(&self) -> Option<f64> {
        match self.usage.load(Ordering::Acquire) {
            NO_SAMPLE => None,
            bits => Some(f64::from_bits(bits)),
        }
    }
}

fn read_process_cpu_time() -> Option<Duration> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    parse_cpu_time(&stat)
}

/// Extracts `utime + stime` from a `/proc/<pid>/stat` line.
///
/// The command name (field 2) is parenthesised and may contain spaces, so
/// fields are counted from the last `)`. `utime` and `stime` are fields 14
/// and 15 overall, i.e. the 12th and 13th after the name.
fn parse_cpu_time(stat: &str) -> Option<Duration> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next()?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    let ticks = utime + stime;
    Some(Duration::from_millis(ticks * 1000 / CLOCK_TICKS_PER_SEC))
}
