//! Hands the shutdown's exit code back to `main`.
//!
//! The coordinator marks the shutdown complete before it relaunches or
//! exits, so `main` waking from `wait_until_stopped` could otherwise return
//! (exit code 0) ahead of both.

use std::io;

use blockforge::{OsProcess, ProcessControl};

pub struct ExitRelay {
    os: OsProcess,
    code: flume::Sender<i32>,
}

impl ExitRelay {
    pub fn new() -> (Self, flume::Receiver<i32>) {
        let (code, rx) = flume::bounded(1);
        let relay = Self {
            os: OsProcess::current(),
            code,
        };
        (relay, rx)
    }
}

impl ProcessControl for ExitRelay {
    fn relaunch(&self) -> io::Result<()> {
        self.os.relaunch()
    }

    fn exit(&self, code: i32) {
        tracing::info!(code, "exit requested");
        let _ = self.code.try_send(code);
    }
}
