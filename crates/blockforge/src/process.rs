//! Process-level effects applied after a shutdown completes.

use std::ffi::OsString;
use std::process::Command;

/// Relaunch and exit, abstracted so tests can observe them.
pub trait ProcessControl: Send + Sync + 'static {
    /// Starts a fresh copy of the server with the original arguments.
    fn relaunch(&self) -> std::io::Result<()>;

    /// Terminates the process with `code`.
    fn exit(&self, code: i32);
}

/// The real process.
#[derive(Debug, Clone)]
pub struct OsProcess {
    args: Vec<OsString>,
}

impl OsProcess {
    /// Captures the current command-line arguments (minus the program name)
    /// for a later relaunch.
    pub fn current() -> Self {
        Self {
            args: std::env::args_os().skip(1).collect(),
        }
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

impl ProcessControl for OsProcess {
    fn relaunch(&self) -> std::io::Result<()> {
        let exe = std::env::current_exe()?;
        let child = Command::new(&exe).args(&self.args).spawn()?;
        tracing::info!(exe = %exe.display(), pid = child.id(), "relaunched server");
        Ok(())
    }

    fn exit(&self, code: i32) {
        tracing::info!(code, "exiting");
        std::process::exit(code);
    }
}
