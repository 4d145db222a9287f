//! Unified error type for Blockforge.

use blockforge_scheduler::SchedulerError;
use blockforge_session::SessionError;

use crate::{ConfigError, PersistenceError};

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each wrapping variant generates the `From`
/// impl, so `?` converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A scheduler error (bad schedule, worker spawn or join).
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A session-layer error (capacity, handshake).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A persistence backend error.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The config file could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// [`ServerBuilder::build`](crate::ServerBuilder::build) was called
    /// without a required collaborator.
    #[error("server needs a {0} collaborator")]
    MissingCollaborator(&'static str),

    /// [`Server::start`](crate::Server::start) was called twice.
    #[error("server already started")]
    AlreadyStarted,

    /// A helper thread could not be spawned.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),
}
