//! Collaborator hooks the registry consumes.
//!
//! Blockforge doesn't speak any wire protocol itself. The network layer
//! implements [`NetworkBackend`] (hand out accepted connections) and
//! [`Handshake`] (turn a fresh connection into a claimed identity); the
//! registry drives both.

use std::sync::Arc;

use crate::{Player, Session, SessionError};

/// Source of freshly accepted connections.
pub trait NetworkBackend: Send + Sync + 'static {
    /// Returns one waiting connection, if any. Never blocks.
    ///
    /// # Errors
    /// [`SessionError::AcceptFailed`] when the listener reports a failure.
    /// The registry logs it and keeps polling.
    fn accept_pending(&self) -> Result<Option<Arc<dyn Session>>, SessionError>;

    /// Stops accepting new connections. Idempotent.
    fn stop_accepting(&self);
}

/// What a successful handshake yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    /// The display name the client claims. Compared case-insensitively.
    pub name: String,
    /// Whether this identity may log in past the player cap (a rank
    /// attribute owned by the permission system).
    pub reserved_slot: bool,
}

impl Login {
    /// A login without a reserved slot.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reserved_slot: false,
        }
    }
}

/// Runs the login exchange on a new connection.
///
/// Called on a dedicated short-lived thread per connection, so blocking
/// reads are fine.
pub trait Handshake: Send + Sync + 'static {
    /// Performs the login exchange and returns the claimed identity.
    ///
    /// # Errors
    /// [`SessionError::HandshakeFailed`] (or any other variant) rejects the
    /// connection; the session is kicked with the error's message.
    fn perform(&self, session: &Arc<dyn Session>) -> Result<Login, SessionError>;

    /// Called after the login was registered. The default does nothing.
    fn on_registered(&self, _player: &Player) {}
}
