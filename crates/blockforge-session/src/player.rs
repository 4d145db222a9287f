//! A registered player: a session that passed the handshake and the
//! registry's identity and capacity checks.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::{Session, SessionId};

/// A registered player.
///
/// Handed out as `Arc<Player>`; the registry's published player list is a
/// `Vec` of these.
pub struct Player {
    name: String,
    session: Arc<dyn Session>,
    reserved_slot: bool,
    registered_at: Instant,
}

impl Player {
    pub(crate) fn new(
        name: String,
        session: Arc<dyn Session>,
        reserved_slot: bool,
        registered_at: Instant,
    ) -> Self {
        Self {
            name,
            session,
            reserved_slot,
            registered_at,
        }
    }

    /// The display name, as the client spelled it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying connection.
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Shorthand for `session().id()`.
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Whether this player may exceed the player cap.
    pub fn has_reserved_slot(&self) -> bool {
        self.reserved_slot
    }

    /// When the registration completed.
    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    /// Whether the connection is still open.
    pub fn is_online(&self) -> bool {
        self.session.is_online()
    }

    /// Kicks the player with `reason`.
    pub fn kick(&self, reason: &str) {
        self.session.kick(reason);
    }

    /// Case-insensitive name comparison.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.to_lowercase() == name.to_lowercase()
    }
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("name", &self.name)
            .field("session", &self.session.id())
            .field("reserved_slot", &self.reserved_slot)
            .finish()
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
