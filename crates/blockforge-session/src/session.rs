//! Session types: the server's view of one connection.
//!
//! A session is owned by the network backend. The registry only ever talks
//! to it through the [`Session`] trait, so it never needs to know anything
//! about the wire protocol.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Opaque identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a new `SessionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One client connection, as seen by the registry.
///
/// Implementations must be cheap to query from any thread: the registry
/// calls these methods from scheduler workers, handshake workers and the
/// shutdown worker.
pub trait Session: Send + Sync + 'static {
    /// Stable identity of this session.
    fn id(&self) -> SessionId;

    /// The remote peer's address.
    fn remote_addr(&self) -> SocketAddr;

    /// When the connection was accepted.
    fn created_at(&self) -> Instant;

    /// When the client last sent anything.
    fn last_active(&self) -> Instant;

    /// Whether the connection is still open.
    fn is_online(&self) -> bool;

    /// Sends a best-effort farewell message carrying `reason`, then begins
    /// closing the connection. Delivery is not guaranteed.
    fn kick(&self, reason: &str);

    /// Blocks until the connection has fully closed or `timeout` elapses.
    /// Returns `true` if the session is offline.
    fn wait_for_disconnect(&self, timeout: Duration) -> bool;

    /// Closes the connection immediately, without a farewell.
    fn close(&self);
}

impl fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("remote_addr", &self.remote_addr())
            .field("online", &self.is_online())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Limits enforced by the registry.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Registered players allowed at once. Players holding a reserved slot
    /// may exceed it. Default: 32.
    pub max_players: usize,

    /// Open sessions allowed per remote IP address. Loopback addresses are
    /// exempt. Default: 5.
    pub max_connections_per_ip: usize,

    /// How long to wait for a kicked session to disconnect before closing it
    /// by force. Default: 5 seconds.
    pub disconnect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_players: 32,
            max_connections_per_ip: 5,
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId::new(7).to_string(), "session-7");
    }

    #[test]
    fn test_session_id_round_trips_inner() {
        assert_eq!(SessionId::new(42).into_inner(), 42);
    }

    #[test]
    fn test_default_config_values() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.max_players, 32);
        assert_eq!(cfg.max_connections_per_ip, 5);
        assert_eq!(cfg.disconnect_timeout, Duration::from_secs(5));
    }
}
