//! The line-protocol login: the client's first line is its name.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use blockforge_session::{Handshake, Login, Player, Session, SessionError};
use parking_lot::RwLock;

use crate::tcp::{SessionTable, TcpSession};
use crate::{NetError, TcpNetwork};

/// Longest name a client may claim.
pub const MAX_NAME_LEN: usize = 16;

const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads a name from each new [`TcpSession`] and greets registered players
/// with `WELCOME <name>`.
///
/// Names listed with [`reserve`](Self::reserve) get a reserved slot and may
/// log in when the server is full.
pub struct LineHandshake {
    table: SessionTable,
    timeout: Duration,
    reserved: RwLock<HashSet<String>>,
}

impl LineHandshake {
    /// A handshake for sessions accepted by `network`.
    pub fn new(network: &TcpNetwork) -> Self {
        Self {
            table: network.table(),
            timeout: DEFAULT_LOGIN_TIMEOUT,
            reserved: RwLock::new(HashSet::new()),
        }
    }

    /// How long a client has to send its name. Default: 10 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Grants `name` a reserved slot (case-insensitive).
    pub fn reserve(&self, name: &str) {
        self.reserved.write().insert(name.to_lowercase());
    }

    fn lookup(&self, session: &Arc<dyn Session>) -> Option<Arc<TcpSession>> {
        self.table.lock().get(&session.id()).and_then(|weak| weak.upgrade())
    }
}

impl Handshake for LineHandshake {
    fn perform(&self, session: &Arc<dyn Session>) -> Result<Login, SessionError> {
        let tcp = self
            .lookup(session)
            .ok_or_else(|| SessionError::HandshakeFailed("connection already closed".into()))?;

        let name = match tcp.recv_line(self.timeout) {
            Ok(Some(line)) => line.trim().to_string(),
            Ok(None) => return Err(SessionError::HandshakeFailed("disconnected".into())),
            Err(NetError::Timeout) => return Err(SessionError::HandshakeFailed("timed out".into())),
            Err(e) => return Err(SessionError::HandshakeFailed(e.to_string())),
        };
        if !is_valid_name(&name) {
            return Err(SessionError::HandshakeFailed(format!("invalid name {name:?}")));
        }

        let reserved_slot = self.reserved.read().contains(&name.to_lowercase());
        Ok(Login {
            name,
            reserved_slot,
        })
    }

    fn on_registered(&self, player: &Player) {
        if let Some(tcp) = self.lookup(player.session()) {
            if let Err(e) = tcp.send_line(&format!("WELCOME {}", player.name())) {
                tracing::debug!(player = %player.name(), error = %e, "welcome not delivered");
            }
        }
    }
}

impl std::fmt::Debug for LineHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineHandshake")
            .field("timeout", &self.timeout)
            .field("reserved", &self.reserved.read().len())
            .finish_non_exhaustive()
    }
}

/// 1 to 16 characters, each ASCII alphanumeric, `_` or `.`.
fn is_valid_name(name: &str) -> bool {
    (1..=MAX_NAME_LEN).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
