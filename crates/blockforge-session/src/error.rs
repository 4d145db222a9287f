//! Error types for the session layer.

use std::net::IpAddr;

/// Errors that can occur while admitting a connection.
///
/// A duplicate name is deliberately *not* an error: the registry resolves it
/// by evicting the older session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Too many open sessions from one remote address.
    #[error("too many connections from {ip} (limit {limit})")]
    CapacityExceeded {
        /// The offending address.
        ip: IpAddr,
        /// The configured ceiling.
        limit: usize,
    },

    /// The global player cap is reached and the login holds no reserved slot.
    #[error("server is full ({max} players)")]
    ServerFull {
        /// The configured cap.
        max: usize,
    },

    /// The login exchange failed or the client sent something invalid.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The registry has stopped accepting connections (shutdown).
    #[error("server is not accepting connections")]
    NotAccepting,

    /// The network backend failed to accept a connection.
    #[error("accept failed: {0}")]
    AcceptFailed(String),
}

impl SessionError {
    /// The text a rejected client is shown.
    pub fn kick_message(&self) -> String {
        match self {
            Self::CapacityExceeded { .. } => "Too many connections from your IP address!".into(),
            Self::ServerFull { .. } => "Server is full!".into(),
            Self::HandshakeFailed(reason) => format!("Login failed: {reason}"),
            Self::NotAccepting => "Server is shutting down.".into(),
            Self::AcceptFailed(_) => "Connection error.".into(),
        }
    }
}
