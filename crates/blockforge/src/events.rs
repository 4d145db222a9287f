//! Lifecycle notifications.

use crate::ShutdownReason;

/// Buffered events per subscriber before the slowest one starts lagging.
pub(crate) const EVENT_CAPACITY: usize = 64;

/// Published on the channel returned by [`Server::subscribe`](crate::Server::subscribe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The irrevocable part of a shutdown has started.
    ShutdownBegan {
        reason: ShutdownReason,
        message: String,
    },
    /// Shutdown finished; process effects (relaunch, exit) come next.
    ShutdownEnded { reason: ShutdownReason },
    /// A player joined or left; `count` is the new number of players.
    PlayerListChanged { count: usize },
}
