//! Session registry for Blockforge.
//!
//! This crate decides how raw connections become registered players:
//!
//! 1. **Acceptance**: [`SessionRegistry::accept_pending`] pulls one waiting
//!    connection from the [`NetworkBackend`] and enforces the per-address
//!    connection ceiling.
//! 2. **Handshake**: the [`Handshake`] collaborator runs on a short-lived
//!    worker thread and produces a [`Login`].
//! 3. **Registration**: [`SessionRegistry::register_player`] enforces unique
//!    case-insensitive names (kicking and waiting out any "ghost" session
//!    under the same name) and the global player cap.
//!
//! # How it fits in the stack
//!
//! ```text
//! Server (above)          ← polls accept_pending() from a scheduler task
//!     ↕
//! Session layer (this crate) ← owns the session index and player list
//!     ↕
//! Network backend (below) ← produces Session objects, speaks the wire protocol
//! ```
//!
//! The player list is published as an immutable snapshot, so readers never
//! take the registry lock.

mod backend;
mod error;
mod player;
mod registry;
mod session;

pub use backend::{Handshake, Login, NetworkBackend};
pub use error::SessionError;
pub use player::Player;
pub use registry::{GHOST_KICK_REASON, RegistryEvent, SessionRegistry};
pub use session::{Session, SessionConfig, SessionId};
