//! Line-oriented TCP transport for Blockforge.
//!
//! The server core is synchronous: it runs on dedicated scheduler threads.
//! This crate owns a private tokio runtime and bridges it to that world:
//!
//! - [`TcpNetwork`] implements [`NetworkBackend`]. An async accept loop
//!   pushes new connections into a queue that
//!   [`accept_pending`](NetworkBackend::accept_pending) drains without
//!   blocking.
//! - [`TcpSession`] implements [`Session`]. One task per connection moves
//!   newline-terminated text in both directions; blocking callers use
//!   [`TcpSession::recv_line`] and [`TcpSession::send_line`].
//! - [`LineHandshake`] implements [`Handshake`]: the first line a client
//!   sends is its name.
//!
//! The wire format is deliberately tiny, enough for `nc` to act as a client:
//!
//! ```text
//! client → server   Bob
//! server → client   WELCOME Bob
//! server → client   KICK Connected from elsewhere!
//! ```
//!
//! [`NetworkBackend`]: blockforge_session::NetworkBackend
//! [`Session`]: blockforge_session::Session
//! [`Handshake`]: blockforge_session::Handshake

mod error;
mod handshake;
mod tcp;

pub use error::NetError;
pub use handshake::{LineHandshake, MAX_NAME_LEN};
pub use tcp::{MAX_LINE_LEN, TcpNetwork, TcpSession};
