//! # Blockforge
//!
//! Core of a persistent multiplayer block-game server: a two-worker task
//! scheduler, a session registry that evicts ghost logins, and a one-shot
//! graceful shutdown sequence.
//!
//! The game protocol, storage formats and permission model live outside
//! this crate behind small traits:
//!
//! | concern | trait |
//! |---|---|
//! | accepting connections | [`NetworkBackend`](blockforge_session::NetworkBackend) |
//! | login | [`Handshake`](blockforge_session::Handshake) |
//! | stores | [`PersistenceBackend`] |
//! | chat bridges | [`Integration`] |
//! | relaunch / exit | [`ProcessControl`] |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use blockforge::prelude::*;
//! use blockforge_net::{LineHandshake, TcpNetwork};
//!
//! blockforge::logging::init();
//! let config = ServerConfig::default();
//! let network = Arc::new(TcpNetwork::bind(&config.listen_addr)?);
//! let server = Server::builder()
//!     .handshake(Arc::new(LineHandshake::new(&network)))
//!     .network(network)
//!     .config(config)
//!     .build()?;
//! server.start()?;
//! server.wait_until_stopped(None);
//! ```

mod config;
mod cpu;
mod error;
mod events;
mod integration;
mod maintenance;
mod persistence;
mod process;
mod server;
mod shutdown;

pub mod logging;

pub use config::{ConfigError, ServerConfig};
pub use error::ServerError;
pub use events::ServerEvent;
pub use integration::{Integration, IntegrationError};
pub use persistence::{NullPersistence, PersistenceBackend, PersistenceError, Store};
pub use process::{OsProcess, ProcessControl};
pub use server::{Server, ServerBuilder};
pub use shutdown::{
    DEFAULT_SHUTDOWN_MESSAGE, ShutdownCoordinator, ShutdownOutcome, ShutdownParams, ShutdownPhase,
    ShutdownReason,
};

/// Re-exports of the types most servers need.
pub mod prelude {
    pub use std::sync::Arc;

    pub use blockforge_scheduler::{ScheduledTask, TaskResult, TaskScheduler};
    pub use blockforge_session::{
        Handshake, Login, NetworkBackend, Player, Session, SessionError, SessionRegistry,
    };

    pub use crate::{
        Integration, PersistenceBackend, PersistenceError, Server, ServerConfig, ServerError,
        ServerEvent, ShutdownOutcome, ShutdownParams, ShutdownReason, Store,
    };
}
