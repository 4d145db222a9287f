//! A runnable server on the line-based TCP transport.
//!
//! ```text
//! cargo run -p sandbox -- [config.json] [data-dir]
//! ```
//!
//! Connect with `nc localhost 25565`, type a name, and use the console
//! (`help`) to list players, ban them, or stop the server.

mod console;
mod exit;
mod storage;

use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blockforge::prelude::*;
use blockforge_net::{LineHandshake, TcpNetwork};

use crate::exit::ExitRelay;
use crate::storage::JsonStorage;

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

/// Line login plus a ban check and a player-database entry per login.
struct SandboxLogin {
    line: LineHandshake,
    storage: Arc<JsonStorage>,
}

impl Handshake for SandboxLogin {
    fn perform(&self, session: &Arc<dyn Session>) -> Result<Login, SessionError> {
        let login = self.line.perform(session)?;
        if self.storage.is_banned(&login.name) {
            return Err(SessionError::HandshakeFailed("you are banned".into()));
        }
        Ok(login)
    }

    fn on_registered(&self, player: &Player) {
        self.storage.record_login(player.name());
        self.line.on_registered(player);
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<(), Box<dyn Error>> {
    blockforge::logging::init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let data_dir = args.next().unwrap_or_else(|| "sandbox-data".to_string());

    let storage = Arc::new(JsonStorage::open(&data_dir, &["main", "nether"])?);
    let network = Arc::new(TcpNetwork::bind(&config.listen_addr)?);
    tracing::info!(addr = %network.local_addr(), data = %data_dir, "sandbox listening");

    let login = SandboxLogin {
        line: LineHandshake::new(&network),
        storage: storage.clone(),
    };
    let (process, exit_code) = ExitRelay::new();
    let server = Arc::new(
        Server::builder()
            .config(config)
            .network(network)
            .handshake(Arc::new(login))
            .persistence(storage.clone())
            .process(Arc::new(process))
            .build()?,
    );
    server.start()?;

    let mut events = server.subscribe();
    thread::Builder::new()
        .name("sandbox-events".into())
        .spawn(move || {
            while let Ok(event) = events.blocking_recv() {
                match event {
                    ServerEvent::PlayerListChanged { count } => tracing::info!(count, "players online"),
                    ServerEvent::ShutdownBegan { reason, message } => {
                        tracing::info!(%reason, %message, "stopping")
                    }
                    ServerEvent::ShutdownEnded { reason } => tracing::info!(%reason, "stopped"),
                }
            }
        })?;

    let console_server = server.clone();
    thread::Builder::new()
        .name("sandbox-console".into())
        .spawn(move || console::run(console_server, storage))?;

    server.wait_until_stopped(None);
    // Relaunch and exit run just after completion.
    match exit_code.recv_timeout(Duration::from_secs(5)) {
        Ok(code) => std::process::exit(code),
        Err(_) => Ok(()),
    }
}
