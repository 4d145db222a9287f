//! The session registry: accepted connections and registered players.
//!
//! # Locking
//!
//! One mutex guards the session index and the name index together. It is
//! never held across anything that can block: evicting a ghost session
//! (kick, then wait for its disconnect) happens with the lock released, and
//! the player-count check is repeated after re-acquiring it.
//!
//! Readers use [`SessionRegistry::players`], an immutable snapshot that is
//! swapped in whole after every change.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{Handshake, Login, NetworkBackend, Player, Session, SessionConfig, SessionError, SessionId};

/// Message shown to a session evicted by a newer login under the same name.
pub const GHOST_KICK_REASON: &str = "Connected from elsewhere!";

const EVENT_CAPACITY: usize = 64;

/// Change notifications published by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A player finished registering.
    PlayerJoined { name: String },
    /// A player was removed (disconnect, eviction or shutdown).
    PlayerLeft { name: String },
    /// The player list changed; `count` is the new size.
    PlayerListChanged { count: usize },
}

#[derive(Default)]
struct Index {
    sessions: HashMap<SessionId, Arc<dyn Session>>,
    /// Keyed by lowercased name.
    players: HashMap<String, Arc<Player>>,
}

impl Index {
    fn remove_player_for(&mut self, id: SessionId) -> Option<Arc<Player>> {
        let key = self
            .players
            .iter()
            .find(|(_, p)| p.session_id() == id)
            .map(|(k, _)| k.clone())?;
        self.players.remove(&key)
    }
}

/// Tracks accepted sessions and registered players.
///
/// Always used behind an `Arc`: [`accept_pending`](Self::accept_pending)
/// hands a clone to the handshake thread.
pub struct SessionRegistry {
    config: SessionConfig,
    network: Arc<dyn NetworkBackend>,
    handshake: Arc<dyn Handshake>,
    index: Mutex<Index>,
    roster: ArcSwap<Vec<Arc<Player>>>,
    accepting: AtomicBool,
    events: broadcast::Sender<RegistryEvent>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        network: Arc<dyn NetworkBackend>,
        handshake: Arc<dyn Handshake>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            network,
            handshake,
            index: Mutex::new(Index::default()),
            roster: ArcSwap::from_pointee(Vec::new()),
            accepting: AtomicBool::new(true),
            events,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribes to player list notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Acceptance
    // -----------------------------------------------------------------------

    /// Takes at most one waiting connection from the network backend.
    ///
    /// Returns `true` if a connection was taken (accepted or rejected), so a
    /// caller can drain the backlog by looping. Rejected connections are
    /// kicked with the rejection message. Accepted ones are handed to a
    /// handshake thread. Nothing here propagates: failures are logged.
    pub fn accept_pending(self: &Arc<Self>) -> bool {
        if !self.is_accepting() {
            return false;
        }
        let session = match self.network.accept_pending() {
            Ok(Some(session)) => session,
            Ok(None) => return false,
            Err(e) => {
                tracing::error!(error = %e, "failed to accept connection");
                return false;
            }
        };

        let id = session.id();
        if let Err(e) = self.register_session(Arc::clone(&session)) {
            tracing::info!(session = %id, addr = %session.remote_addr(), error = %e, "connection rejected");
            session.kick(&e.kick_message());
            return true;
        }

        let registry = Arc::clone(self);
        let worker_session = Arc::clone(&session);
        let spawned = thread::Builder::new()
            .name(format!("handshake-{}", id.into_inner()))
            .spawn(move || registry.run_handshake(worker_session));
        if let Err(e) = spawned {
            tracing::error!(session = %id, error = %e, "failed to spawn handshake thread");
            self.disconnect(id);
            session.close();
        }
        true
    }

    fn run_handshake(&self, session: Arc<dyn Session>) {
        let id = session.id();
        let login = match self.handshake.perform(&session) {
            Ok(login) => login,
            Err(e) => {
                tracing::info!(session = %id, error = %e, "handshake failed");
                session.kick(&e.kick_message());
                self.disconnect(id);
                return;
            }
        };
        match self.register_player(Arc::clone(&session), login) {
            Ok(player) => self.handshake.on_registered(&player),
            Err(e) => {
                tracing::info!(session = %id, error = %e, "login rejected");
                session.kick(&e.kick_message());
                self.disconnect(id);
            }
        }
    }

    /// Adds an accepted session to the index.
    ///
    /// # Errors
    /// - [`SessionError::NotAccepting`] after [`stop_accepting`](Self::stop_accepting).
    /// - [`SessionError::CapacityExceeded`] when the remote address already
    ///   holds `max_connections_per_ip` sessions. Loopback is exempt.
    pub fn register_session(&self, session: Arc<dyn Session>) -> Result<(), SessionError> {
        if !self.is_accepting() {
            return Err(SessionError::NotAccepting);
        }
        // Dual-stack listeners report IPv4 peers as `::ffff:a.b.c.d`.
        let ip = session.remote_addr().ip().to_canonical();
        let limit = self.config.max_connections_per_ip;

        let mut index = self.index.lock();
        if !ip.is_loopback() {
            let open = index
                .sessions
                .values()
                .filter(|s| s.remote_addr().ip().to_canonical() == ip)
                .count();
            if open >= limit {
                return Err(SessionError::CapacityExceeded { ip, limit });
            }
        }
        tracing::debug!(session = %session.id(), addr = %session.remote_addr(), "session registered");
        index.sessions.insert(session.id(), session);
        Ok(())
    }

    /// Registers `session` as a player under `login.name`.
    ///
    /// If another session already holds the name (compared
    /// case-insensitively), that ghost is kicked with [`GHOST_KICK_REASON`]
    /// and this call blocks until it disconnects, or closes it by force
    /// once `disconnect_timeout` passes. The cap is checked only after the
    /// ghost is gone.
    ///
    /// # Errors
    /// - [`SessionError::NotAccepting`] after [`stop_accepting`](Self::stop_accepting).
    /// - [`SessionError::ServerFull`] when the cap is reached and
    ///   `login.reserved_slot` is false.
    pub fn register_player(
        &self,
        session: Arc<dyn Session>,
        login: Login,
    ) -> Result<Arc<Player>, SessionError> {
        let key = login.name.to_lowercase();
        loop {
            let ghost = {
                let mut index = self.index.lock();
                if !self.is_accepting() {
                    return Err(SessionError::NotAccepting);
                }
                match index.players.get(&key).cloned() {
                    Some(existing) if existing.session_id() == session.id() => {
                        return Ok(existing);
                    }
                    Some(existing) => existing,
                    None => {
                        let max = self.config.max_players;
                        if index.players.len() >= max && !login.reserved_slot {
                            return Err(SessionError::ServerFull { max });
                        }
                        let player = Arc::new(Player::new(
                            login.name.clone(),
                            Arc::clone(&session),
                            login.reserved_slot,
                            Instant::now(),
                        ));
                        index
                            .sessions
                            .entry(session.id())
                            .or_insert_with(|| Arc::clone(&session));
                        index.players.insert(key, Arc::clone(&player));
                        let count = self.publish(&index);
                        drop(index);

                        tracing::info!(player = %player.name(), session = %player.session_id(), count, "player registered");
                        self.notify(RegistryEvent::PlayerJoined {
                            name: player.name().to_string(),
                        });
                        self.notify(RegistryEvent::PlayerListChanged { count });
                        return Ok(player);
                    }
                }
            };
            self.evict(&ghost);
        }
    }

    fn evict(&self, ghost: &Arc<Player>) {
        tracing::info!(player = %ghost.name(), session = %ghost.session_id(), "evicting ghost session");
        let session = ghost.session();
        session.kick(GHOST_KICK_REASON);
        if !session.wait_for_disconnect(self.config.disconnect_timeout) {
            tracing::warn!(
                session = %ghost.session_id(),
                timeout = ?self.config.disconnect_timeout,
                "ghost session did not disconnect in time, closing"
            );
            session.close();
        }
        self.disconnect(ghost.session_id());
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    /// Removes a player and its session. Returns `false` if it was already
    /// gone (or replaced by a newer login).
    pub fn unregister_player(&self, player: &Player) -> bool {
        self.disconnect(player.session_id()).is_some()
    }

    /// Removes a session and the player registered on it, if any.
    pub fn disconnect(&self, id: SessionId) -> Option<Arc<Player>> {
        let mut index = self.index.lock();
        index.sessions.remove(&id);
        let removed = index.remove_player_for(id)?;
        let count = self.publish(&index);
        drop(index);

        tracing::info!(player = %removed.name(), session = %id, count, "player unregistered");
        self.notify(RegistryEvent::PlayerLeft {
            name: removed.name().to_string(),
        });
        self.notify(RegistryEvent::PlayerListChanged { count });
        Some(removed)
    }

    /// Drops every session whose connection has closed. Returns how many
    /// were removed.
    pub fn reap_disconnected(&self) -> usize {
        let mut index = self.index.lock();
        let dead: Vec<SessionId> = index
            .sessions
            .iter()
            .filter(|(_, s)| !s.is_online())
            .map(|(id, _)| *id)
            .collect();
        if dead.is_empty() {
            return 0;
        }
        let mut left = Vec::new();
        for id in &dead {
            index.sessions.remove(id);
            if let Some(player) = index.remove_player_for(*id) {
                left.push(player);
            }
        }
        let count = if left.is_empty() {
            index.players.len()
        } else {
            self.publish(&index)
        };
        drop(index);

        tracing::debug!(reaped = dead.len(), "reaped disconnected sessions");
        for player in &left {
            self.notify(RegistryEvent::PlayerLeft {
                name: player.name().to_string(),
            });
        }
        if !left.is_empty() {
            self.notify(RegistryEvent::PlayerListChanged { count });
        }
        dead.len()
    }

    /// Empties the registry. Returns the sessions that were registered.
    pub fn clear(&self) -> Vec<Arc<dyn Session>> {
        let mut index = self.index.lock();
        let had_players = !index.players.is_empty();
        let sessions = index.sessions.drain().map(|(_, s)| s).collect();
        index.players.clear();
        self.publish(&index);
        drop(index);

        if had_players {
            self.notify(RegistryEvent::PlayerListChanged { count: 0 });
        }
        sessions
    }

    // -----------------------------------------------------------------------
    // Accepting flag
    // -----------------------------------------------------------------------

    /// Stops taking new connections and tells the network backend to stop
    /// listening. Idempotent.
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            tracing::info!("no longer accepting connections");
        }
        self.network.stop_accepting();
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The current player list, sorted by name (case-insensitive).
    pub fn players(&self) -> Arc<Vec<Arc<Player>>> {
        self.roster.load_full()
    }

    /// Looks a player up by name, case-insensitively.
    pub fn find_player(&self, name: &str) -> Option<Arc<Player>> {
        self.roster.load().iter().find(|p| p.is_named(name)).cloned()
    }

    pub fn player_count(&self) -> usize {
        self.roster.load().len()
    }

    pub fn session_count(&self) -> usize {
        self.index.lock().sessions.len()
    }

    /// All registered sessions, including those still in the handshake.
    pub fn sessions(&self) -> Vec<Arc<dyn Session>> {
        self.index.lock().sessions.values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Rebuilds the sorted snapshot. Called with the index lock held.
    fn publish(&self, index: &Index) -> usize {
        let mut list: Vec<Arc<Player>> = index.players.values().cloned().collect();
        list.sort_by_cached_key(|p| p.name().to_lowercase());
        let count = list.len();
        self.roster.store(Arc::new(list));
        count
    }

    fn notify(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .field("players", &self.player_count())
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}
