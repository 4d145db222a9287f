//! `Server` builder and context object.
//!
//! A [`Server`] owns one scheduler, one session registry, the collaborators
//! it was built with and the shutdown coordinator. Nothing is global, so
//! several servers can live in one process (tests do this).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use blockforge_scheduler::{Clock, SystemClock, TaskScheduler};
use blockforge_session::{Handshake, NetworkBackend, RegistryEvent, SessionRegistry};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cpu::CpuMonitor;
use crate::events::EVENT_CAPACITY;
use crate::shutdown::ShutdownTargets;
use crate::{
    Integration, NullPersistence, OsProcess, PersistenceBackend, ProcessControl, ServerConfig,
    ServerError, ServerEvent, ShutdownCoordinator, ShutdownOutcome, ShutdownParams, ShutdownPhase,
    maintenance, persistence,
};

/// Shared server state. Maintenance tasks hold it weakly.
pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) scheduler: Arc<TaskScheduler>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) persistence: Arc<dyn PersistenceBackend>,
    pub(crate) coordinator: Arc<ShutdownCoordinator>,
    pub(crate) events: broadcast::Sender<ServerEvent>,
    pub(crate) cpu: CpuMonitor,
    pub(crate) compaction_requested: AtomicBool,
    started: AtomicBool,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a [`Server`].
///
/// # Example
///
/// ```rust,ignore
/// let network = Arc::new(TcpNetwork::bind(&config.listen_addr)?);
/// let handshake = Arc::new(LineHandshake::new(&network));
/// let server = Server::builder()
///     .config(config)
///     .network(network)
///     .handshake(handshake)
///     .build()?;
/// server.start()?;
/// server.wait_until_stopped(None);
/// ```
pub struct ServerBuilder {
    config: ServerConfig,
    network: Option<Arc<dyn NetworkBackend>>,
    handshake: Option<Arc<dyn Handshake>>,
    persistence: Arc<dyn PersistenceBackend>,
    integrations: Vec<Arc<dyn Integration>>,
    process: Option<Arc<dyn ProcessControl>>,
    clock: Arc<dyn Clock>,
}

impl ServerBuilder {
    /// A builder with default config, no storage and the real process.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            network: None,
            handshake: None,
            persistence: Arc::new(NullPersistence),
            integrations: Vec::new(),
            process: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Where connections come from. Required.
    pub fn network(mut self, network: Arc<dyn NetworkBackend>) -> Self {
        self.network = Some(network);
        self
    }

    /// How connections log in. Required.
    pub fn handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn PersistenceBackend>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Adds an integration to disconnect on shutdown.
    pub fn integration(mut self, integration: Arc<dyn Integration>) -> Self {
        self.integrations.push(integration);
        self
    }

    /// Overrides relaunch/exit handling. Defaults to [`OsProcess::current`].
    pub fn process(mut self, process: Arc<dyn ProcessControl>) -> Self {
        self.process = Some(process);
        self
    }

    /// Overrides the scheduler's clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Assembles the server. Nothing runs until [`Server::start`].
    ///
    /// # Errors
    /// [`ServerError::MissingCollaborator`] without a network or handshake.
    pub fn build(self) -> Result<Server, ServerError> {
        let network = self
            .network
            .ok_or(ServerError::MissingCollaborator("network"))?;
        let handshake = self
            .handshake
            .ok_or(ServerError::MissingCollaborator("handshake"))?;
        let process = self
            .process
            .unwrap_or_else(|| Arc::new(OsProcess::current()));

        let config = self.config.validated();
        let scheduler = Arc::new(TaskScheduler::with_clock(config.scheduler_config(), self.clock));
        let registry = SessionRegistry::new(config.session_config(), network, handshake);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let coordinator = ShutdownCoordinator::new(ShutdownTargets {
            scheduler: Arc::clone(&scheduler),
            registry: Arc::clone(&registry),
            persistence: Arc::clone(&self.persistence),
            integrations: self.integrations,
            process,
            events: events.clone(),
            disconnect_timeout: config.disconnect_timeout(),
        });

        Ok(Server {
            inner: Arc::new(ServerInner {
                config,
                scheduler,
                registry,
                persistence: self.persistence,
                coordinator,
                events,
                cpu: CpuMonitor::new(),
                compaction_requested: AtomicBool::new(false),
                started: AtomicBool::new(false),
            }),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A game server instance.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Loads stores, starts the scheduler workers and installs the
    /// maintenance tasks.
    ///
    /// Store load failures are logged and do not prevent startup.
    ///
    /// # Errors
    /// - [`ServerError::AlreadyStarted`] on a second call.
    /// - [`ServerError::Scheduler`] if the workers can't be spawned.
    /// - [`ServerError::Spawn`] if the event forwarder can't be spawned.
    pub fn start(&self) -> Result<(), ServerError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyStarted);
        }
        let inner = &self.inner;

        let failures = persistence::load_all(inner.persistence.as_ref());
        if failures > 0 {
            warn!(failures, "some stores failed to load");
        }

        self.spawn_event_forwarder()?;
        inner.scheduler.start()?;
        let tasks = maintenance::install(inner)?;

        info!(
            max_players = inner.config.max_players,
            tasks = tasks.len(),
            "server started"
        );
        Ok(())
    }

    /// Re-publishes player list changes from the registry as
    /// [`ServerEvent::PlayerListChanged`]. Exits when the registry is dropped.
    fn spawn_event_forwarder(&self) -> Result<(), ServerError> {
        let mut registry_events = self.inner.registry.subscribe();
        let events = self.inner.events.clone();
        thread::Builder::new()
            .name("blockforge-events".into())
            .spawn(move || {
                loop {
                    match registry_events.blocking_recv() {
                        Ok(RegistryEvent::PlayerListChanged { count }) => {
                            let _ = events.send(ServerEvent::PlayerListChanged { count });
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "player list notifications lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
            .map(drop)
            .map_err(ServerError::Spawn)
    }

    /// Requests a shutdown; see [`ShutdownCoordinator::shutdown`].
    pub fn shutdown(&self, params: ShutdownParams, wait_for_completion: bool) -> ShutdownOutcome {
        self.inner.coordinator.shutdown(params, wait_for_completion)
    }

    /// Cancels a shutdown still waiting out its delay.
    pub fn cancel_shutdown(&self) -> bool {
        self.inner.coordinator.cancel_shutdown()
    }

    pub fn shutdown_phase(&self) -> ShutdownPhase {
        self.inner.coordinator.phase()
    }

    /// Blocks until a shutdown has completed. `None` waits forever.
    pub fn wait_until_stopped(&self, timeout: Option<Duration>) -> bool {
        self.inner.coordinator.wait_for_completion(timeout)
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Asks the background worker to compact storage on its next pass.
    pub fn request_compaction(&self) {
        self.inner.compaction_requested.store(true, Ordering::Release);
    }

    /// Latest process CPU utilisation in percent of one core, once the
    /// monitor has taken two samples.
    pub fn cpu_usage(&self) -> Option<f64> {
        self.inner.cpu.usage()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.inner.scheduler
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("players", &self.inner.registry.player_count())
            .field("tasks", &self.inner.scheduler.task_count())
            .field("phase", &self.shutdown_phase())
            .finish_non_exhaustive()
    }
}
