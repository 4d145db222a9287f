//! Server configuration.
//!
//! [`ServerConfig`] mirrors the tunables of a running server as plain
//! scalars so it can be read from a JSON file. Every field has a default;
//! a config file only needs the fields it changes:
//!
//! ```json
//! { "max_players": 64, "max_idle_secs": 600 }
//! ```

use std::path::Path;
use std::time::Duration;

use blockforge_scheduler::SchedulerConfig;
use blockforge_session::SessionConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Errors from loading a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for [`ServerConfig`].
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables for one server instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the network backend listens on. Used by binaries; the core
    /// never binds anything itself.
    pub listen_addr: String,
    pub max_players: usize,
    pub max_connections_per_ip: usize,
    pub accept_poll_interval_ms: u64,
    pub reap_interval_ms: u64,
    pub idle_check_interval_secs: u64,
    /// Kick players idle for longer than this. `None` disables the check.
    pub max_idle_secs: Option<u64>,
    pub cpu_monitor_interval_secs: u64,
    pub compaction_interval_secs: u64,
    pub save_interval_secs: u64,
    /// Restart the server after this long. `None` disables it.
    pub restart_after_secs: Option<u64>,
    pub disconnect_timeout_ms: u64,
    pub worker_join_timeout_ms: u64,
    pub scheduler_quantum_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:25565".to_string(),
            max_players: 32,
            max_connections_per_ip: 5,
            accept_poll_interval_ms: 250,
            reap_interval_ms: 1000,
            idle_check_interval_secs: 30,
            max_idle_secs: None,
            cpu_monitor_interval_secs: 30,
            compaction_interval_secs: 60,
            save_interval_secs: 90,
            restart_after_secs: None,
            disconnect_timeout_ms: 5000,
            worker_join_timeout_ms: 5000,
            scheduler_quantum_ms: 10,
        }
    }
}

impl ServerConfig {
    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str::<Self>(json)?.validated())
    }

    /// Reads and parses a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Replaces zero periods with their defaults.
    ///
    /// A recurring task can't run every 0 ms, and a zero cap would lock
    /// everyone out.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        let fields: [(&str, &mut u64, u64); 9] = [
            ("accept_poll_interval_ms", &mut self.accept_poll_interval_ms, defaults.accept_poll_interval_ms),
            ("reap_interval_ms", &mut self.reap_interval_ms, defaults.reap_interval_ms),
            ("idle_check_interval_secs", &mut self.idle_check_interval_secs, defaults.idle_check_interval_secs),
            ("cpu_monitor_interval_secs", &mut self.cpu_monitor_interval_secs, defaults.cpu_monitor_interval_secs),
            ("compaction_interval_secs", &mut self.compaction_interval_secs, defaults.compaction_interval_secs),
            ("save_interval_secs", &mut self.save_interval_secs, defaults.save_interval_secs),
            ("disconnect_timeout_ms", &mut self.disconnect_timeout_ms, defaults.disconnect_timeout_ms),
            ("worker_join_timeout_ms", &mut self.worker_join_timeout_ms, defaults.worker_join_timeout_ms),
            ("scheduler_quantum_ms", &mut self.scheduler_quantum_ms, defaults.scheduler_quantum_ms),
        ];
        for (name, value, default) in fields {
            if *value == 0 {
                warn!(field = name, default, "zero is not allowed, using default");
                *value = default;
            }
        }
        if self.max_players == 0 {
            warn!(default = defaults.max_players, "max_players is zero, using default");
            self.max_players = defaults.max_players;
        }
        if self.max_connections_per_ip == 0 {
            warn!(default = defaults.max_connections_per_ip, "max_connections_per_ip is zero, using default");
            self.max_connections_per_ip = defaults.max_connections_per_ip;
        }
        if self.max_idle_secs == Some(0) {
            self.max_idle_secs = None;
        }
        if self.restart_after_secs == Some(0) {
            self.restart_after_secs = None;
        }
        self
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            quantum: Duration::from_millis(self.scheduler_quantum_ms),
            join_timeout: Duration::from_millis(self.worker_join_timeout_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_players: self.max_players,
            max_connections_per_ip: self.max_connections_per_ip,
            disconnect_timeout: self.disconnect_timeout(),
        }
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }

    pub fn max_idle(&self) -> Option<Duration> {
        self.max_idle_secs.map(Duration::from_secs)
    }

    pub fn cpu_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.cpu_monitor_interval_secs)
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn restart_after(&self) -> Option<Duration> {
        self.restart_after_secs.map(Duration::from_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_players, 32);
        assert_eq!(cfg.max_connections_per_ip, 5);
        assert_eq!(cfg.accept_poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.reap_interval(), Duration::from_secs(1));
        assert_eq!(cfg.idle_check_interval(), Duration::from_secs(30));
        assert_eq!(cfg.max_idle(), None);
        assert_eq!(cfg.cpu_monitor_interval(), Duration::from_secs(30));
        assert_eq!(cfg.compaction_interval(), Duration::from_secs(60));
        assert_eq!(cfg.save_interval(), Duration::from_secs(90));
        assert_eq!(cfg.restart_after(), None);
        assert_eq!(cfg.disconnect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_json_partial_document_fills_defaults() {
        let cfg = ServerConfig::from_json(r#"{ "max_players": 64, "max_idle_secs": 600 }"#).unwrap();
        assert_eq!(cfg.max_players, 64);
        assert_eq!(cfg.max_idle(), Some(Duration::from_secs(600)));
        assert_eq!(cfg.save_interval_secs, 90);
    }

    #[test]
    fn test_from_json_empty_object_is_default() {
        assert_eq!(ServerConfig::from_json("{}").unwrap(), ServerConfig::default());
    }

    #[test]
    fn test_from_json_wrong_type_returns_parse_error() {
        let err = ServerConfig::from_json(r#"{ "max_players": "lots" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file_returns_io_error() {
        let err = ServerConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_validated_zero_intervals_use_defaults() {
        let cfg = ServerConfig {
            reap_interval_ms: 0,
            scheduler_quantum_ms: 0,
            max_players: 0,
            ..ServerConfig::default()
        }
        .validated();
        assert_eq!(cfg.reap_interval_ms, 1000);
        assert_eq!(cfg.scheduler_quantum_ms, 10);
        assert_eq!(cfg.max_players, 32);
    }

    #[test]
    fn test_validated_zero_optional_periods_disable() {
        let cfg = ServerConfig {
            max_idle_secs: Some(0),
            restart_after_secs: Some(0),
            ..ServerConfig::default()
        }
        .validated();
        assert_eq!(cfg.max_idle(), None);
        assert_eq!(cfg.restart_after(), None);
    }

    #[test]
    fn test_session_and_scheduler_configs_follow_fields() {
        let cfg = ServerConfig {
            max_players: 8,
            disconnect_timeout_ms: 250,
            scheduler_quantum_ms: 20,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.session_config().max_players, 8);
        assert_eq!(cfg.session_config().disconnect_timeout, Duration::from_millis(250));
        assert_eq!(cfg.scheduler_config().quantum, Duration::from_millis(20));
    }
}
