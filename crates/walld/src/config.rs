//! Daemon configuration.
//!
//! Built once at start-up from compiled defaults, an optional TOML file and
//! `WALL_*` environment overrides, in that order. Never reloaded.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default broker socket path
pub const DEFAULT_BROKER_SOCKET: &str = "/tmp/walld-broker.sock";

/// Default relay channel for photo records
pub const DEFAULT_CHANNEL: &str = "photo_channel";

/// Which relay implementation the daemon talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    /// In-process broker; single-process deployments and tests
    Memory,
    /// Standalone broker over a Unix socket (`walld broker`)
    Socket,
}

impl std::str::FromStr for RelayKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "socket" => Ok(Self::Socket),
            other => Err(ConfigError::Invalid {
                field: "relay.kind",
                reason: format!("unknown relay '{other}' (expected memory or socket)"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub kind: RelayKind,
    pub channel: String,
    pub broker_socket: PathBuf,
    /// First listener restart delay, milliseconds
    pub restart_initial_ms: u64,
    /// Listener restart delay cap, milliseconds
    pub restart_max_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            kind: RelayKind::Memory,
            channel: DEFAULT_CHANNEL.to_string(),
            broker_socket: PathBuf::from(DEFAULT_BROKER_SOCKET),
            restart_initial_ms: 100,
            restart_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeepaliveConfig {
    /// A connection silent for longer than this is pruned
    pub liveness_window_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        // Viewers ping every 10s; three missed pings is dead.
        Self {
            liveness_window_secs: 30,
            sweep_interval_secs: 5,
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WallConfig {
    pub listen: SocketAddr,

    /// Ingestion queue capacity (C)
    pub queue_capacity: usize,

    /// Worker count (N)
    pub workers: usize,

    /// Concurrent publish permits (M)
    pub permits: usize,

    /// Connection pool count (P)
    pub pools: usize,

    /// Connections per delivery task (K)
    pub chunk_size: usize,

    /// Upper bound on a single viewer send, milliseconds
    pub send_timeout_ms: u64,

    /// Pause before chunk dispatch, milliseconds (0 disables)
    pub dispatch_delay_ms: u64,

    pub max_upload_bytes: usize,

    /// Grace period for tasks on shutdown, milliseconds
    pub shutdown_grace_ms: u64,

    pub relay: RelayConfig,
    pub keepalive: KeepaliveConfig,
}

impl Default for WallConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            queue_capacity: 100_000,
            workers: 20,
            permits: 10,
            pools: 4,
            chunk_size: 25,
            send_timeout_ms: 5_000,
            dispatch_delay_ms: 0,
            max_upload_bytes: 100 * 1024 * 1024,
            shutdown_grace_ms: 5_000,
            relay: RelayConfig::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl WallConfig {
    /// Loads defaults, then `path` if given, then environment overrides,
    /// and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Applies `WALL_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WALL_LISTEN") {
            self.listen = parse_env("WALL_LISTEN", &v)?;
        }
        if let Some(v) = lookup("WALL_QUEUE_CAPACITY") {
            self.queue_capacity = parse_env("WALL_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("WALL_WORKERS") {
            self.workers = parse_env("WALL_WORKERS", &v)?;
        }
        if let Some(v) = lookup("WALL_PERMITS") {
            self.permits = parse_env("WALL_PERMITS", &v)?;
        }
        if let Some(v) = lookup("WALL_POOLS") {
            self.pools = parse_env("WALL_POOLS", &v)?;
        }
        if let Some(v) = lookup("WALL_CHUNK_SIZE") {
            self.chunk_size = parse_env("WALL_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = lookup("WALL_RELAY") {
            self.relay.kind = v.parse()?;
        }
        if let Some(v) = lookup("WALL_BROKER_SOCKET") {
            self.relay.broker_socket = PathBuf::from(v);
        }
        Ok(())
    }

    /// Rejects zero-valued sizing parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("queue_capacity", self.queue_capacity),
            ("workers", self.workers),
            ("permits", self.permits),
            ("pools", self.pools),
            ("chunk_size", self.chunk_size),
            ("max_upload_bytes", self.max_upload_bytes),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be a positive integer".to_string(),
                });
            }
        }

        if self.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "send_timeout_ms",
                reason: "sends must be bounded by a non-zero timeout".to_string(),
            });
        }
        if self.keepalive.liveness_window_secs == 0 || self.keepalive.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "keepalive",
                reason: "liveness window and sweep interval must be positive".to_string(),
            });
        }
        if self.relay.channel.is_empty() {
            return Err(ConfigError::Invalid {
                field: "relay.channel",
                reason: "channel name cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn dispatch_delay(&self) -> Option<Duration> {
        (self.dispatch_delay_ms > 0).then(|| Duration::from_millis(self.dispatch_delay_ms))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.keepalive.liveness_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive.sweep_interval_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key,
        value: value.to_string(),
    })
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Invalid environment override {key}={value}")]
    Env { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = WallConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_capacity, 100_000);
        assert_eq!(config.workers, 20);
        assert_eq!(config.permits, 10);
        assert_eq!(config.pools, 4);
        assert_eq!(config.chunk_size, 25);
        assert_eq!(config.relay.channel, "photo_channel");
        assert!(config.dispatch_delay().is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WallConfig::from_toml(
            r#"
            workers = 4
            chunk_size = 50

            [relay]
            kind = "socket"
            "#,
        )
        .unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.chunk_size, 50);
        assert_eq!(config.relay.kind, RelayKind::Socket);
        assert_eq!(config.pools, 4);
        assert_eq!(config.relay.channel, DEFAULT_CHANNEL);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = WallConfig::from_toml("worker_count = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("WALL_QUEUE_CAPACITY", "3"),
            ("WALL_POOLS", "2"),
            ("WALL_RELAY", "socket"),
            ("WALL_LISTEN", "127.0.0.1:9000"),
        ]
        .into_iter()
        .collect();

        let mut config = WallConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.pools, 2);
        assert_eq!(config.relay.kind, RelayKind::Socket);
        assert_eq!(config.listen.port(), 9000);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = WallConfig::default();
        let err = config
            .apply_env(|k| (k == "WALL_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("WALL_WORKERS"));
    }

    #[test]
    fn test_zero_values_rejected() {
        for mutate in [
            (|c: &mut WallConfig| c.queue_capacity = 0) as fn(&mut WallConfig),
            |c| c.workers = 0,
            |c| c.permits = 0,
            |c| c.pools = 0,
            |c| c.chunk_size = 0,
            |c| c.send_timeout_ms = 0,
            |c| c.keepalive.liveness_window_secs = 0,
        ] {
            let mut config = WallConfig::default();
            mutate(&mut config);
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wall.toml");
        std::fs::write(&path, "permits = 2\n").unwrap();

        let config = WallConfig::from_file(&path).unwrap();
        assert_eq!(config.permits, 2);

        let missing = WallConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
