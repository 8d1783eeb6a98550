//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via EASYCOM_CONFIG)
//! 3. Environment variables

use crate::server::ServerConfig;
use easycom_core::PeerConfig;
use easycom_protocol::FRAME_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File and environment configuration of the server binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and admission settings.
    pub network: NetworkConfig,
    /// Per-connection transport settings.
    pub transport: TransportConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("EASYCOM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.network.apply_overrides(&lookup);
        self.transport.apply_overrides(&lookup);
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }

    /// Checks that every setting is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.transport.tick_ms == 0 {
            return Err(ConfigError::Validation("tick_ms must be positive".to_string()));
        }
        if self.transport.request_timeout_ms == 0 || self.transport.connection_timeout_ms == 0 {
            return Err(ConfigError::Validation("timeouts must be positive".to_string()));
        }
        if self.transport.buffer_capacity < FRAME_HEADER_SIZE {
            return Err(ConfigError::Validation(format!(
                "buffer_capacity must hold at least a frame header ({} bytes)",
                FRAME_HEADER_SIZE
            )));
        }
        Ok(())
    }

    /// Builds the runtime server settings.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.network.bind_addr)
            .with_max_connections(self.network.max_connections)
            .with_seat_admission(self.network.seat_admission)
            .with_peer(self.transport.peer_config())
    }
}

/// Listener and admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Admit only peers holding a reserved seat.
    pub seat_admission: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7500)),
            max_connections: 1000,
            seat_admission: false,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("EASYCOM_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Some(max) = lookup("EASYCOM_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Some(seats) = lookup("EASYCOM_SEAT_ADMISSION") {
            self.seat_admission = seats == "1" || seats.to_lowercase() == "true";
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connection_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Driver tick period.
    pub tick_ms: u64,
    /// Receive buffer size; bounds the frame length.
    pub buffer_capacity: usize,
    pub fail_on_send_while_disconnected: bool,
    pub fail_on_request_while_disconnected: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let peer = PeerConfig::default();
        Self {
            connection_timeout_ms: peer.connection_timeout.as_millis() as u64,
            request_timeout_ms: peer.request_timeout.as_millis() as u64,
            tick_ms: peer.tick_interval.as_millis() as u64,
            buffer_capacity: peer.buffer_capacity,
            fail_on_send_while_disconnected: peer.fail_on_send_while_disconnected,
            fail_on_request_while_disconnected: peer.fail_on_request_while_disconnected,
        }
    }
}

impl TransportConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(ms) = lookup("EASYCOM_CONNECTION_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.connection_timeout_ms = ms;
            }
        }

        if let Some(ms) = lookup("EASYCOM_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.request_timeout_ms = ms;
            }
        }

        if let Some(ms) = lookup("EASYCOM_TICK_MS") {
            if let Ok(ms) = ms.parse() {
                self.tick_ms = ms;
            }
        }

        if let Some(size) = lookup("EASYCOM_BUFFER_CAPACITY") {
            if let Ok(size) = size.parse() {
                self.buffer_capacity = size;
            }
        }
    }

    /// Converts to the per-connection settings.
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig::new()
            .with_connection_timeout(Duration::from_millis(self.connection_timeout_ms))
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_tick_interval(Duration::from_millis(self.tick_ms))
            .with_buffer_capacity(self.buffer_capacity)
            .with_fail_on_send_while_disconnected(self.fail_on_send_while_disconnected)
            .with_fail_on_request_while_disconnected(self.fail_on_request_while_disconnected)
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 7500);
        assert_eq!(config.network.max_connections, 1000);
        assert!(!config.network.seat_admission);
        assert_eq!(config.transport.request_timeout_ms, 10_000);
        assert_eq!(config.transport.connection_timeout_ms, 5_000);
        assert_eq!(config.transport.tick_ms, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.transport.buffer_capacity, config.transport.buffer_capacity);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:9000\"\n  seat_admission: true\ntransport:\n  tick_ms: 20"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9000);
        assert!(config.network.seat_admission);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.transport.tick_ms, 20);
        assert_eq!(config.transport.request_timeout_ms, 10_000);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(Config::from_file(&missing), Err(ConfigError::Io(..))));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "network: [unclosed").unwrap();
        let err = Config::from_file(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(..)));
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("easycom.yaml");

        let mut config = Config::default();
        config.network.max_connections = 12;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.network.max_connections, 12);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("EASYCOM_BIND", "127.0.0.1:6000"),
            ("EASYCOM_MAX_CONNECTIONS", "8"),
            ("EASYCOM_SEAT_ADMISSION", "TRUE"),
            ("EASYCOM_REQUEST_TIMEOUT_MS", "250"),
            ("EASYCOM_TICK_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.network.bind_addr.port(), 6000);
        assert_eq!(config.network.max_connections, 8);
        assert!(config.network.seat_admission);
        assert_eq!(config.transport.request_timeout_ms, 250);
        assert_eq!(config.transport.tick_ms, 50);
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = Config::default();
        config.network.max_connections = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::default();
        config.transport.tick_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.buffer_capacity = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config_conversion() {
        let mut config = Config::default();
        config.network.seat_admission = true;
        config.transport.request_timeout_ms = 1500;

        let server = config.server_config();
        assert!(server.use_seat_admission);
        assert_eq!(server.peer.request_timeout, Duration::from_millis(1500));
        assert_eq!(server.bind_addr, config.network.bind_addr);
    }
}
