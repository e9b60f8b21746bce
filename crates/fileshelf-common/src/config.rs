//! Configuration types for fileshelf
//!
//! This module defines configuration structures used across components.
//! Every section has a `Default` so a node can start with an empty file.

use crate::types::NodeMode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a fileshelf node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Local storage configuration
    pub storage: StorageConfig,
    /// Message bus configuration
    pub bus: BusConfig,
    /// Snapshot sync configuration
    pub sync: SyncConfig,
    /// Write coordinator configuration
    pub writer: WriterConfig,
    /// HTTP adapter configuration
    pub http: HttpConfig,
}

/// Node identity and role configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier used in logs)
    pub name: String,
    /// Role on the shared bus
    pub mode: NodeMode,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "fileshelf-node".to_string(),
            mode: NodeMode::NoSync,
        }
    }
}

/// Local disk + database configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding blob files, created on startup if missing
    pub storage_path: PathBuf,
    /// SQLite database file for the metadata index
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./fileshelf/blobs"),
            database_path: PathBuf::from("./fileshelf/index.db"),
        }
    }
}

/// Which bus implementation a node talks to
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BusBackend {
    /// In-process bus, only reaches nodes inside the same process
    #[default]
    Loopback,
    /// NATS server (requires the `nats` feature)
    Nats { url: String },
}

/// Message bus configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Exchange carrying write commands
    pub exchange: String,
    /// Bus implementation
    pub backend: BusBackend,
    /// Connection attempts at startup before giving up
    pub connect_attempts: u32,
    /// Initial backoff between attempts (milliseconds), doubled each retry
    pub connect_backoff_ms: u64,
}

impl BusConfig {
    /// Exchange used by the snapshot sync protocol
    #[must_use]
    pub fn sync_exchange(&self) -> String {
        format!("{}_dataDump", self.exchange)
    }

    #[must_use]
    pub const fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            exchange: "fileshelf".to_string(),
            backend: BusBackend::Loopback,
            connect_attempts: 5,
            connect_backoff_ms: 500,
        }
    }
}

/// Snapshot server / client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interface the snapshot server binds to
    pub listen_host: String,
    /// Host announced to bootstrapping replicas (defaults to `listen_host`)
    pub advertise_host: Option<String>,
    /// Lowest port to try (0 = let the OS pick)
    pub min_port: u16,
    /// Highest port to try
    pub max_port: u16,
    /// How long a replica waits for a snapshot offer and transfer (milliseconds)
    pub request_timeout_ms: u64,
}

impl SyncConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Host a replica should connect to
    #[must_use]
    pub fn advertised_host(&self) -> &str {
        self.advertise_host.as_deref().unwrap_or(&self.listen_host)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            advertise_host: None,
            min_port: 0,
            max_port: 0,
            request_timeout_ms: 30_000,
        }
    }
}

/// Write coordinator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// How long `commit` waits for its completion event (milliseconds)
    pub commit_timeout_ms: u64,
    /// Carry blob bytes inside save commands so every node stores them
    pub replicate_blobs: bool,
}

impl WriterConfig {
    #[must_use]
    pub const fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            commit_timeout_ms: 30_000,
            replicate_blobs: false,
        }
    }
}

/// HTTP download adapter configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// URL prefix files are served under
    pub prefix: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            prefix: "/dbfiles/".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.mode, NodeMode::NoSync);
        assert_eq!(config.bus.exchange, "fileshelf");
        assert_eq!(config.bus.sync_exchange(), "fileshelf_dataDump");
        assert_eq!(config.writer.commit_timeout(), Duration::from_secs(30));
        assert!(!config.writer.replicate_blobs);
        assert_eq!(config.http.listen.port(), 8080);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"node": {"mode": "primary"}, "bus": {"backend": {"kind": "nats", "url": "nats://localhost:4222"}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.node.mode, NodeMode::Primary);
        assert_eq!(config.node.name, "fileshelf-node");
        assert_eq!(
            config.bus.backend,
            BusBackend::Nats {
                url: "nats://localhost:4222".into()
            }
        );
        assert_eq!(config.bus.connect_attempts, 5);
    }

    #[test]
    fn test_advertised_host_falls_back_to_listen_host() {
        let mut sync = SyncConfig::default();
        assert_eq!(sync.advertised_host(), "127.0.0.1");
        sync.advertise_host = Some("10.0.0.5".into());
        assert_eq!(sync.advertised_host(), "10.0.0.5");
    }
}
