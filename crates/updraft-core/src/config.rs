//! Configuration types for the agent and the rendezvous server.
//!
//! Config files are JSON; every field has a default so an empty object is
//! a valid configuration. Durations are written in human-readable form
//! (`"60s"`, `"5m"`). Binaries layer CLI flags on top of the file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("config file {path}: {source}")]
    Io {
        /// Path of the config file.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The config file did not parse as JSON.
    #[error("config file {path}: {source}")]
    Parse {
        /// Path of the config file.
        path: String,
        /// Underlying error.
        source: serde_json::Error,
    },
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Overlay connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Local UDP address to bind; port 0 picks an ephemeral port.
    #[serde(default = "default_overlay_address")]
    pub address: String,

    /// Fixed peer id (12 hex chars). When unset, the id is derived from
    /// a stable hardware attribute. Needed when several agents share a
    /// host.
    #[serde(default, rename = "peer-id", skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,

    /// Rendezvous server address (`host:port`).
    #[serde(default = "default_server_address")]
    pub server: String,

    /// Shared rendezvous password keying message integrity.
    #[serde(default = "default_password")]
    pub password: String,

    /// How long a binding request may wait for its success response.
    #[serde(default = "default_binding_deadline")]
    #[serde(with = "humantime_serde", rename = "binding-deadline")]
    pub binding_deadline: Duration,

    /// Binding failures tolerated before backing off and reopening.
    #[serde(default = "default_binding_max_errors", rename = "binding-max-errors")]
    pub binding_max_errors: u32,

    /// Message failures tolerated in the listening loop before rebinding.
    #[serde(default = "default_listening_max_errors", rename = "listening-max-errors")]
    pub listening_max_errors: u32,

    /// Capacity of the inbound peer-message queue.
    #[serde(default = "default_inbound_queue", rename = "inbound-queue")]
    pub inbound_queue: usize,

    /// Sleep applied when an error budget is exhausted.
    #[serde(default = "default_error_backoff")]
    #[serde(with = "humantime_serde", rename = "error-backoff")]
    pub error_backoff: Duration,

    /// Lifetime of a NAT channel; also the keep-alive cadence.
    #[serde(default = "default_channel_lifespan")]
    #[serde(with = "humantime_serde", rename = "channel-lifespan")]
    pub channel_lifespan: Duration,

    /// Externally reachable swarm port advertised to the rendezvous
    /// server.
    #[serde(default = "default_swarm_port", rename = "swarm-external-port")]
    pub swarm_external_port: u16,

    /// Internally bound swarm port advertised to the rendezvous server.
    #[serde(default = "default_swarm_port", rename = "swarm-internal-port")]
    pub swarm_internal_port: u16,
}

fn default_overlay_address() -> String {
    "0.0.0.0:0".to_string()
}

fn default_server_address() -> String {
    "127.0.0.1:3478".to_string()
}

fn default_password() -> String {
    "updraft".to_string()
}

const fn default_binding_deadline() -> Duration {
    Duration::from_secs(10)
}

const fn default_binding_max_errors() -> u32 {
    5
}

const fn default_listening_max_errors() -> u32 {
    10
}

const fn default_inbound_queue() -> usize {
    16
}

const fn default_error_backoff() -> Duration {
    Duration::from_secs(10)
}

const fn default_channel_lifespan() -> Duration {
    Duration::from_secs(60)
}

const fn default_swarm_port() -> u16 {
    6881
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            address: default_overlay_address(),
            peer_id: None,
            server: default_server_address(),
            password: default_password(),
            binding_deadline: default_binding_deadline(),
            binding_max_errors: default_binding_max_errors(),
            listening_max_errors: default_listening_max_errors(),
            inbound_queue: default_inbound_queue(),
            error_backoff: default_error_backoff(),
            channel_lifespan: default_channel_lifespan(),
            swarm_external_port: default_swarm_port(),
            swarm_internal_port: default_swarm_port(),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Overlay connection parameters.
    #[serde(default)]
    pub overlay: OverlayConfig,

    /// Path of the hex-encoded verifying key for notifications.
    #[serde(default = "default_public_key_file", rename = "public-key-file")]
    pub public_key_file: PathBuf,

    /// Data root. Payloads live in `update/`, notification metadata in
    /// `notification/`.
    #[serde(default = "default_data_dir", rename = "data-dir")]
    pub data_dir: PathBuf,

    /// Local administration API.
    #[serde(default)]
    pub api: ApiConfig,

    /// How long the overlay may stay out of its serving state before the
    /// agent falls back to pulling the rendezvous catalog over TCP.
    #[serde(default = "default_pull_after")]
    #[serde(with = "humantime_serde", rename = "pull-after")]
    pub pull_after: Duration,
}

fn default_public_key_file() -> PathBuf {
    PathBuf::from("updraft.key.pub")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("updraft-data")
}

const fn default_pull_after() -> Duration {
    Duration::from_secs(300)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            overlay: OverlayConfig::default(),
            public_key_file: default_public_key_file(),
            data_dir: default_data_dir(),
            api: ApiConfig::default(),
            pull_after: default_pull_after(),
        }
    }
}

impl AgentConfig {
    /// Loads agent configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the file is unreadable or
    /// malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        load_json(path)
    }

    /// Directory holding payload files.
    pub fn update_dir(&self) -> PathBuf {
        self.data_dir.join("update")
    }

    /// Directory holding persisted notification metadata.
    pub fn notification_dir(&self) -> PathBuf {
        self.data_dir.join("notification")
    }
}

/// Local administration API parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Unix socket path the agent API listens on.
    #[serde(default = "default_api_socket")]
    pub socket: PathBuf,
}

fn default_api_socket() -> PathBuf {
    PathBuf::from("updraft.sock")
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            socket: default_api_socket(),
        }
    }
}

/// Rendezvous server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address for both the UDP listener and the TCP catalog.
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// Shared rendezvous password keying message integrity.
    #[serde(default = "default_password")]
    pub password: String,

    /// Cadence of full session-table advertisements.
    #[serde(default = "default_advertise_interval")]
    #[serde(with = "humantime_serde", rename = "advertise-interval")]
    pub advertise_interval: Duration,

    /// Cadence of notification snapshot checks.
    #[serde(default = "default_snapshot_interval")]
    #[serde(with = "humantime_serde", rename = "snapshot-interval")]
    pub snapshot_interval: Duration,

    /// Path of the notifications snapshot file.
    #[serde(default = "default_snapshot_file", rename = "snapshot-file")]
    pub snapshot_file: PathBuf,

    /// Path of the hex-encoded verifying key for notifications.
    #[serde(default = "default_public_key_file", rename = "public-key-file")]
    pub public_key_file: PathBuf,

    /// Size of the datagram worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the datagram dispatch queue feeding the workers.
    #[serde(default = "default_dispatch_queue", rename = "dispatch-queue")]
    pub dispatch_queue: usize,
}

fn default_listen_address() -> String {
    "0.0.0.0:3478".to_string()
}

const fn default_advertise_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_snapshot_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_snapshot_file() -> PathBuf {
    PathBuf::from("updraft-server.json")
}

const fn default_workers() -> usize {
    3
}

const fn default_dispatch_queue() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            password: default_password(),
            advertise_interval: default_advertise_interval(),
            snapshot_interval: default_snapshot_interval(),
            snapshot_file: default_snapshot_file(),
            public_key_file: default_public_key_file(),
            workers: default_workers(),
            dispatch_queue: default_dispatch_queue(),
        }
    }
}

impl ServerConfig {
    /// Loads server configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the file is unreadable or
    /// malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        load_json(path)
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.overlay.channel_lifespan, Duration::from_secs(60));
        assert_eq!(cfg.overlay.binding_max_errors, 5);
        assert_eq!(cfg.overlay.listening_max_errors, 10);
        assert_eq!(cfg.api.socket, PathBuf::from("updraft.sock"));

        let cfg: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.advertise_interval, Duration::from_secs(60));
        assert_eq!(cfg.workers, 3);
    }

    #[test]
    fn durations_parse_human_readable() {
        let cfg: ServerConfig =
            serde_json::from_str(r#"{"advertise-interval": "2m", "snapshot-interval": "1s"}"#)
                .unwrap();
        assert_eq!(cfg.advertise_interval, Duration::from_secs(120));
        assert_eq!(cfg.snapshot_interval, Duration::from_secs(1));
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = AgentConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.overlay.server, cfg.overlay.server);
        assert_eq!(back.pull_after, cfg.pull_after);
    }

    #[test]
    fn file_loading_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            AgentConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            AgentConfig::from_file(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn data_dirs_derive_from_root() {
        let cfg = AgentConfig {
            data_dir: PathBuf::from("/var/lib/updraft"),
            ..Default::default()
        };
        assert_eq!(cfg.update_dir(), PathBuf::from("/var/lib/updraft/update"));
        assert_eq!(
            cfg.notification_dir(),
            PathBuf::from("/var/lib/updraft/notification")
        );
    }
}
