//! # Node Configuration
//!
//! Configuration management for a room node.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     ROOMMESH_ROLE=master                                               │
//! │     ROOMMESH_BASE_PORT=12000                                           │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/roommesh/roommesh.toml (Linux)                           │
//! │     ~/Library/Application Support/io.roommesh.node/roommesh.toml       │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Role::Client, Platform::Desktop, base port 12000                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # roommesh.toml
//! [node]
//! name = "Headset 2"
//! platform = "hololens"   # android | hololens | desktop
//! role = "client"         # master | client
//!
//! [session]
//! room_name = "lab-room"
//!
//! [transfer]
//! base_port = 12000
//! timeout_secs = 30
//! framing = "length_prefixed"   # raw | length_prefixed
//!
//! [bundles]
//! root_dir = "StreamingAssets"
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use roommesh_core::{PortAllocator, Platform, Role, MAX_PORT_OFFSET};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Framing
// =============================================================================

/// How a bulk payload is delimited on the wire.
///
/// ## Mode Comparison
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                        Framing Comparison                               │
/// │                                                                         │
/// │  LENGTH_PREFIXED (Default)          │  RAW                              │
/// │  ─────────────────────────          │  ───                              │
/// │  • 4-byte big-endian length header  │  • All bytes until sender closes  │
/// │  • Truncation is detected           │  • Truncation looks like success  │
/// │  • Size limit checked up front      │  • Size limit checked per chunk   │
/// │                                     │  • Interop with legacy peers      │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Bytes until the sender closes the connection.
    Raw,

    /// One length-delimited frame per transfer.
    #[default]
    LengthPrefixed,
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Framing::Raw => write!(f, "raw"),
            Framing::LengthPrefixed => write!(f, "length_prefixed"),
        }
    }
}

impl std::str::FromStr for Framing {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" | "close" | "legacy" => Ok(Framing::Raw),
            "length_prefixed" | "length-prefixed" | "framed" => Ok(Framing::LengthPrefixed),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown framing: '{}'. Valid options: raw, length_prefixed",
                other
            ))),
        }
    }
}

// =============================================================================
// Node Configuration
// =============================================================================

/// Identity of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name (shows up in logs).
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Platform used to pick the bundle set when acting as a client.
    #[serde(default)]
    pub platform: Platform,

    /// Fixed role for the whole session.
    #[serde(default)]
    pub role: Role,
}

fn default_node_name() -> String {
    "roommesh-node".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            name: default_node_name(),
            platform: Platform::default(),
            role: Role::default(),
        }
    }
}

// =============================================================================
// Session Configuration
// =============================================================================

/// Which room to create or join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Room name handed to the session layer.
    #[serde(default = "default_room_name")]
    pub room_name: String,
}

fn default_room_name() -> String {
    "room-mesh".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            room_name: default_room_name(),
        }
    }
}

// =============================================================================
// Transfer Settings
// =============================================================================

/// Bulk channel settings.
///
/// ## Port Layout
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  base_port + 0 .. base_port + 5 are all used (see PortAllocator).      │
/// │  Every node in a room must share the same base_port.                   │
/// │  Two rooms on one host need base ports at least 6 apart.               │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// First port of the six-port layout.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Interface listeners bind to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Host put into transfer descriptors. Auto-detected when unset.
    #[serde(default)]
    pub advertise_host: Option<String>,

    /// Bounded wait for accept, connect, read and write (seconds).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Read buffer size for raw framing.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Wire framing of bulk payloads.
    #[serde(default)]
    pub framing: Framing,

    /// Largest payload a node will accept.
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
}

fn default_base_port() -> u16 {
    12000
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    1024
}

fn default_max_payload() -> usize {
    256 * 1024 * 1024
}

impl Default for TransferSettings {
    fn default() -> Self {
        TransferSettings {
            base_port: default_base_port(),
            bind_addr: default_bind_addr(),
            advertise_host: None,
            timeout_secs: default_timeout(),
            chunk_size: default_chunk_size(),
            framing: Framing::default(),
            max_payload_bytes: default_max_payload(),
        }
    }
}

impl TransferSettings {
    /// Bounded wait as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Parsed bind interface.
    pub fn bind_ip(&self) -> SyncResult<IpAddr> {
        self.bind_addr.parse().map_err(|_| {
            SyncError::InvalidConfig(format!("bind_addr is not an IP address: {}", self.bind_addr))
        })
    }

    /// Socket address a listener for `port` binds to.
    pub fn bind_address(&self, port: u16) -> SyncResult<SocketAddr> {
        Ok(SocketAddr::new(self.bind_ip()?, port))
    }

    /// Host written into transfer descriptors.
    ///
    /// Falls back to the primary local IPv4, then to loopback.
    pub fn advertise_host(&self) -> String {
        if let Some(host) = self.advertise_host.as_deref().filter(|h| !h.is_empty()) {
            return host.to_string();
        }
        match local_ipaddress::get() {
            Some(ip) => ip,
            None => {
                warn!("Could not detect a local IPv4 address, advertising loopback");
                Ipv4Addr::LOCALHOST.to_string()
            }
        }
    }
}

// =============================================================================
// Bundle Settings
// =============================================================================

/// Where the master finds platform bundles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSettings {
    /// Directory holding one sub-directory per platform.
    #[serde(default = "default_bundle_root")]
    pub root_dir: PathBuf,

    /// Substring a bundle file name must contain.
    #[serde(default = "default_name_filter")]
    pub name_filter: String,

    /// File name endings that are never sent.
    #[serde(default = "default_exclude_suffixes")]
    pub exclude_suffixes: Vec<String>,
}

fn default_bundle_root() -> PathBuf {
    PathBuf::from("StreamingAssets")
}

fn default_name_filter() -> String {
    "networkBundle".to_string()
}

fn default_exclude_suffixes() -> Vec<String> {
    vec!["manifest".to_string(), "meta".to_string()]
}

impl Default for BundleSettings {
    fn default() -> Self {
        BundleSettings {
            root_dir: default_bundle_root(),
            name_filter: default_name_filter(),
            exclude_suffixes: default_exclude_suffixes(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete node configuration.
///
/// ## Example Config File
/// ```toml
/// [node]
/// name = "Capture PC"
/// platform = "desktop"
/// role = "master"
///
/// [session]
/// room_name = "lab-room"
///
/// [transfer]
/// base_port = 12000
/// advertise_host = "192.168.1.20"
///
/// [bundles]
/// root_dir = "/srv/roommesh/StreamingAssets"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Node identity.
    #[serde(default)]
    pub node: NodeConfig,

    /// Room to create or join.
    #[serde(default)]
    pub session: SessionConfig,

    /// Bulk channel settings.
    #[serde(default)]
    pub transfer: TransferSettings,

    /// Bundle lookup (master only).
    #[serde(default)]
    pub bundles: BundleSettings,
}

impl SyncConfig {
    /// Creates a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (roommesh.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading node config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(e.to_string()))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load node config, using defaults");
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Node config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.session.room_name.trim().is_empty() {
            return Err(SyncError::InvalidConfig("room_name must not be empty".into()));
        }

        if self.transfer.base_port == 0
            || self.transfer.base_port.checked_add(MAX_PORT_OFFSET).is_none()
        {
            return Err(SyncError::InvalidConfig(format!(
                "base_port must be between 1 and {}",
                u16::MAX - MAX_PORT_OFFSET
            )));
        }

        self.transfer.bind_ip()?;

        if self.transfer.timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.transfer.chunk_size == 0 {
            return Err(SyncError::InvalidConfig(
                "chunk_size must be greater than 0".into(),
            ));
        }

        if self.transfer.max_payload_bytes == 0 {
            return Err(SyncError::InvalidConfig(
                "max_payload_bytes must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(role) = std::env::var("ROOMMESH_ROLE") {
            match role.parse() {
                Ok(parsed) => {
                    debug!(role = %role, "Overriding role from environment");
                    self.node.role = parsed;
                }
                Err(e) => warn!(error = %e, "Ignoring ROOMMESH_ROLE"),
            }
        }

        if let Ok(room) = std::env::var("ROOMMESH_ROOM") {
            self.session.room_name = room;
        }

        if let Ok(platform) = std::env::var("ROOMMESH_PLATFORM") {
            match platform.parse() {
                Ok(parsed) => self.node.platform = parsed,
                Err(e) => warn!(error = %e, "Ignoring ROOMMESH_PLATFORM"),
            }
        }

        if let Ok(port) = std::env::var("ROOMMESH_BASE_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding base port from environment");
                self.transfer.base_port = p;
            }
        }

        if let Ok(host) = std::env::var("ROOMMESH_ADVERTISE_HOST") {
            self.transfer.advertise_host = Some(host);
        }

        if let Ok(dir) = std::env::var("ROOMMESH_BUNDLE_DIR") {
            self.bundles.root_dir = PathBuf::from(dir);
        }

        if let Ok(framing) = std::env::var("ROOMMESH_FRAMING") {
            match framing.parse() {
                Ok(parsed) => self.transfer.framing = parsed,
                Err(_) => warn!(framing = %framing, "Unknown framing in environment"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "roommesh", "node")
            .map(|dirs| dirs.config_dir().join("roommesh.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the node role.
    pub fn role(&self) -> Role {
        self.node.role
    }

    /// Returns the node platform.
    pub fn platform(&self) -> Platform {
        self.node.platform
    }

    /// Returns the room name.
    pub fn room_name(&self) -> &str {
        &self.session.room_name
    }

    /// Builds the port layout for this node.
    pub fn ports(&self) -> SyncResult<PortAllocator> {
        Ok(PortAllocator::new(self.transfer.base_port)?)
    }

    /// Host advertised in transfer descriptors.
    pub fn advertise_host(&self) -> String {
        self.transfer.advertise_host()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_parsing() {
        assert_eq!("raw".parse::<Framing>().unwrap(), Framing::Raw);
        assert_eq!(
            "length-prefixed".parse::<Framing>().unwrap(),
            Framing::LengthPrefixed
        );
        assert!("gzip".parse::<Framing>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.role(), Role::Client);
        assert_eq!(config.transfer.chunk_size, 1024);
        assert_eq!(config.transfer.timeout_secs, 30);
        assert_eq!(config.transfer.framing, Framing::LengthPrefixed);
        assert_eq!(config.bundles.name_filter, "networkBundle");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.session.room_name = "  ".into();
        assert!(config.validate().is_err());
        config.session.room_name = "lab".into();

        config.transfer.base_port = 65533;
        assert!(config.validate().is_err());
        config.transfer.base_port = 0;
        assert!(config.validate().is_err());
        config.transfer.base_port = 12000;

        config.transfer.bind_addr = "not-an-ip".into();
        assert!(config.validate().is_err());
        config.transfer.bind_addr = "127.0.0.1".into();

        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());
        config.transfer.chunk_size = 1024;

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_advertise_host_wins() {
        let mut settings = TransferSettings::default();
        settings.advertise_host = Some("10.0.0.7".into());
        assert_eq!(settings.advertise_host(), "10.0.0.7");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [node]
            role = "master"
            platform = "hololens"

            [transfer]
            base_port = 15000
            framing = "raw"
            "#,
        )
        .unwrap();
        assert_eq!(config.role(), Role::Master);
        assert_eq!(config.platform(), Platform::HoloLens);
        assert_eq!(config.transfer.framing, Framing::Raw);
        assert_eq!(config.transfer.chunk_size, 1024);
        assert_eq!(config.ports().unwrap().base(), 15000);
        assert_eq!(config.room_name(), "room-mesh");
    }

    #[test]
    fn test_toml_serialization() {
        let config = SyncConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[node]"));
        assert!(toml_str.contains("[transfer]"));
        assert!(toml_str.contains("[bundles]"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("roommesh-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("roommesh.toml");

        let mut config = SyncConfig::default();
        config.session.room_name = "saved-room".into();
        config.transfer.base_port = 23000;
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.session.room_name, "saved-room");
        assert_eq!(loaded.transfer.base_port, 23000);

        let _ = std::fs::remove_dir_all(dir);
    }
}
