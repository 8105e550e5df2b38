//! TOML-based configuration for the node.
//!
//! Reads and writes [`NodeConfig`] at the platform-appropriate location:
//! - Linux:   `~/.config/netplay/config.toml`
//! - Windows: `%APPDATA%\netplay\config.toml`
//! - macOS:   `~/Library/Application Support/netplay/config.toml`
//!
//! Every field carries a serde default so a partial (or absent) file works:
//! first runs and upgrades from older files both resolve to sane values.
//! Durations are stored as integer milliseconds and converted through the
//! typed accessors.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::director::DirectorConfig;
use crate::infrastructure::discovery::DiscoveryConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level node configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub directory: DirectorySection,
}

/// Identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    /// Name shown to other players.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Game build version; join handshakes require an exact match.
    #[serde(default = "default_game_version")]
    pub game_version: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Session transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// TCP port the session transport listens on when hosting.
    #[serde(default = "default_session_port")]
    pub session_port: u16,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Cadence of the owned scheduler loop.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

/// UDP discovery protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySection {
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    #[serde(default = "default_candidate_token")]
    pub candidate_token: String,
    #[serde(default = "default_ready_token")]
    pub ready_token: String,
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    #[serde(default = "default_search_window_ms")]
    pub search_window_ms: u64,
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

/// Wide-area registry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectorySection {
    /// `host:port` of the registry service.
    #[serde(default = "default_registry_addr")]
    pub registry_addr: String,
    /// Key under which sessions of this game are published and queried.
    #[serde(default = "default_session_type_name")]
    pub session_type_name: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_display_name() -> String {
    "player".to_string()
}
fn default_game_version() -> String {
    "1.0.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_session_port() -> u16 {
    21182
}
fn default_max_peers() -> usize {
    32
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_ping_interval_ms() -> u64 {
    1000
}
fn default_ping_timeout_ms() -> u64 {
    5000
}
fn default_tick_interval_ms() -> u64 {
    50
}
fn default_discovery_port() -> u16 {
    22043
}
fn default_candidate_token() -> String {
    "wanttobeaserver".to_string()
}
fn default_ready_token() -> String {
    "iamaserver".to_string()
}
fn default_announce_interval_ms() -> u64 {
    1000
}
fn default_search_window_ms() -> u64 {
    3000
}
fn default_ttl_ms() -> u64 {
    5000
}
fn default_registry_addr() -> String {
    "127.0.0.1:23466".to_string()
}
fn default_session_type_name() -> String {
    "netplay/1.0".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            game_version: default_game_version(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            session_port: default_session_port(),
            max_peers: default_max_peers(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            candidate_token: default_candidate_token(),
            ready_token: default_ready_token(),
            announce_interval_ms: default_announce_interval_ms(),
            search_window_ms: default_search_window_ms(),
            ttl_ms: default_ttl_ms(),
        }
    }
}

impl Default for DirectorySection {
    fn default() -> Self {
        Self {
            registry_addr: default_registry_addr(),
            session_type_name: default_session_type_name(),
        }
    }
}

// ── Typed views ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Director timing knobs derived from this config.
    pub fn director_config(&self) -> DirectorConfig {
        DirectorConfig {
            display_name: self.node.display_name.clone(),
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            ping_interval: Duration::from_millis(self.network.ping_interval_ms),
            ping_timeout: Duration::from_millis(self.network.ping_timeout_ms),
        }
    }

    /// Discovery protocol settings derived from this config.
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            port: self.discovery.port,
            broadcast_addr: Ipv4Addr::BROADCAST,
            candidate_token: self.discovery.candidate_token.clone(),
            ready_token: self.discovery.ready_token.clone(),
            announce_interval: Duration::from_millis(self.discovery.announce_interval_ms),
            search_window: Duration::from_millis(self.discovery.search_window_ms),
            ttl: Duration::from_millis(self.discovery.ttl_ms),
            session_port: self.network.session_port,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.network.tick_interval_ms)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the base directory
/// cannot be determined from the environment.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads [`NodeConfig`] from disk, returning defaults if the file does not
/// yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not
/// found", and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config() -> Result<NodeConfig, ConfigError> {
    let path = config_file_path()?;
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NodeConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Persists `config` to disk, creating the directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &NodeConfig) -> Result<(), ConfigError> {
    let path = config_file_path()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("netplay"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("netplay")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("netplay"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
