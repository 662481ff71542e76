//! Configuration system for Skylink
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/skylink/config.toml
//! - Linux: ~/.config/skylink/config.toml
//! - Windows: %APPDATA%/skylink/config.toml
//!
//! Retry and burst numbers depend on the link's round-trip time, so every
//! one of them is tunable; the defaults suit a local UDP link.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::MAX_DATA_LEN;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transfer client settings
    pub client: ClientConfig,
    /// File server settings
    pub server: ServerConfig,
    /// Demo link settings
    pub link: LinkConfig,
}

/// Transfer client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-attempt reply timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Resends of one request before giving up
    pub max_retries: u32,
    /// Bytes requested per ReadFile / sent per WriteFile
    pub chunk_size: u8,
    /// Use BurstReadFile for downloads
    pub use_burst: bool,
    /// Byte budget requested per burst
    pub burst_max_bytes: u32,
    /// Out-of-order bytes buffered while waiting for a gap to close
    pub burst_window_bytes: usize,
    /// Silence inside a burst before falling back to sequential reads
    pub burst_gap_timeout_ms: u64,
    /// Compare CRC32 with the peer after each upload/download
    pub verify_crc32: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 500,
            max_retries: 5,
            chunk_size: MAX_DATA_LEN as u8,
            use_burst: true,
            burst_max_bytes: 64 * 1024,
            burst_window_bytes: 16 * 1024,
            burst_gap_timeout_ms: 200,
            verify_crc32: true,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn burst_gap_timeout(&self) -> Duration {
        Duration::from_millis(self.burst_gap_timeout_ms)
    }

    /// Chunk size clamped to the payload capacity
    pub fn effective_chunk_size(&self) -> usize {
        (self.chunk_size as usize).clamp(1, MAX_DATA_LEN)
    }
}

/// File server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Jail root (None = every path resolves to "does not exist")
    pub root_dir: Option<PathBuf>,
    /// Concurrently open sessions
    pub max_sessions: u8,
    /// Upper bound on bytes streamed per BurstReadFile request
    pub burst_max_bytes: u32,
    /// How long the last reply stays available for a retried request
    pub replay_ttl_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            max_sessions: 4,
            burst_max_bytes: 64 * 1024,
            replay_ttl_ms: 2_000,
        }
    }
}

impl ServerConfig {
    pub fn replay_ttl(&self) -> Duration {
        Duration::from_millis(self.replay_ttl_ms)
    }
}

/// Demo UDP link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Local bind address
    pub bind: SocketAddr,
    /// Peer address (None = learn from the first inbound datagram)
    pub peer: Option<SocketAddr>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 14555),
            peer: None,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "skylink", "skylink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
