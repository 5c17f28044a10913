//! Configuration management for the static cache server

use crate::error::{Result, ServeError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (default: "0.0.0.0:8080")
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Directory that request paths are resolved against (default: "www")
    #[serde(default = "default_document_root")]
    pub document_root: PathBuf,

    /// File served for "/" and for paths ending in "/" (default: "index.html")
    #[serde(default = "default_index_file")]
    pub index_file: String,

    /// Whether persistent connections are allowed at all (default: true)
    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Idle seconds before a persistent connection is closed (default: 5)
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout: u64,

    /// Maximum number of connections served at once (default: 128)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum size of a request line plus headers in bytes (default: 8KB)
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Size of each body write in bytes (default: 64KB)
    /// Valid range: 1KB to 8MB
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// max-age advertised in Cache-Control, in seconds (default: 60)
    #[serde(default = "default_cache_control_max_age")]
    pub cache_control_max_age: u64,

    /// Value of the Server response header
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// In-memory content cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// Configuration for the in-memory content cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Whether the cache is consulted at all; false bypasses it globally (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entry time-to-live in seconds (default: 30)
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,

    /// Maximum number of cached entries (default: 128)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Maximum total cached bytes, None for no byte bound (default: 64MB)
    #[serde(default = "default_max_bytes")]
    pub max_bytes: Option<usize>,

    /// Files larger than this are streamed from disk and never cached (default: 2MB)
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: usize,

    /// Re-stat the file on every hit and drop the entry if it changed (default: true)
    ///
    /// When off, a live entry is served without touching the filesystem, so
    /// edits and deletions stay invisible until the TTL runs out.
    #[serde(default = "default_true")]
    pub validate_on_hit: bool,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ttl: default_cache_ttl(),
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            max_entry_bytes: default_max_entry_bytes(),
            validate_on_hit: default_true(),
        }
    }
}

impl CacheConfig {
    /// Entry time-to-live as a Duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    /// Validate the cache configuration
    ///
    /// # Validation Rules
    /// - ttl must be > 0 when the cache is enabled
    /// - max_entries must be > 0
    /// - max_bytes, when set, must be > 0 and at least max_entry_bytes
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.ttl == 0 {
            return Err(ServeError::ConfigError(
                "cache ttl must be greater than 0 when caching is enabled".to_string(),
            ));
        }

        if self.max_entries == 0 {
            return Err(ServeError::ConfigError(
                "cache max_entries must be greater than 0".to_string(),
            ));
        }

        if let Some(max_bytes) = self.max_bytes {
            if max_bytes == 0 {
                return Err(ServeError::ConfigError(
                    "cache max_bytes must be greater than 0 when set".to_string(),
                ));
            }
            if self.max_entry_bytes > max_bytes {
                return Err(ServeError::ConfigError(format!(
                    "cache max_entry_bytes ({}) must not exceed max_bytes ({})",
                    self.max_entry_bytes, max_bytes
                )));
            }
        }

        Ok(())
    }
}

// Default value functions for serde
fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_document_root() -> PathBuf {
    PathBuf::from("www")
}

fn default_index_file() -> String {
    "index.html".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_timeout() -> u64 {
    5
}

fn default_max_connections() -> usize {
    128
}

fn default_max_header_bytes() -> usize {
    8 * 1024 // 8KB
}

fn default_chunk_size() -> usize {
    64 * 1024 // 64KB
}

fn default_cache_control_max_age() -> u64 {
    60
}

fn default_server_name() -> String {
    concat!("static-cache-server/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_max_entries() -> usize {
    128
}

fn default_max_bytes() -> Option<usize> {
    Some(64 * 1024 * 1024) // 64MB
}

fn default_max_entry_bytes() -> usize {
    2 * 1024 * 1024 // 2MB
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_address: default_listen_address(),
            document_root: default_document_root(),
            index_file: default_index_file(),
            keep_alive: default_true(),
            keep_alive_timeout: default_keep_alive_timeout(),
            max_connections: default_max_connections(),
            max_header_bytes: default_max_header_bytes(),
            chunk_size: default_chunk_size(),
            cache_control_max_age: default_cache_control_max_age(),
            server_name: default_server_name(),
            cache: CacheConfig::default(),
            metrics_endpoint: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(ServerConfig)` if loading and validation succeed
    /// * `Err(ServeError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ServeError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(content).map_err(|e| {
            ServeError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - listen_address must parse as a socket address
    /// - index_file must be a plain file name
    /// - chunk_size must be between 1KB and 8MB
    /// - max_connections and max_header_bytes must be > 0
    /// - keep_alive_timeout must be > 0 when keep-alive is enabled
    /// - cache configuration must be valid
    pub fn validate(&self) -> Result<()> {
        const MIN_CHUNK_SIZE: usize = 1024; // 1KB
        const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024; // 8MB

        self.listen_addr()?;

        if self.index_file.is_empty() || self.index_file.contains('/') || self.index_file == ".." {
            return Err(ServeError::ConfigError(format!(
                "index_file must be a plain file name, got '{}'",
                self.index_file
            )));
        }

        if self.chunk_size < MIN_CHUNK_SIZE || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ServeError::ConfigError(format!(
                "chunk_size must be between {}KB and {}MB, got {} bytes",
                MIN_CHUNK_SIZE / 1024,
                MAX_CHUNK_SIZE / (1024 * 1024),
                self.chunk_size
            )));
        }

        if self.max_connections == 0 {
            return Err(ServeError::ConfigError(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.max_header_bytes == 0 {
            return Err(ServeError::ConfigError(
                "max_header_bytes must be greater than 0".to_string(),
            ));
        }

        if self.keep_alive && self.keep_alive_timeout == 0 {
            return Err(ServeError::ConfigError(
                "keep_alive_timeout must be greater than 0 when keep-alive is enabled".to_string(),
            ));
        }

        self.cache.validate()
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_address.parse().map_err(|e| {
            ServeError::ConfigError(format!(
                "Invalid listen_address '{}': {}",
                self.listen_address, e
            ))
        })
    }

    /// Idle timeout for persistent connections
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout)
    }
}
