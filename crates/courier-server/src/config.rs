//! Server configuration.
//!
//! Courier reads the first `courier.toml` it finds (working directory,
//! `/etc/courier/`, then the per-user config directory) and falls back to
//! built-in defaults. `COURIER_HOST`, `COURIER_PORT`, and `COURIER_DB`
//! override the listen address and database path when no file sets them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Candidate config file locations, checked in order.
const SEARCH_PATHS: &[&str] = &[
    "courier.toml",
    "/etc/courier/courier.toml",
    "~/.config/courier/courier.toml",
];

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Durable storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// WebSocket credential gate.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics export.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Durable storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path, or `:memory:` for a scratch database.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl StorageConfig {
    /// Whether the configured database is the in-memory scratch one.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

/// WebSocket credential gate.
///
/// Verification of credentials happens upstream of the relay; when
/// `require_token` is set, upgrades arriving without a `token` query
/// parameter are refused outright.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Refuse WebSocket connects that carry no token.
    #[serde(default)]
    pub require_token: bool,
}

/// Resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted message content, in bytes.
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
}

/// Metrics export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve a Prometheus scrape endpoint.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port for the scrape endpoint.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn env_or(var: &str, fallback: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| fallback.to_string())
}

fn default_host() -> String {
    env_or("COURIER_HOST", "127.0.0.1")
}

fn default_port() -> u16 {
    std::env::var("COURIER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_db_path() -> String {
    env_or("COURIER_DB", "courier.db")
}

fn default_max_content_bytes() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            storage: StorageConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: default_max_content_bytes(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first file found, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        for candidate in SEARCH_PATHS {
            let expanded = shellexpand::tilde(candidate);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// The socket address to bind.
    ///
    /// # Errors
    ///
    /// Returns an error when host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
