//! Client configuration: network, routing, storage, and privacy tunables,
//! loaded from a TOML file with sensible defaults for anything omitted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Directory-authority and provider connectivity settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Route-construction tunables.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// ARQ and fetch-loop tunables.
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    /// Local persistence settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Directory-authority and provider connectivity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address of our provider.
    #[serde(default = "default_provider_address")]
    pub provider_address: String,
    /// Timeout for a single link operation (send or fetch), in milliseconds.
    #[serde(default = "default_link_timeout_ms")]
    pub link_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            provider_address: default_provider_address(),
            link_timeout_ms: default_link_timeout_ms(),
        }
    }
}

fn default_provider_address() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_link_timeout_ms() -> u64 {
    30_000
}

/// Route-construction tunables (component B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Number of hops per constructed route, including both providers.
    #[serde(default = "default_hop_count")]
    pub hop_count: usize,
    /// Poisson rate parameter (packets/ms) for per-hop delay sampling.
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    /// Epoch rotation period, in seconds.
    #[serde(default = "default_epoch_period_secs")]
    pub epoch_period_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            hop_count: default_hop_count(),
            lambda: default_lambda(),
            epoch_period_secs: default_epoch_period_secs(),
        }
    }
}

impl RoutingConfig {
    /// Build a [`crate::route::RouteBuilder`] from this configuration's
    /// hop count and Poisson rate.
    pub fn route_builder(&self) -> crate::route::RouteBuilder {
        crate::route::RouteBuilder {
            hop_count: self.hop_count,
            lambda: self.lambda,
        }
    }

    /// This configuration's epoch period, in milliseconds.
    pub fn period_ms(&self) -> u64 {
        self.epoch_period_secs * 1_000
    }
}

fn default_hop_count() -> usize {
    5
}

fn default_lambda() -> f64 {
    1.0 / 120.0
}

fn default_epoch_period_secs() -> u64 {
    3_600
}

/// ARQ and fetch-loop tunables (components D and E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Extra margin added on top of the RTT estimate before a block is
    /// considered overdue for retransmission, in milliseconds.
    #[serde(default = "default_rtt_slop_ms")]
    pub rtt_slop_ms: u64,
    /// Minimum fetch-poll interval, in milliseconds.
    #[serde(default = "default_min_poll_interval_ms")]
    pub min_poll_interval_ms: u64,
    /// Maximum fetch-poll interval (adaptive backoff ceiling), in
    /// milliseconds.
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            rtt_slop_ms: default_rtt_slop_ms(),
            min_poll_interval_ms: default_min_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
        }
    }
}

fn default_rtt_slop_ms() -> u64 {
    crate::arq::RTT_SLOP_MS
}

fn default_min_poll_interval_ms() -> u64 {
    500
}

fn default_max_poll_interval_ms() -> u64 {
    30_000
}

/// Local persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the durable SQLite database file. Relative to the process's
    /// working directory unless absolute.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
        }
    }
}

fn default_data_path() -> PathBuf {
    default_data_dir().join("mixclient.db")
}

#[cfg(target_os = "linux")]
fn default_data_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".local/share"))
                .unwrap_or_else(|| PathBuf::from("."))
        })
        .join("mixclient")
}

#[cfg(target_os = "macos")]
fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Library/Application Support/mixclient"))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            routing: RoutingConfig::default(),
            reliability: ReliabilityConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file at `path`. Any field the file
    /// omits falls back to its default; a missing file is not an error —
    /// callers that want that to be one should check existence themselves.
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::TransportError::Fatal(format!("reading config {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| crate::TransportError::Fatal(format!("parsing config {}: {e}", path.display())))
    }
}
