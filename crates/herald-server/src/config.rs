//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - TOML configuration file (`HERALD_CONFIG` if set, otherwise the first of
//!   `herald.toml`, `/etc/herald/herald.toml`, `~/.config/herald/herald.toml`)
//! - Environment variables (`HERALD_PORT`, `HERALD_BROKER__OUTBOX_CAPACITY`, ...)

use anyhow::{Context, Result};
use herald_core::{BrokerConfig, HubConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit configuration file.
const CONFIG_ENV: &str = "HERALD_CONFIG";

/// Locations searched for a configuration file.
const CONFIG_PATHS: [&str; 3] = [
    "herald.toml",
    "/etc/herald/herald.toml",
    "~/.config/herald/herald.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Event broker settings.
    #[serde(default)]
    pub broker: BrokerSettings,

    /// Presence hub settings.
    #[serde(default)]
    pub presence: PresenceSettings,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Event broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Depth of each broker request queue.
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,

    /// Events buffered per connection before publishing blocks.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// Drop an event for a connection whose outbox stays full this long.
    /// Unset means publishing waits for slow readers.
    #[serde(default)]
    pub delivery_timeout_ms: Option<u64>,
}

/// Presence hub settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSettings {
    /// Depth of each hub request queue.
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Keep-alive interval for open streams, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_request_capacity() -> usize {
    64
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    15_000 // 15 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            broker: BrokerSettings::default(),
            presence: PresenceSettings::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            request_capacity: default_request_capacity(),
            outbox_capacity: default_outbox_capacity(),
            delivery_timeout_ms: None,
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            request_capacity: default_request_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
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

impl BrokerSettings {
    /// Core broker configuration for these settings.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            request_capacity: self.request_capacity,
            outbox_capacity: self.outbox_capacity,
            delivery_timeout: self.delivery_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl PresenceSettings {
    /// Core hub configuration for these settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            request_capacity: self.request_capacity,
        }
    }
}

impl HeartbeatConfig {
    /// Keep-alive interval. Never zero.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Config {
    /// Load configuration from the config file, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file named by `HERALD_CONFIG` is missing, a
    /// config file cannot be parsed, or an override has the wrong type.
    pub fn load() -> Result<Self> {
        Self::layered(config_path().as_deref(), "HERALD")
    }

    /// Build configuration from an optional file and environment variables
    /// starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or deserialized.
    pub fn layered(file: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            let name = path.to_string_lossy();
            builder = builder.add_source(config::File::new(&name, config::FileFormat::Toml));
        }

        builder
            .add_source(
                config::Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port don't form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref()));
    }

    CONFIG_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}
