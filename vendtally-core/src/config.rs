//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/vendtally/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/vendtally/` (~/.config/vendtally/)
//! - Data: `$XDG_DATA_HOME/vendtally/` (~/.local/share/vendtally/)
//! - State/Logs: `$XDG_STATE_HOME/vendtally/` (~/.local/state/vendtally/)

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest ring buffer a counter may allocate
pub const MAX_RING_BUFFER_SIZE: u32 = 10_000;

/// Endpoint used when none is configured
pub const DEFAULT_API_ENDPOINT: &str = "https://api.example.com/consumption";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Counter operating parameters
    #[serde(default)]
    pub counter: CounterConfig,

    /// HTTP sink transport settings
    #[serde(default)]
    pub sink: SinkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Operating parameters of a counter instance
///
/// `ring_buffer_size` and `machine_id` are fixed once the counter is
/// initialized; everything else can be changed through
/// [`Counter::update_config`](crate::Counter::update_config).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Unique machine identifier (must be nonzero to validate)
    #[serde(default)]
    pub machine_id: u32,

    /// Forward aggregates to the external sink
    #[serde(default)]
    pub enable_external_api: bool,

    /// Number of events kept in the ring buffer (1-10000)
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: u32,

    /// Seconds between aggregation windows
    #[serde(default = "default_aggregation_interval")]
    pub aggregation_interval: u64,

    /// Sink endpoint URL
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Sink credential, empty when unused
    #[serde(default)]
    pub api_key: String,

    /// Retry budget handed to the sink for each send
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            machine_id: 0,
            enable_external_api: false,
            ring_buffer_size: default_ring_buffer_size(),
            aggregation_interval: default_aggregation_interval(),
            api_endpoint: default_api_endpoint(),
            api_key: String::new(),
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

impl CounterConfig {
    /// Create a default configuration for the given machine
    pub fn for_machine(machine_id: u32) -> Self {
        Self {
            machine_id,
            ..Default::default()
        }
    }

    /// Reset every operating parameter to its default
    ///
    /// The machine id and API key are cleared; callers fill them in afterwards.
    pub fn apply_defaults(&mut self) {
        *self = Self::default();
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.machine_id == 0 {
            return Err(Error::InvalidConfig(
                "counter.machine_id must be nonzero".to_string(),
            ));
        }
        if self.ring_buffer_size == 0 || self.ring_buffer_size > MAX_RING_BUFFER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "counter.ring_buffer_size must be between 1 and {}",
                MAX_RING_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Check validity without an error message
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// The API key, if one is configured
    pub fn api_key(&self) -> Option<&str> {
        if self.api_key.is_empty() {
            None
        } else {
            Some(&self.api_key)
        }
    }
}

fn default_ring_buffer_size() -> u32 {
    1000
}

fn default_aggregation_interval() -> u64 {
    3600
}

fn default_api_endpoint() -> String {
    DEFAULT_API_ENDPOINT.to_string()
}

fn default_max_retry_attempts() -> u32 {
    3
}

/// HTTP sink transport configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    /// HTTP request timeout in seconds
    #[serde(default = "default_sink_timeout")]
    pub timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sink_timeout(),
        }
    }
}

fn default_sink_timeout() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("failed to read config file {:?}: {}", path, e))
        })?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/vendtally/config.toml` (~/.config/vendtally/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("vendtally").join("config.toml")
    }

    /// Returns the data directory path (for persisted counter state)
    ///
    /// `$XDG_DATA_HOME/vendtally/` (~/.local/share/vendtally/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("vendtally")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/vendtally/` (~/.local/state/vendtally/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("vendtally")
    }

    /// Returns the state database path
    ///
    /// `$XDG_DATA_HOME/vendtally/state.db` (~/.local/share/vendtally/state.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("state.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/vendtally/vendtally.log` (~/.local/state/vendtally/vendtally.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("vendtally.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
