//! Configuration loading from TOML and environment variables.
//!
//! Every field has a default, so an empty file (or no file) is valid.
//! Environment variable prefix: `AGENT_RELAY_`

use std::{path::Path, time::Duration};

use agent_relay_core::command_feed::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_HISTORY_LIMIT};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::EvictionPolicy;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Agent registry configuration.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Outbound dispatcher configuration.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Command feed configuration.
    #[serde(default)]
    pub feed: FeedConfig,
    /// Crypto configuration.
    #[serde(default)]
    pub crypto: CryptoConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Agent registry configuration. Unset limits mean agents are never evicted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum number of agents kept; the least recently seen is evicted.
    #[serde(default)]
    pub max_agents: Option<usize>,
    /// Agents idle longer than this are removed by `evict_idle`.
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,
}

/// Outbound dispatcher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// First transport ordering token (e.g. the account nonce).
    #[serde(default)]
    pub initial_ordering_token: u64,
}

/// Command feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Commands retained for late subscribers.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Live broadcast channel capacity.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Crypto configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Strength of the server bootstrap keypair.
    #[serde(default = "default_keypair_bits")]
    pub keypair_bits: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "agent_relay_session=debug").
    #[serde(default = "default_log_level")]
    pub level: String,
}

// -- Defaults --

const fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}
const fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}
const fn default_keypair_bits() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            keypair_bits: default_keypair_bits(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RegistryConfig {
    /// Eviction policy described by this configuration.
    #[must_use]
    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            max_agents: self.max_agents,
            idle_ttl: self.idle_ttl_secs.map(Duration::from_secs),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns error on invalid TOML or mistyped fields.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from an optional TOML file, with environment
    /// variable overrides. A missing file falls back to defaults.
    ///
    /// # Errors
    /// Returns error if an existing file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AGENT_RELAY_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("AGENT_RELAY_INITIAL_ORDERING_TOKEN") {
            if let Ok(token) = val.parse() {
                self.dispatcher.initial_ordering_token = token;
            }
        }
        if let Ok(val) = std::env::var("AGENT_RELAY_MAX_AGENTS") {
            if let Ok(max) = val.parse() {
                self.registry.max_agents = Some(max);
            }
        }
        if let Ok(val) = std::env::var("AGENT_RELAY_IDLE_TTL_SECS") {
            if let Ok(ttl) = val.parse() {
                self.registry.idle_ttl_secs = Some(ttl);
            }
        }
    }
}
