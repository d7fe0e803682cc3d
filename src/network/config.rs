//! Node configuration
//!
//! The JSON layout keeps the field names used by existing deployments
//! (`join_ip`, `local_addresses`, ...). Timing and accept-policy settings are
//! optional and fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Default cluster port
pub const DEFAULT_PORT: u16 = 9911;

/// Default dial timeout (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default time a peer gets to identify itself (10 seconds)
pub const DEFAULT_VERIFY_TIMEOUT_MS: u64 = 10_000;

/// Default keep-alive ping interval (5 seconds)
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Default read idle limit for active peers (15 seconds)
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 15_000;

/// Consecutive accept failures reported as fatal
pub const DEFAULT_ACCEPT_FAILURE_THRESHOLD: u32 = 5;

/// First accept retry delay
pub const DEFAULT_ACCEPT_BACKOFF_MS: u64 = 100;

/// Upper bound for the accept retry delay
pub const DEFAULT_ACCEPT_BACKOFF_MAX_MS: u64 = 5_000;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Node configuration, fixed once the node starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity (generated at start when empty)
    pub id: String,
    /// Join an existing cluster on start
    pub join: bool,
    /// `host:port` of the member to join
    #[serde(rename = "join_ip")]
    pub join_address: String,
    /// Addresses to listen on (ignored when `bind_all`)
    pub local_addresses: Vec<String>,
    /// Port to listen on
    pub local_port: u16,
    /// Listen on every interface
    pub bind_all: bool,
    pub connect_timeout_ms: u64,
    pub verify_timeout_ms: u64,
    /// 0 disables keep-alive pings
    pub heartbeat_interval_ms: u64,
    /// 0 disables the idle limit
    pub idle_timeout_ms: u64,
    pub accept_failure_threshold: u32,
    pub accept_backoff_ms: u64,
    pub accept_backoff_max_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            join: false,
            join_address: String::new(),
            local_addresses: Vec::new(),
            local_port: DEFAULT_PORT,
            bind_all: false,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            verify_timeout_ms: DEFAULT_VERIFY_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            accept_failure_threshold: DEFAULT_ACCEPT_FAILURE_THRESHOLD,
            accept_backoff_ms: DEFAULT_ACCEPT_BACKOFF_MS,
            accept_backoff_max_ms: DEFAULT_ACCEPT_BACKOFF_MAX_MS,
        }
    }
}

impl NodeConfig {
    /// Load a JSON configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&data)?;
        log::debug!("Loaded node configuration from {:?}", path);
        Ok(config)
    }

    /// Save as pretty-printed JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.join && self.join_address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "join address can not be empty when join is true".to_string(),
            ));
        }
        if self.verify_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "verify_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval_ms > 0
            && self.idle_timeout_ms > 0
            && self.idle_timeout_ms <= self.heartbeat_interval_ms
        {
            return Err(ConfigError::Invalid(
                "idle_timeout_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        if self.accept_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "accept_failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket addresses the node listens on
    pub fn listen_addresses(&self) -> Vec<String> {
        if self.bind_all || self.local_addresses.is_empty() {
            return vec![format!("0.0.0.0:{}", self.local_port)];
        }

        self.local_addresses
            .iter()
            .map(|addr| {
                if addr.contains(':') && !addr.starts_with('[') {
                    format!("[{}]:{}", addr, self.local_port)
                } else {
                    format!("{}:{}", addr, self.local_port)
                }
            })
            .collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
