//! Hub configuration
//!
//! Loaded once from TOML at startup (and again on reload). Every tunable has a
//! default so a minimal file only needs the `[hub]` section.

use crate::cloud::retry::RetryPolicy;
use crate::identity::is_valid_id;
use crate::routing::RouteTable;
use crate::store::{OverflowPolicy, StoreConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main hub configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    pub hub: HubSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub connections: ConnectionsSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub twin: TwinSection,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

/// Identity of the edge device hosting the hub
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubSection {
    /// Edge device id (must match [A-Za-z0-9._:-]+)
    pub device_id: String,
    /// Upstream hub host name
    pub iothub_hostname: String,
}

/// Upstream link tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamSection {
    /// Explicit timeout for a single open attempt (default: 120 = 2 minutes)
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
    /// Timeout applied to each send or twin operation
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// Messages above this size are rejected as too large
    #[serde(default = "default_max_message_size")]
    pub max_message_size_bytes: usize,
    /// Maximum batch handed to the upstream by store drains
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// MQTT port of the upstream hub
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Exponential backoff for upstream reconnects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// 0 = unbounded
    #[serde(default)]
    pub max_attempts: u32,
}

/// Connection lifecycle windows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionsSection {
    /// Disconnected connections are closed after this window
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_secs: u64,
    /// Bounded grace for close-and-replace of a superseded connection
    #[serde(default = "default_replace_timeout")]
    pub replace_timeout_secs: u64,
    /// Time given to in-flight upstream sends before teardown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

/// Store-and-forward limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// 0 = no age limit
    #[serde(default = "default_time_to_live")]
    pub time_to_live_secs: u64,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

/// Router retry behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterSection {
    #[serde(default = "default_throttle_backoff")]
    pub throttle_initial_backoff_ms: u64,
    /// Longest in-process wait on a throttled destination before storing
    #[serde(default = "default_max_throttle_wait")]
    pub max_throttle_wait_ms: u64,
    /// Drain tasks re-check unavailable endpoints at this interval
    #[serde(default = "default_drain_retry_interval")]
    pub drain_retry_interval_secs: u64,
}

/// Twin reconciliation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TwinSection {
    /// Resubmissions after a version conflict before a patch is dropped
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

/// One `[[routes]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteEntry {
    pub name: String,
    pub route: String,
}

fn default_open_timeout() -> u64 {
    120
}

fn default_operation_timeout() -> u64 {
    30
}

fn default_max_message_size() -> usize {
    256 * 1024
}

fn default_batch_size() -> usize {
    10
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_disconnect_grace() -> u64 {
    5
}

fn default_replace_timeout() -> u64 {
    5
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_max_depth() -> usize {
    10_000
}

fn default_time_to_live() -> u64 {
    7200
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_throttle_backoff() -> u64 {
    100
}

fn default_max_throttle_wait() -> u64 {
    5000
}

fn default_drain_retry_interval() -> u64 {
    5
}

fn default_conflict_retries() -> u32 {
    1
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            open_timeout_secs: default_open_timeout(),
            operation_timeout_secs: default_operation_timeout(),
            max_message_size_bytes: default_max_message_size(),
            batch_size: default_batch_size(),
            port: default_mqtt_port(),
            reconnect: ReconnectSection::default(),
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
            max_attempts: 0,
        }
    }
}

impl Default for ConnectionsSection {
    fn default() -> Self {
        Self {
            disconnect_grace_secs: default_disconnect_grace(),
            replace_timeout_secs: default_replace_timeout(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            time_to_live_secs: default_time_to_live(),
            overflow: OverflowPolicy::default(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            throttle_initial_backoff_ms: default_throttle_backoff(),
            max_throttle_wait_ms: default_max_throttle_wait(),
            drain_retry_interval_secs: default_drain_retry_interval(),
        }
    }
}

impl Default for TwinSection {
    fn default() -> Self {
        Self {
            conflict_retries: default_conflict_retries(),
        }
    }
}

impl ReconnectSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
            max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
        }
    }
}

impl StoreSection {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_depth: self.max_depth,
            time_to_live: (self.time_to_live_secs > 0)
                .then(|| Duration::from_secs(self.time_to_live_secs)),
            overflow: self.overflow,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HubConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and that every route parses
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_id(&self.hub.device_id) {
            return Err(ConfigError::InvalidDeviceId(format!(
                "Device ID '{}' must match pattern [A-Za-z0-9._:-]+",
                self.hub.device_id
            )));
        }

        if self.hub.iothub_hostname.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "hub.iothub_hostname must not be empty".to_string(),
            ));
        }

        if self.upstream.open_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "upstream.open_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.upstream.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "upstream.batch_size must be greater than 0".to_string(),
            ));
        }

        self.upstream
            .reconnect
            .retry_policy()
            .validate()
            .map_err(ConfigError::InvalidConfig)?;

        if self.store.max_depth == 0 {
            return Err(ConfigError::InvalidConfig(
                "store.max_depth must be greater than 0".to_string(),
            ));
        }

        self.route_table()?;
        Ok(())
    }

    /// Parse the `[[routes]]` entries into an immutable route table
    pub fn route_table(&self) -> Result<RouteTable, ConfigError> {
        RouteTable::parse(
            self.routes
                .iter()
                .map(|entry| (entry.name.as_str(), entry.route.as_str())),
        )
        .map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.open_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.operation_timeout_secs)
    }

    /// Minimal configuration used by tests and examples
    pub fn for_device(device_id: &str, iothub_hostname: &str) -> Self {
        Self {
            hub: HubSection {
                device_id: device_id.to_string(),
                iothub_hostname: iothub_hostname.to_string(),
            },
            upstream: UpstreamSection::default(),
            connections: ConnectionsSection::default(),
            store: StoreSection::default(),
            router: RouterSection::default(),
            twin: TwinSection::default(),
            routes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[hub]
device_id = "edge-gw-01"
iothub_hostname = "contoso.azure-devices.net"

[upstream]
open_timeout_secs = 60
operation_timeout_secs = 10
max_message_size_bytes = 1024
batch_size = 5

[upstream.reconnect]
initial_backoff_ms = 500
max_backoff_ms = 30000
multiplier = 1.5
max_attempts = 0

[connections]
disconnect_grace_secs = 3

[store]
max_depth = 100
time_to_live_secs = 0
overflow = "reject_new"

[router]
max_throttle_wait_ms = 2000

[twin]
conflict_retries = 2

[[routes]]
name = "upstream"
route = "FROM /messages/* INTO $upstream"

[[routes]]
name = "alerts"
route = "FROM /messages/modules/sensor/outputs/alerts INTO BrokeredEndpoint(\"/modules/filter/inputs/in1\")"
"#;

        let config = HubConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.hub.device_id, "edge-gw-01");
        assert_eq!(config.upstream.open_timeout_secs, 60);
        assert_eq!(config.upstream.reconnect.multiplier, 1.5);
        assert_eq!(config.connections.disconnect_grace_secs, 3);
        assert_eq!(config.connections.replace_timeout_secs, 5);
        assert_eq!(config.store.overflow, OverflowPolicy::RejectNew);
        assert_eq!(config.store.store_config().time_to_live, None);
        assert_eq!(config.twin.conflict_retries, 2);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.route_table().unwrap().len(), 2);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let toml_content = r#"
[hub]
device_id = "edge"
iothub_hostname = "hub.example.net"
"#;

        let config = HubConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.open_timeout(), Duration::from_secs(120));
        assert_eq!(config.upstream.max_message_size_bytes, 262_144);
        assert_eq!(config.store.max_depth, 10_000);
        assert_eq!(config.store.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.twin.conflict_retries, 1);
        assert_eq!(config.upstream.reconnect.retry_policy().max_attempts, None);
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_invalid_device_id() {
        let toml_content = r#"
[hub]
device_id = "edge gw"
iothub_hostname = "hub.example.net"
"#;

        let result = HubConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidDeviceId(_))));
    }

    #[test]
    fn test_invalid_route_rejected_at_load() {
        let toml_content = r#"
[hub]
device_id = "edge"
iothub_hostname = "hub.example.net"

[[routes]]
name = "broken"
route = "FROM /messages/* WHERE INTO $upstream"
"#;

        let result = HubConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_depth_rejected() {
        let mut config = HubConfig::for_device("edge", "hub.example.net");
        config.store.max_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bounded_reconnect_attempts() {
        let mut config = HubConfig::for_device("edge", "hub.example.net");
        config.upstream.reconnect.max_attempts = 4;
        assert_eq!(config.upstream.reconnect.retry_policy().max_attempts, Some(4));
    }
}
