//! Configuration for the bridge
//!
//! Every section is optional; a missing file section falls back to the
//! defaults below. Broker credentials are never stored in the file, only the
//! names of the environment variables holding them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main bridge configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub pool: PoolSection,
    /// Default publish target for the CLI
    pub broker: Option<BrokerSection>,
}

/// Envelope handling and client identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSection {
    /// Envelope field whose value alone is transmitted when present
    #[serde(default = "default_value_field")]
    pub value_field: String,
    /// Prefix for client identifiers of connections without a user scope
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            value_field: default_value_field(),
            client_id_prefix: default_client_id_prefix(),
        }
    }
}

/// Deadlines, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSection {
    /// Ceiling for waiting on the handshake once the client is started
    #[serde(default = "default_connect_poll_ms")]
    pub connect_poll_ms: u64,
    /// Hard deadline for the whole connect orchestration
    #[serde(default = "default_connect_deadline_ms")]
    pub connect_deadline_ms: u64,
    /// Bounded wait for a PUBACK
    #[serde(default = "default_publish_ack_ms")]
    pub publish_ack_ms: u64,
    /// Time a disconnecting client gets before its network loop is aborted
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_poll_ms: default_connect_poll_ms(),
            connect_deadline_ms: default_connect_deadline_ms(),
            publish_ack_ms: default_publish_ack_ms(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
        }
    }
}

impl TimeoutSection {
    pub fn connect_poll(&self) -> Duration {
        Duration::from_millis(self.connect_poll_ms)
    }

    pub fn connect_deadline(&self) -> Duration {
        Duration::from_millis(self.connect_deadline_ms)
    }

    pub fn publish_ack(&self) -> Duration {
        Duration::from_millis(self.publish_ack_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

/// Connection pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSection {
    /// Connect attempts allowed to run at the same time
    #[serde(default = "default_max_concurrent_connects")]
    pub max_concurrent_connects: usize,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Capacity of each client's request channel
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_concurrent_connects: default_max_concurrent_connects(),
            keep_alive_secs: default_keep_alive_secs(),
            request_capacity: default_request_capacity(),
        }
    }
}

/// Default broker target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, e.g. `mqtt://localhost:1883`
    pub url: String,
    pub topic: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

impl BrokerSection {
    /// Host and port of the configured broker
    pub fn endpoint(&self) -> Result<(String, u16), ConfigError> {
        parse_broker_url(&self.url)
    }

    /// Get MQTT username from environment variable
    pub fn username(&self) -> Option<String> {
        get_env_var_optional(self.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn password(&self) -> Option<String> {
        get_env_var_optional(self.password_env.as_ref())
    }
}

fn default_value_field() -> String {
    "MQTT_value".to_string()
}

fn default_client_id_prefix() -> String {
    "backend".to_string()
}

fn default_connect_poll_ms() -> u64 {
    2000
}

fn default_connect_deadline_ms() -> u64 {
    3000
}

fn default_publish_ack_ms() -> u64 {
    5000
}

fn default_disconnect_grace_ms() -> u64 {
    250
}

fn default_max_concurrent_connects() -> usize {
    16
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_request_capacity() -> usize {
    10
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.value_field.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "bridge.value_field must not be empty".to_string(),
            ));
        }

        let timeouts = &self.timeouts;
        let all_positive = [
            timeouts.connect_poll_ms,
            timeouts.connect_deadline_ms,
            timeouts.publish_ack_ms,
        ]
        .iter()
        .all(|&ms| ms > 0);
        if !all_positive {
            return Err(ConfigError::InvalidConfig(
                "connect and publish timeouts must be greater than 0".to_string(),
            ));
        }
        if timeouts.connect_poll_ms > timeouts.connect_deadline_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "timeouts.connect_poll_ms ({}) must not exceed timeouts.connect_deadline_ms ({})",
                timeouts.connect_poll_ms, timeouts.connect_deadline_ms
            )));
        }

        if self.pool.max_concurrent_connects == 0 {
            return Err(ConfigError::InvalidConfig(
                "pool.max_concurrent_connects must be greater than 0".to_string(),
            ));
        }
        if self.pool.request_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "pool.request_capacity must be greater than 0".to_string(),
            ));
        }
        if self.pool.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "pool.keep_alive_secs must be at least 5".to_string(),
            ));
        }

        if let Some(broker) = &self.broker {
            broker.endpoint()?;
        }

        Ok(())
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

/// Parse `mqtt://host:port` (or `tcp://`) into host and port; port defaults to 1883
pub fn parse_broker_url(broker_url: &str) -> Result<(String, u16), ConfigError> {
    let url =
        Url::parse(broker_url).map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;

    if !matches!(url.scheme(), "mqtt" | "tcp") {
        return Err(ConfigError::InvalidBrokerUrl(format!(
            "{broker_url} (unsupported scheme '{}')",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(1883);

    Ok((host.to_string(), port))
}
