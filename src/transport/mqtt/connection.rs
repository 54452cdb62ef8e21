//! Pure connection state management for MQTT clients
//!
//! This module contains the link state machine, per-connection client
//! parameters, the error types surfaced by the broker adapter, and the pure
//! function that turns parameters into `rumqttc` options.

use rumqttc::v5::MqttOptions;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Liveness of a single broker link, as observed by its network loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Network loop started, no ConnAck yet
    Connecting,
    /// ConnAck received, publishing is allowed
    Connected,
    /// Broker answered the handshake with a failure code
    Refused(String),
    /// Link closed or never opened (network error, broker disconnect, abort)
    Disconnected(String),
}

impl LinkState {
    /// Whether the handshake has finished one way or the other
    pub fn is_settled(&self) -> bool {
        !matches!(self, LinkState::Connecting)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

/// Username/password pair for broker authentication
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    /// Build credentials only when a non-empty username is present
    pub fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        let username = username.map(str::trim).filter(|u| !u.is_empty())?;
        Some(Self {
            username: username.to_string(),
            password: password.map(str::to_string),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Everything the adapter needs to start one client
#[derive(Debug, Clone)]
pub struct ClientParams {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    /// Capacity of the client's request channel
    pub request_capacity: usize,
}

impl ClientParams {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection attempt failures
///
/// `Clone` so that every caller waiting on the same in-flight attempt
/// receives the same failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Connection to {endpoint} timed out after {elapsed_ms}ms")]
    Timeout { endpoint: String, elapsed_ms: u64 },
    #[error("Broker {endpoint} refused the connection: {reason}")]
    Refused { endpoint: String, reason: String },
    #[error("Network error connecting to {endpoint}: {reason}")]
    Network { endpoint: String, reason: String },
    #[error("Connection to {endpoint} was torn down while connecting")]
    Cancelled { endpoint: String },
}

impl ConnectError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectError::Timeout { .. })
    }
}

/// Single publish attempt failures; none of them tear down the connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("No acknowledgement for publish to '{topic}' within {waited_ms}ms")]
    Timeout { topic: String, waited_ms: u64 },
    #[error("Broker rejected publish to '{topic}': {reason}")]
    Rejected { topic: String, reason: String },
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: LinkState },
    #[error("Link lost before publish to '{topic}' was acknowledged: {reason}")]
    LinkLost { topic: String, reason: String },
    #[error("Client request failed: {0}")]
    Client(String),
}

/// Pure function to configure MQTT options from client parameters
pub fn configure_mqtt_options(params: &ClientParams) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&params.client_id, &params.host, params.port);

    if let Some(credentials) = &params.credentials {
        mqtt_options.set_credentials(
            &credentials.username,
            credentials.password.as_deref().unwrap_or_default(),
        );
    }

    mqtt_options.set_keep_alive(params.keep_alive);

    // Each pooled link is a fresh session; nothing is resumed across reconnects
    mqtt_options.set_clean_start(true);

    // Assistant payloads can be large structured documents
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    mqtt_options
}
