//! Broker client adapter
//!
//! This module provides the seam between the connection pool and the MQTT
//! client library. The pool only ever talks to [`BrokerAdapter`] and
//! [`BrokerClient`], which keeps it testable without a broker.

use std::time::Duration;
use tokio::sync::watch;

pub mod mqtt;

pub use mqtt::{ClientParams, ConnectError, Credentials, LinkState, PublishError};

/// One started connection to one broker
///
/// A client exclusively owns its background network processing. Dropping
/// the client, calling [`BrokerClient::abort`], or calling
/// [`BrokerClient::disconnect`] all stop it.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    /// Client identifier presented to the broker
    fn client_id(&self) -> &str;

    /// Current link state
    fn link_state(&self) -> LinkState;

    /// Liveness notifications, replacing connect/disconnect callbacks
    fn subscribe_state(&self) -> watch::Receiver<LinkState>;

    /// Liveness check used before reusing a pooled connection
    fn is_connected(&self) -> bool {
        self.link_state().is_connected()
    }

    /// QoS 1, non-retained publish that waits for the broker's acknowledgement
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        ack_timeout: Duration,
    ) -> Result<(), PublishError>;

    /// Graceful disconnect; background processing is stopped within `grace`
    async fn disconnect(&self, grace: Duration);

    /// Stop background processing immediately
    fn abort(&self);
}

/// Factory for broker clients
pub trait BrokerAdapter: Send + Sync {
    /// Construct a client and start its background network processing
    ///
    /// Returns as soon as processing has started; the handshake outcome is
    /// reported through [`BrokerClient::subscribe_state`]. Must be called from
    /// within a Tokio runtime.
    fn start(&self, params: ClientParams) -> Result<Box<dyn BrokerClient>, ConnectError>;
}
