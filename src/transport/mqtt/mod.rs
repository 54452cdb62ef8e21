//! `rumqttc`-backed broker client
//!
//! # Architecture
//!
//! - [`connection`] - Pure link state, client parameters and error types
//! - [`message_handler`] - Pure event routing and PUBACK classification
//! - [`client`] - Impure network loop, acknowledgement tracking and teardown
//!
//! # Usage
//!
//! ```rust,no_run
//! use device_bridge::transport::mqtt::{ClientParams, RumqttAdapter};
//! use device_bridge::transport::BrokerAdapter;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let params = ClientParams {
//!     client_id: "backend_demo".to_string(),
//!     host: "localhost".to_string(),
//!     port: 1883,
//!     credentials: None,
//!     keep_alive: Duration::from_secs(60),
//!     request_capacity: 10,
//! };
//!
//! let client = RumqttAdapter.start(params)?;
//! client
//!     .subscribe_state()
//!     .wait_for(device_bridge::transport::LinkState::is_connected)
//!     .await?;
//! client
//!     .publish("devices/demo", b"{\"on\": true}".to_vec(), Duration::from_secs(5))
//!     .await?;
//! client.disconnect(Duration::from_millis(250)).await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{RumqttAdapter, RumqttClient};
pub use connection::{
    configure_mqtt_options, ClientParams, ConnectError, Credentials, LinkState, PublishError,
};
pub use message_handler::{AckOutcome, EventRoute, MessageHandler};
