//! device-bridge
//!
//! The connection layer of an LLM-to-device bridge: a persistent,
//! multi-tenant MQTT connection manager that relays an assistant's structured
//! output to the broker a device listens on.
//!
//! # Overview
//!
//! - One long-lived broker connection per (broker, credentials, user,
//!   session), reused across publish requests
//! - Dead connections detected and replaced at the next lookup
//! - Connect and publish deadlines that always clean up after themselves
//! - Teardown per user, per session, and at shutdown
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use device_bridge::{BridgeConfig, BridgeService, BrokerTarget, OutboundEnvelope, TenantScope};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let service = BridgeService::with_rumqttc(BridgeConfig::default());
//! let target = BrokerTarget::new("localhost", 1883, "devices/lamp")?;
//! let envelope = OutboundEnvelope::from_value(json!({"MQTT_value": {"on": true}}))
//!     .expect("object envelope");
//!
//! let outcome = service
//!     .publish(&target, &envelope, Some(TenantScope::user("alice@example.com")))
//!     .await;
//! assert!(outcome.success);
//!
//! service.shutdown().await;
//! # Ok::<(), device_bridge::BridgeError>(())
//! # });
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod observability;
pub mod pool;
pub mod service;
pub mod testing;
pub mod transport;

pub use collaborators::{
    AssistantBrokerConfig, AssistantStore, Identity, IdentityResolver, SecretCodec, SessionState,
};
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, BridgeResult};
pub use pool::{ConnectionKey, ConnectionRegistry, OutboundEnvelope, TenantScope};
pub use service::{BridgeService, BrokerTarget, PublishOutcome, SessionDisconnect, StartedSession};
pub use transport::{BrokerAdapter, BrokerClient, ConnectError, LinkState, PublishError};
