//! Persistent, multi-tenant connection pool
//!
//! One long-lived broker connection per (broker, credentials, user, session)
//! tuple, shared by every request that resolves to the same
//! [`ConnectionKey`].
//!
//! - [`key`] - Connection identity and client id derivation
//! - [`registry`] - Single-flight creation, reuse, replacement and removal
//! - [`connect`] - Deadline-bounded connect attempts
//! - [`publisher`] - Envelope extraction and confirmed publish
//! - [`lifecycle`] - Teardown by user, by session, and at shutdown

pub mod connect;
pub mod key;
pub mod lifecycle;
pub mod managed;
pub mod publisher;
pub mod registry;

pub use connect::{AttemptState, ConnectOrchestrator, ConnectSettings};
pub use key::{ConnectionKey, TenantScope};
pub use lifecycle::LifecycleController;
pub use managed::ManagedConnection;
pub use publisher::{OutboundContent, OutboundEnvelope, Publisher};
pub use registry::ConnectionRegistry;
