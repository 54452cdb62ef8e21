use super::registry::ConnectionRegistry;
use crate::lifecycle_span;
use std::sync::Arc;
use tracing::{info, Instrument};

/// Selective and total teardown of pooled connections
///
/// Safe to call while traffic is flowing: removal and disconnection happen
/// under the registry lock, so no entry outlives its teardown.
pub struct LifecycleController {
    registry: Arc<ConnectionRegistry>,
}

impl LifecycleController {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Close every connection scoped to `email`, with or without a session
    pub async fn disconnect_for_user(&self, email: &str) -> usize {
        let closed = self
            .registry
            .remove_if(|key| key.belongs_to_user(email))
            .instrument(lifecycle_span!(scope = "user"))
            .await;
        info!(user_email = %email, closed, "Closed user connections");
        closed
    }

    pub async fn disconnect_for_session(&self, session_id: &str) -> usize {
        let closed = self
            .registry
            .remove_if(|key| key.belongs_to_session(session_id))
            .instrument(lifecycle_span!(scope = "session"))
            .await;
        info!(session_id = %session_id, closed, "Closed session connections");
        closed
    }

    /// Drain the registry
    ///
    /// The pool stays usable afterwards; a later publish connects afresh.
    pub async fn shutdown(&self) -> usize {
        let closed = self
            .registry
            .drain_all()
            .instrument(lifecycle_span!(scope = "all"))
            .await;
        info!(closed, "Connection pool shut down");
        closed
    }
}
