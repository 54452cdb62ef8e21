use super::key::ConnectionKey;
use crate::transport::{BrokerClient, LinkState, PublishError};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// A live, registered broker connection
///
/// Owns exactly one client handle. Only the connect orchestrator creates
/// these; the registry owns them from then on.
pub struct ManagedConnection {
    key: ConnectionKey,
    client_id: String,
    created_at: DateTime<Utc>,
    last_live_millis: AtomicI64,
    client: Box<dyn BrokerClient>,
}

impl ManagedConnection {
    pub(crate) fn new(key: ConnectionKey, client: Box<dyn BrokerClient>) -> Self {
        let now = Utc::now();
        Self {
            key,
            client_id: client.client_id().to_string(),
            created_at: now,
            last_live_millis: AtomicI64::new(now.timestamp_millis()),
            client,
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_known_live_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_live_millis.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.created_at)
    }

    pub fn link_state(&self) -> LinkState {
        self.client.link_state()
    }

    /// Liveness check; a passing check refreshes `last_known_live_at`
    pub fn is_alive(&self) -> bool {
        let alive = self.client.is_connected();
        if alive {
            self.last_live_millis
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
        alive
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        ack_timeout: Duration,
    ) -> Result<(), PublishError> {
        self.client.publish(topic, payload, ack_timeout).await
    }

    pub async fn disconnect(&self, grace: Duration) {
        self.client.disconnect(grace).await;
    }

    pub fn abort(&self) {
        self.client.abort();
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("key", &self.key)
            .field("client_id", &self.client_id)
            .field("created_at", &self.created_at)
            .field("link_state", &self.client.link_state())
            .finish()
    }
}
