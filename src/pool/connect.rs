//! Connect orchestration
//!
//! One attempt walks `Idle -> Connecting -> {Live, Failed, TimedOut}` and
//! never retries. The handshake wait is capped by a poll ceiling nested inside
//! a hard deadline that also covers waiting for a connect permit. Whatever the
//! attempt started is stopped on every path that does not end in `Live`,
//! including the caller's future being dropped.

use super::key::ConnectionKey;
use super::managed::ManagedConnection;
use crate::config::BridgeConfig;
use crate::connection_span;
use crate::observability::MetricsCollector;
use crate::transport::{BrokerAdapter, ClientParams, ConnectError, Credentials, LinkState};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn, Instrument};

/// Timing and client parameters for connect attempts
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    /// Ceiling on waiting for the handshake once the client is started
    pub poll_ceiling: Duration,
    /// Hard deadline for the whole attempt
    pub deadline: Duration,
    pub keep_alive: Duration,
    pub request_capacity: usize,
    pub client_id_prefix: String,
    /// Connect attempts allowed to run at once
    pub max_concurrent: usize,
}

impl ConnectSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            poll_ceiling: config.timeouts.connect_poll(),
            deadline: config.timeouts.connect_deadline(),
            keep_alive: Duration::from_secs(config.pool.keep_alive_secs),
            request_capacity: config.pool.request_capacity,
            client_id_prefix: config.bridge.client_id_prefix.clone(),
            max_concurrent: config.pool.max_concurrent_connects,
        }
    }
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

/// Progress of a single connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Connecting,
    Live,
    Failed,
    TimedOut,
}

impl AttemptState {
    /// Outcome once the handshake wait has ended with `link` observed
    pub fn settle(link: &LinkState) -> Self {
        match link {
            LinkState::Connected => AttemptState::Live,
            LinkState::Connecting => AttemptState::TimedOut,
            LinkState::Refused(_) | LinkState::Disconnected(_) => AttemptState::Failed,
        }
    }

    /// Only live attempts may enter the registry
    pub fn is_admissible(&self) -> bool {
        matches!(self, AttemptState::Live)
    }
}

/// Drives connect attempts through a bounded pool of permits
#[derive(Clone)]
pub struct ConnectOrchestrator {
    adapter: Arc<dyn BrokerAdapter>,
    permits: Arc<Semaphore>,
    settings: ConnectSettings,
    metrics: Arc<MetricsCollector>,
}

impl ConnectOrchestrator {
    pub fn new(
        adapter: Arc<dyn BrokerAdapter>,
        settings: ConnectSettings,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            adapter,
            settings,
            metrics,
        }
    }

    pub fn settings(&self) -> &ConnectSettings {
        &self.settings
    }

    /// A self-contained attempt, suitable for running on its own task
    pub fn connect(
        &self,
        key: ConnectionKey,
        credentials: Option<Credentials>,
    ) -> impl Future<Output = Result<ManagedConnection, ConnectError>> + Send + 'static {
        let orchestrator = self.clone();
        let span = connection_span!(endpoint = %key.endpoint(), key = %key);
        async move { orchestrator.attempt(key, credentials).await }.instrument(span)
    }

    async fn attempt(
        &self,
        key: ConnectionKey,
        credentials: Option<Credentials>,
    ) -> Result<ManagedConnection, ConnectError> {
        self.metrics.connect_attempt();
        let started = Instant::now();
        let endpoint = key.endpoint();

        let result = match tokio::time::timeout(self.settings.deadline, self.drive(key, credentials))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout {
                endpoint: endpoint.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        };

        match &result {
            Ok(connection) => {
                self.metrics.connection_established();
                info!(
                    endpoint = %endpoint,
                    client_id = %connection.client_id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Broker connection established"
                );
            }
            Err(e) => {
                self.metrics.connect_failed(e.is_timeout());
                warn!(endpoint = %endpoint, error = %e, "Broker connection failed");
            }
        }
        result
    }

    async fn drive(
        &self,
        key: ConnectionKey,
        credentials: Option<Credentials>,
    ) -> Result<ManagedConnection, ConnectError> {
        let endpoint = key.endpoint();
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ConnectError::Cancelled {
                endpoint: endpoint.clone(),
            })?;

        let mut attempt = AttemptState::Idle;
        let params = ClientParams {
            client_id: key.client_id(&self.settings.client_id_prefix),
            host: key.host().to_string(),
            port: key.port(),
            credentials,
            keep_alive: self.settings.keep_alive,
            request_capacity: self.settings.request_capacity,
        };
        debug!(client_id = %params.client_id, state = ?attempt, "Starting broker client");

        // If this future is dropped past this point the client goes with it,
        // and dropping a client stops its network loop.
        let client = self.adapter.start(params)?;
        attempt = AttemptState::Connecting;
        debug!(state = ?attempt, "Waiting for handshake");

        let mut link = client.subscribe_state();
        let observed = match tokio::time::timeout(
            self.settings.poll_ceiling,
            link.wait_for(LinkState::is_settled),
        )
        .await
        {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_)) => LinkState::Disconnected("network loop stopped".to_string()),
            Err(_) => LinkState::Connecting,
        };

        attempt = AttemptState::settle(&observed);
        debug!(state = ?attempt, link = ?observed, "Handshake wait ended");
        if attempt.is_admissible() {
            return Ok(ManagedConnection::new(key, client));
        }

        client.abort();
        Err(match observed {
            LinkState::Refused(reason) => ConnectError::Refused { endpoint, reason },
            LinkState::Disconnected(reason) => ConnectError::Network { endpoint, reason },
            LinkState::Connecting | LinkState::Connected => ConnectError::Timeout {
                endpoint,
                elapsed_ms: self.settings.poll_ceiling.as_millis() as u64,
            },
        })
    }
}
