//! Caller-facing bridge service
//!
//! Owns one connection registry and wires the publisher, lifecycle controller
//! and collaborators around it. Request handlers hold an `Arc<BridgeService>`.

use crate::collaborators::{
    AssistantBrokerConfig, AssistantStore, Identity, IdentityResolver, SecretCodec, SessionState,
};
use crate::config::{parse_broker_url, BridgeConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::observability::{MetricsCollector, MetricsSnapshot};
use crate::pool::{
    ConnectOrchestrator, ConnectSettings, ConnectionKey, ConnectionRegistry, LifecycleController,
    OutboundEnvelope, Publisher, TenantScope,
};
use crate::transport::mqtt::RumqttAdapter;
use crate::transport::{BrokerAdapter, Credentials};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Where and as whom to publish
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    host: String,
    port: u16,
    topic: String,
    username: Option<String>,
    password: Option<String>,
}

impl BrokerTarget {
    pub fn new(host: &str, port: u16, topic: &str) -> BridgeResult<Self> {
        let host = host.trim();
        let topic = topic.trim();
        if host.is_empty() {
            return Err(BridgeError::configuration_incomplete("host"));
        }
        if port == 0 {
            return Err(BridgeError::configuration_incomplete("port"));
        }
        if topic.is_empty() {
            return Err(BridgeError::configuration_incomplete("topic"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            topic: topic.to_string(),
            username: None,
            password: None,
        })
    }

    /// Target from an `mqtt://host:port` URL
    pub fn from_url(url: &str, topic: &str) -> BridgeResult<Self> {
        let (host, port) = parse_broker_url(url)?;
        Self::new(&host, port, topic)
    }

    pub fn with_credentials(mut self, username: Option<&str>, password: Option<&str>) -> Self {
        self.username = username.map(str::to_string);
        self.password = password.map(str::to_string);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(self.username.as_deref(), self.password.as_deref())
    }

    pub fn key(&self, tenant: Option<TenantScope>) -> ConnectionKey {
        ConnectionKey::resolve(&self.host, self.port, self.username.as_deref(), tenant)
    }
}

impl fmt::Debug for BrokerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("topic", &self.topic)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Result of a publish request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    pub success: bool,
    /// Sanitized failure description
    pub message: Option<String>,
}

impl PublishOutcome {
    fn delivered() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    fn failed(error: &BridgeError) -> Self {
        Self {
            success: false,
            message: Some(error.user_message()),
        }
    }
}

/// Result of tearing down a session's connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionDisconnect {
    pub success: bool,
    pub closed_count: usize,
}

/// A session opened by [`BridgeService::start_session`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartedSession {
    pub session_id: String,
    pub state: SessionState,
}

/// The bridge: pooled publishing plus teardown
pub struct BridgeService {
    config: BridgeConfig,
    registry: Arc<ConnectionRegistry>,
    publisher: Publisher,
    lifecycle: LifecycleController,
    metrics: Arc<MetricsCollector>,
    identity: Option<Arc<dyn IdentityResolver>>,
    store: Option<Arc<dyn AssistantStore>>,
    codec: Option<Arc<dyn SecretCodec>>,
}

impl BridgeService {
    pub fn new(config: BridgeConfig, adapter: Arc<dyn BrokerAdapter>) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let registry = Arc::new(ConnectionRegistry::new(
            config.timeouts.disconnect_grace(),
            Arc::clone(&metrics),
        ));
        let orchestrator = ConnectOrchestrator::new(
            adapter,
            ConnectSettings::from_config(&config),
            Arc::clone(&metrics),
        );
        let publisher = Publisher::new(
            Arc::clone(&registry),
            orchestrator,
            config.bridge.value_field.clone(),
            config.timeouts.publish_ack(),
            Arc::clone(&metrics),
        );
        let lifecycle = LifecycleController::new(Arc::clone(&registry));

        Self {
            config,
            registry,
            publisher,
            lifecycle,
            metrics,
            identity: None,
            store: None,
            codec: None,
        }
    }

    /// Service backed by real `rumqttc` clients
    pub fn with_rumqttc(config: BridgeConfig) -> Self {
        Self::new(config, Arc::new(RumqttAdapter))
    }

    pub fn with_identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identity = Some(resolver);
        self
    }

    pub fn with_assistant_store(mut self, store: Arc<dyn AssistantStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_secret_codec(mut self, codec: Arc<dyn SecretCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Whether a pooled connection can be obtained for these parameters
    pub async fn test_connection(
        &self,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        tenant: Option<TenantScope>,
    ) -> bool {
        let key = ConnectionKey::resolve(host, port, username, tenant);
        let credentials = Credentials::from_parts(username, password);

        match self.publisher.connection(&key, credentials).await {
            Ok(connection) => connection.is_alive(),
            Err(e) => {
                warn!(key = %key, error = %e, "Connection test failed");
                false
            }
        }
    }

    pub async fn publish(
        &self,
        target: &BrokerTarget,
        envelope: &OutboundEnvelope,
        tenant: Option<TenantScope>,
    ) -> PublishOutcome {
        let key = target.key(tenant);
        match self
            .publisher
            .try_publish(&key, target.credentials(), target.topic(), envelope)
            .await
        {
            Ok(()) => PublishOutcome::delivered(),
            Err(e) => {
                warn!(key = %key, topic = %target.topic(), error = %e.user_message(), "Publish failed");
                PublishOutcome::failed(&e)
            }
        }
    }

    pub async fn disconnect_session(&self, session_id: &str) -> SessionDisconnect {
        let closed_count = self.lifecycle.disconnect_for_session(session_id).await;
        SessionDisconnect {
            success: true,
            closed_count,
        }
    }

    pub async fn disconnect_user(&self, email: &str) -> usize {
        self.lifecycle.disconnect_for_user(email).await
    }

    /// Close every connection of the caller behind `bearer`
    pub async fn logout(&self, bearer: &str) -> BridgeResult<usize> {
        let identity = self
            .identity_resolver()?
            .resolve(bearer)
            .await?
            .ok_or_else(|| BridgeError::authentication_failure("unknown credential"))?;
        let email = identity
            .email
            .ok_or_else(|| BridgeError::authentication_failure("identity has no email"))?;

        Ok(self.disconnect_user(&email).await)
    }

    /// Disconnect and forget every pooled connection
    ///
    /// The service keeps working: the next publish for any key connects anew.
    pub async fn shutdown(&self) -> usize {
        self.lifecycle.shutdown().await
    }

    /// Open a session against an assistant's broker
    ///
    /// Checks that the caller owns the assistant, tests the broker link under
    /// the new session's scope and records the result on the session.
    pub async fn start_session(
        &self,
        assistant_id: &str,
        bearer: &str,
    ) -> BridgeResult<StartedSession> {
        let store = self.assistant_store()?;
        let identity = self
            .identity_resolver()?
            .resolve(bearer)
            .await?
            .ok_or_else(|| BridgeError::authentication_failure("unknown credential"))?;

        let broker = store.broker_config(assistant_id).await?;
        ensure_owner(&identity, &broker, assistant_id)?;
        let target = broker.target()?;

        let session_id = Uuid::new_v4().to_string();
        let tenant = TenantScope::new(identity.email.as_deref(), Some(&session_id));
        let mqtt_connected = self
            .test_connection(
                target.host(),
                target.port(),
                target.username(),
                target.password(),
                Some(tenant),
            )
            .await;

        let state = SessionState {
            mqtt_connected,
            ..SessionState::fresh()
        };
        store.record_session_state(&session_id, state.clone()).await?;

        info!(
            assistant_id = %assistant_id,
            session_id = %session_id,
            mqtt_connected,
            "Session started"
        );
        Ok(StartedSession { session_id, state })
    }

    /// Publish an assistant's reply to the broker configured for it
    ///
    /// The device payload is taken from the reply's `values`, else its `value`.
    /// A reply with neither publishes nothing and leaves the session as it was.
    ///
    /// A bearer credential, when given, scopes the connection to the caller's
    /// email; without one the request is anonymous (e.g. a shared session
    /// link). The outcome is recorded on the session when one is named.
    pub async fn relay_for_assistant(
        &self,
        assistant_id: &str,
        reply: &OutboundEnvelope,
        bearer: Option<&str>,
        session_id: Option<&str>,
    ) -> BridgeResult<Option<PublishOutcome>> {
        let store = self.assistant_store()?;

        let identity = match bearer {
            Some(bearer) => self.identity_resolver()?.resolve(bearer).await?,
            None => None,
        };

        let broker = store.broker_config(assistant_id).await?;
        if let Some(identity) = &identity {
            ensure_owner(identity, &broker, assistant_id)?;
        }
        let target = broker.target()?;

        let Some(envelope) = OutboundEnvelope::from_reply(reply, &self.config.bridge.value_field)
        else {
            warn!(assistant_id = %assistant_id, "Assistant reply has no device values, skipping publish");
            return Ok(None);
        };

        let email = identity.as_ref().and_then(|i| i.email.as_deref());
        let tenant = TenantScope::new(email, session_id);
        info!(
            assistant_id = %assistant_id,
            endpoint = %format!("{}:{}", target.host(), target.port()),
            topic = %target.topic(),
            "Relaying assistant output"
        );
        let outcome = self.publish(&target, &envelope, Some(tenant)).await;

        if let Some(session_id) = session_id {
            let mut state = store
                .session_state(session_id)
                .await?
                .unwrap_or_else(SessionState::fresh);
            state.mqtt_connected = outcome.success;
            store.record_session_state(session_id, state).await?;
        }

        Ok(Some(outcome))
    }

    /// Start a new conversation thread for a session, keeping its link status
    pub async fn reset_conversation(&self, session_id: &str) -> BridgeResult<SessionState> {
        let store = self.assistant_store()?;
        let previous = store.session_state(session_id).await?;

        let mut state = SessionState::fresh();
        state.mqtt_connected = previous.map(|p| p.mqtt_connected).unwrap_or(false);
        store.record_session_state(session_id, state.clone()).await?;

        info!(session_id = %session_id, thread_id = %state.thread_id, "Conversation reset");
        Ok(state)
    }

    /// Decrypted LLM provider key of an assistant
    pub async fn assistant_api_key(&self, assistant_id: &str) -> BridgeResult<String> {
        let store = self.assistant_store()?;
        let codec = self
            .codec
            .as_ref()
            .ok_or_else(|| BridgeError::collaborator("no secret codec configured"))?;

        let encrypted = store
            .broker_config(assistant_id)
            .await?
            .encrypted_api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| BridgeError::configuration_incomplete("api key"))?;

        let api_key = codec.decrypt(&encrypted).map_err(|e| match e {
            BridgeError::CredentialDecryptFailure { .. } => e,
            other => BridgeError::credential_decrypt_failure(other.to_string()),
        })?;
        if api_key.is_empty() {
            return Err(BridgeError::credential_decrypt_failure("decrypted key is empty"));
        }
        Ok(api_key)
    }

    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn identity_resolver(&self) -> BridgeResult<&Arc<dyn IdentityResolver>> {
        self.identity
            .as_ref()
            .ok_or_else(|| BridgeError::collaborator("no identity resolver configured"))
    }

    fn assistant_store(&self) -> BridgeResult<&Arc<dyn AssistantStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| BridgeError::collaborator("no assistant store configured"))
    }
}

fn ensure_owner(
    identity: &Identity,
    broker: &AssistantBrokerConfig,
    assistant_id: &str,
) -> BridgeResult<()> {
    match &broker.owner_user_id {
        Some(owner) if owner != &identity.user_id => Err(BridgeError::authentication_failure(
            format!("user {} may not use assistant {assistant_id}", identity.user_id),
        )),
        _ => Ok(()),
    }
}
