//! Interfaces to the systems around the bridge
//!
//! Identity resolution, assistant persistence and secret storage live
//! elsewhere; the bridge only depends on these traits.

use crate::error::BridgeError;
use crate::service::BrokerTarget;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resolved caller identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

/// Resolves a bearer credential to an identity
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `Ok(None)` for an unknown but well-formed credential; a malformed or
    /// expired one is an `AuthenticationFailure`.
    async fn resolve(&self, bearer: &str) -> Result<Option<Identity>, BridgeError>;
}

/// Broker settings stored with an assistant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantBrokerConfig {
    pub owner_user_id: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub topic: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// LLM provider key, encrypted with the deployment's [`SecretCodec`]
    pub encrypted_api_key: Option<String>,
}

impl AssistantBrokerConfig {
    /// Publish target, or `ConfigurationIncomplete` naming the missing field
    pub fn target(&self) -> Result<BrokerTarget, BridgeError> {
        let host = present(&self.host).ok_or_else(|| BridgeError::configuration_incomplete("host"))?;
        let topic =
            present(&self.topic).ok_or_else(|| BridgeError::configuration_incomplete("topic"))?;

        Ok(BrokerTarget::new(host, self.port.unwrap_or(1883), topic)?
            .with_credentials(self.username.as_deref(), self.password.as_deref()))
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Conversation state kept per session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub thread_id: String,
    pub last_response_id: Option<String>,
    /// Outcome of the most recent publish for this session
    pub mqtt_connected: bool,
}

impl SessionState {
    /// A new conversation thread with no prior response
    pub fn fresh() -> Self {
        Self {
            thread_id: Uuid::new_v4().simple().to_string(),
            last_response_id: None,
            mqtt_connected: false,
        }
    }
}

/// Assistant and session persistence
#[async_trait]
pub trait AssistantStore: Send + Sync {
    async fn broker_config(&self, assistant_id: &str) -> Result<AssistantBrokerConfig, BridgeError>;

    async fn session_state(&self, session_id: &str) -> Result<Option<SessionState>, BridgeError>;

    async fn record_session_state(
        &self,
        session_id: &str,
        state: SessionState,
    ) -> Result<(), BridgeError>;
}

/// Symmetric encryption of stored secrets
pub trait SecretCodec: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, BridgeError>;

    /// Fails with `CredentialDecryptFailure`
    fn decrypt(&self, ciphertext: &str) -> Result<String, BridgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_requires_host_and_topic() {
        let config = AssistantBrokerConfig {
            host: Some("broker.local".to_string()),
            ..Default::default()
        };
        let err = config.target().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ConfigurationIncomplete { ref missing } if missing == "topic"
        ));

        let config = AssistantBrokerConfig {
            host: Some("   ".to_string()),
            topic: Some("devices/lamp".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.target(),
            Err(BridgeError::ConfigurationIncomplete { ref missing }) if missing == "host"
        ));
    }

    #[test]
    fn test_target_defaults_port() {
        let config = AssistantBrokerConfig {
            host: Some("broker.local".to_string()),
            topic: Some("devices/lamp".to_string()),
            username: Some("device".to_string()),
            password: Some("pw".to_string()),
            ..Default::default()
        };

        let target = config.target().unwrap();
        assert_eq!(target.port(), 1883);
        assert_eq!(target.topic(), "devices/lamp");
        assert_eq!(target.username(), Some("device"));
    }

    #[test]
    fn test_fresh_session_state() {
        let first = SessionState::fresh();
        let second = SessionState::fresh();

        assert_ne!(first.thread_id, second.thread_id);
        assert!(first.last_response_id.is_none());
        assert!(!first.mqtt_connected);
    }
}
