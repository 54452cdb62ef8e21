//! Assistant-driven relay and collaborator handling


use device_bridge::testing::{
    AckBehavior, ConnectBehavior, MockAssistantStore, MockBrokerAdapter, MockIdentityResolver, MockSecretCodec,
};
use device_bridge::{AssistantBrokerConfig, BridgeError, BridgeService, SessionState, TenantScope};
use serde_json::json;
use std::sync::Arc;
use test_helpers::{envelope, mock_service, target};

fn lamp_assistant() -> AssistantBrokerConfig {
    AssistantBrokerConfig {
        owner_user_id: Some("user-1".to_string()),
        host: Some("localhost".to_string()),
        port: Some(1883),
        topic: Some("devices/lamp".to_string()),
        username: Some("device".to_string()),
        password: Some("secret".to_string()),
        encrypted_api_key: Some("enc:sk-test".to_string()),
    }
}

fn service_with(
    adapter: &MockBrokerAdapter,
    store: Arc<MockAssistantStore>,
) -> BridgeService {
    mock_service(adapter)
        .with_assistant_store(store)
        .with_identity_resolver(Arc::new(
            MockIdentityResolver::new()
                .with_identity("token-alice", "user-1", Some("alice@example.com"))
                .with_identity("token-mallory", "user-9", Some("mallory@example.com"))
                .rejecting("token-expired"),
        ))
        .with_secret_codec(Arc::new(MockSecretCodec))
}

#[tokio::test]
async fn test_relay_publishes_value_field_scoped_to_user_session() {
    // Arrange
    let adapter = MockBrokerAdapter::new();
    let store = Arc::new(MockAssistantStore::new().with_assistant("lamp", lamp_assistant()));
    let service = service_with(&adapter, Arc::clone(&store));

    // Act
    let outcome = service
        .relay_for_assistant(
            "lamp",
            &envelope(json!({
                "response": "Turning it on",
                "values": {"MQTT_value": {"on": true}}
            })),
            Some("token-alice"),
            Some("s1"),
        )
        .await
        .unwrap()
        .expect("reply carries values");

    // Assert
    assert!(outcome.success);
    assert_eq!(
        adapter.published(),
        vec![("devices/lamp".to_string(), br#"{"on": true}"#.to_vec())]
    );
    let params = adapter.started_params();
    assert_eq!(params[0].client_id, "alice@example.com_s1");
    assert_eq!(
        params[0].credentials.as_ref().map(|c| c.username.as_str()),
        Some("device")
    );
    assert!(store.session("s1").unwrap().mqtt_connected);

    // The connection is scoped so session teardown reaches it
    assert_eq!(service.disconnect_session("s1").await.closed_count, 1);
}

#[tokio::test]
async fn test_relay_records_failed_publish_on_session() {
    let adapter = MockBrokerAdapter::new();
    adapter.set_ack_behavior(AckBehavior::Reject("QuotaExceeded".to_string()));
    let store = Arc::new(
        MockAssistantStore::new()
            .with_assistant("lamp", lamp_assistant())
            .with_session(
                "s1",
                SessionState {
                    mqtt_connected: true,
                    ..SessionState::fresh()
                },
            ),
    );
    let service = service_with(&adapter, Arc::clone(&store));

    let outcome = service
        .relay_for_assistant("lamp", &envelope(json!({"value": {"MQTT_value": 1}})), None, Some("s1"))
        .await
        .unwrap()
        .expect("reply carries a value");

    assert!(!outcome.success);
    assert!(outcome.message.unwrap().contains("QuotaExceeded"));
    assert!(!store.session("s1").unwrap().mqtt_connected);
}

#[tokio::test]
async fn test_relay_falls_back_to_value() {
    let adapter = MockBrokerAdapter::new();
    let store = Arc::new(MockAssistantStore::new().with_assistant("lamp", lamp_assistant()));
    let service = service_with(&adapter, store);

    let outcome = service
        .relay_for_assistant(
            "lamp",
            &envelope(json!({"response": "Dimming", "value": {"MQTT_value": {"level": 30}}})),
            Some("token-alice"),
            None,
        )
        .await
        .unwrap();

    assert!(outcome.is_some_and(|o| o.success));
    assert_eq!(
        adapter.published(),
        vec![("devices/lamp".to_string(), br#"{"level": 30}"#.to_vec())]
    );
}

#[tokio::test]
async fn test_relay_without_values_skips_publish_and_keeps_session() {
    // Arrange: the session's link was last seen down
    let adapter = MockBrokerAdapter::new();
    let stale = SessionState {
        mqtt_connected: false,
        ..SessionState::fresh()
    };
    let store = Arc::new(
        MockAssistantStore::new()
            .with_assistant("lamp", lamp_assistant())
            .with_session("s1", stale.clone()),
    );
    let service = service_with(&adapter, Arc::clone(&store));

    // Act
    let outcome = service
        .relay_for_assistant(
            "lamp",
            &envelope(json!({"response": "Just chatting", "MQTT_value": {"on": true}})),
            Some("token-alice"),
            Some("s1"),
        )
        .await
        .unwrap();

    // Assert
    assert!(outcome.is_none());
    assert_eq!(adapter.start_count(), 0);
    assert!(adapter.published().is_empty());
    assert_eq!(store.session("s1").unwrap(), stale);
}

#[tokio::test]
async fn test_start_session_records_reachable_broker() {
    // Arrange
    let adapter = MockBrokerAdapter::new();
    let store = Arc::new(MockAssistantStore::new().with_assistant("lamp", lamp_assistant()));
    let service = service_with(&adapter, Arc::clone(&store));

    // Act
    let started = service.start_session("lamp", "token-alice").await.unwrap();

    // Assert
    assert!(started.state.mqtt_connected);
    assert_eq!(store.session(&started.session_id), Some(started.state.clone()));
    let params = adapter.started_params();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].client_id, format!("alice@example.com_{}", started.session_id));
    assert_eq!(
        params[0].credentials.as_ref().map(|c| c.username.as_str()),
        Some("device")
    );

    // The first relay of the session reuses the tested link
    service
        .relay_for_assistant(
            "lamp",
            &envelope(json!({"values": {"MQTT_value": "on"}})),
            Some("token-alice"),
            Some(&started.session_id),
        )
        .await
        .unwrap();
    assert_eq!(adapter.start_count(), 1);
}

#[tokio::test]
async fn test_start_session_records_unreachable_broker() {
    let adapter =
        MockBrokerAdapter::with_behavior(ConnectBehavior::Refuse("NotAuthorized".to_string()));
    let store = Arc::new(MockAssistantStore::new().with_assistant("lamp", lamp_assistant()));
    let service = service_with(&adapter, Arc::clone(&store));

    let started = service.start_session("lamp", "token-alice").await.unwrap();

    assert!(!started.state.mqtt_connected);
    assert!(!store.session(&started.session_id).unwrap().mqtt_connected);
    assert!(service.registry().is_empty().await);
}

#[tokio::test]
async fn test_start_session_requires_owner() {
    let adapter = MockBrokerAdapter::new();
    let store = Arc::new(MockAssistantStore::new().with_assistant("lamp", lamp_assistant()));
    let service = service_with(&adapter, store);

    let foreign = service.start_session("lamp", "token-mallory").await;
    let unknown = service.start_session("lamp", "token-nobody").await;

    assert!(matches!(foreign, Err(BridgeError::AuthenticationFailure { .. })));
    assert!(matches!(unknown, Err(BridgeError::AuthenticationFailure { .. })));
    assert_eq!(adapter.start_count(), 0);
}

#[tokio::test]
async fn test_relay_without_topic_is_configuration_incomplete() {
    let adapter = MockBrokerAdapter::new();
    let store = Arc::new(MockAssistantStore::new().with_assistant(
        "lamp",
        AssistantBrokerConfig {
            topic: None,
            ..lamp_assistant()
        },
    ));
    let service = service_with(&adapter, store);

    let result = service
        .relay_for_assistant("lamp", &envelope(json!({"values": {"MQTT_value": 1}})), None, None)
        .await;

    assert!(matches!(
        result,
        Err(BridgeError::ConfigurationIncomplete { ref missing }) if missing == "topic"
    ));
    assert_eq!(adapter.start_count(), 0);
}

#[tokio::test]
async fn test_relay_rejects_other_users_and_bad_tokens() {
    let adapter = MockBrokerAdapter::new();
    let store = Arc::new(MockAssistantStore::new().with_assistant("lamp", lamp_assistant()));
    let service = service_with(&adapter, store);
    let body = envelope(json!({"values": {"MQTT_value": 1}}));

    let foreign = service
        .relay_for_assistant("lamp", &body, Some("token-mallory"), None)
        .await;
    let expired = service
        .relay_for_assistant("lamp", &body, Some("token-expired"), None)
        .await;

    assert!(matches!(foreign, Err(BridgeError::AuthenticationFailure { .. })));
    assert!(matches!(expired, Err(BridgeError::AuthenticationFailure { .. })));
    assert_eq!(adapter.start_count(), 0);
}

#[tokio::test]
async fn test_assistant_api_key_decrypts() {
    let adapter = MockBrokerAdapter::new();
    let store = Arc::new(
        MockAssistantStore::new()
            .with_assistant("lamp", lamp_assistant())
            .with_assistant(
                "broken",
                AssistantBrokerConfig {
                    encrypted_api_key: Some("plaintext-oops".to_string()),
                    ..lamp_assistant()
                },
            )
            .with_assistant(
                "keyless",
                AssistantBrokerConfig {
                    encrypted_api_key: None,
                    ..lamp_assistant()
                },
            ),
    );
    let service = service_with(&adapter, store);

    assert_eq!(service.assistant_api_key("lamp").await.unwrap(), "sk-test");
    assert!(matches!(
        service.assistant_api_key("broken").await,
        Err(BridgeError::CredentialDecryptFailure { .. })
    ));
    assert!(matches!(
        service.assistant_api_key("keyless").await,
        Err(BridgeError::ConfigurationIncomplete { .. })
    ));
}

#[tokio::test]
async fn test_logout_closes_callers_connections() {
    // Arrange
    let adapter = MockBrokerAdapter::new();
    let store = Arc::new(MockAssistantStore::new());
    let service = service_with(&adapter, store);
    let lamp = target("devices/lamp");
    for scope in [
        Some(TenantScope::user("alice@example.com")),
        Some(TenantScope::session(Some("alice@example.com"), "s1")),
        None,
    ] {
        assert!(service.publish(&lamp, &envelope(json!({"a": 1})), scope).await.success);
    }

    // Act
    let closed = service.logout("token-alice").await.unwrap();

    // Assert
    assert_eq!(closed, 2);
    assert_eq!(service.registry().len().await, 1);
    assert!(matches!(
        service.logout("token-unknown").await,
        Err(BridgeError::AuthenticationFailure { .. })
    ));
}

#[tokio::test]
async fn test_reset_conversation_keeps_link_status() {
    let adapter = MockBrokerAdapter::new();
    let original = SessionState {
        thread_id: "thread-1".to_string(),
        last_response_id: Some("resp-7".to_string()),
        mqtt_connected: true,
    };
    let store = Arc::new(MockAssistantStore::new().with_session("s1", original));
    let service = service_with(&adapter, Arc::clone(&store));

    let state = service.reset_conversation("s1").await.unwrap();

    assert_ne!(state.thread_id, "thread-1");
    assert!(state.last_response_id.is_none());
    assert!(state.mqtt_connected);
    assert_eq!(store.session("s1").unwrap(), state);
}

#[tokio::test]
async fn test_missing_collaborators_are_reported() {
    let adapter = MockBrokerAdapter::new();
    let service = mock_service(&adapter);

    let result = service
        .relay_for_assistant("lamp", &envelope(json!({})), None, None)
        .await;

    assert!(matches!(result, Err(BridgeError::Collaborator { .. })));
}
