//! Teardown by user, by session, and at shutdown


use device_bridge::testing::{ConnectBehavior, MockBrokerAdapter};
use device_bridge::{BridgeService, ConnectionKey, TenantScope};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{envelope, mock_service, settle, target};

async fn open(service: &BridgeService, scope: Option<TenantScope>) {
    let outcome = service
        .publish(&target("devices/lamp"), &envelope(json!({"on": true})), scope)
        .await;
    assert!(outcome.success, "publish should succeed: {:?}", outcome.message);
}

fn scoped_key(scope: Option<TenantScope>) -> ConnectionKey {
    target("devices/lamp").key(scope)
}

#[tokio::test]
async fn test_disconnect_user_removes_all_and_only_that_user() {
    // Arrange
    let adapter = MockBrokerAdapter::new();
    let service = mock_service(&adapter);
    open(&service, Some(TenantScope::user("alice@example.com"))).await;
    open(&service, Some(TenantScope::session(Some("alice@example.com"), "s1"))).await;
    open(&service, Some(TenantScope::user("bob@example.com"))).await;
    open(&service, None).await;

    // Act
    let closed = service.disconnect_user("alice@example.com").await;

    // Assert
    assert_eq!(closed, 2);
    assert_eq!(adapter.disconnect_count(), 2);
    let remaining = service.registry().keys().await;
    assert_eq!(remaining.len(), 2);
    assert!(remaining.contains(&scoped_key(Some(TenantScope::user("bob@example.com")))));
    assert!(remaining.contains(&scoped_key(None)));
}

#[tokio::test]
async fn test_disconnect_session_leaves_other_sessions() {
    // Arrange
    let adapter = MockBrokerAdapter::new();
    let service = mock_service(&adapter);
    let s1 = TenantScope::session(Some("alice@example.com"), "s1");
    let s2 = TenantScope::session(Some("alice@example.com"), "s2");
    open(&service, Some(s1.clone())).await;
    open(&service, Some(s2.clone())).await;

    // Act
    let result = service.disconnect_session("s1").await;

    // Assert
    assert!(result.success);
    assert_eq!(result.closed_count, 1);
    assert!(!service.registry().contains(&scoped_key(Some(s1))).await);
    assert!(service.registry().contains(&scoped_key(Some(s2))).await);
}

#[tokio::test]
async fn test_disconnect_unknown_session_is_a_successful_noop() {
    let adapter = MockBrokerAdapter::new();
    let service = mock_service(&adapter);

    let result = service.disconnect_session("missing").await;

    assert!(result.success);
    assert_eq!(result.closed_count, 0);
}

#[tokio::test]
async fn test_reconnect_after_user_teardown() {
    // Arrange
    let adapter = MockBrokerAdapter::new();
    let service = mock_service(&adapter);
    let scope = Some(TenantScope::user("alice@example.com"));
    open(&service, scope.clone()).await;
    service.disconnect_user("alice@example.com").await;

    // Act
    open(&service, scope).await;

    // Assert: a fresh connection was created rather than a zombie reused
    assert_eq!(adapter.start_count(), 2);
    assert_eq!(service.registry().len().await, 1);
}

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    // Arrange: three live connections
    let adapter = MockBrokerAdapter::new();
    let service = mock_service(&adapter);
    open(&service, Some(TenantScope::user("a@example.com"))).await;
    open(&service, Some(TenantScope::user("b@example.com"))).await;
    open(&service, None).await;
    assert_eq!(service.registry().len().await, 3);

    // Act
    let closed = service.shutdown().await;
    settle().await;

    // Assert
    assert_eq!(closed, 3);
    assert_eq!(adapter.disconnect_count(), 3);
    assert_eq!(adapter.active_loops(), 0);
    assert!(service.registry().is_empty().await);
    assert_eq!(service.stats().connections.connections_closed, 3);

    // Draining again finds nothing left
    assert_eq!(service.shutdown().await, 0);
}

#[tokio::test]
async fn test_publish_after_shutdown_connects_again() {
    // Arrange
    let adapter = MockBrokerAdapter::new();
    let service = mock_service(&adapter);
    let alice = Some(TenantScope::user("a@example.com"));
    open(&service, alice.clone()).await;
    open(&service, Some(TenantScope::user("b@example.com"))).await;
    open(&service, None).await;
    service.shutdown().await;
    assert_eq!(adapter.start_count(), 3);

    // Act: same service, one of the drained keys
    let outcome = service
        .publish(&target("devices/lamp"), &envelope(json!({"on": false})), alice.clone())
        .await;

    // Assert
    assert!(outcome.success, "publish after shutdown failed: {:?}", outcome.message);
    assert_eq!(adapter.start_count(), 4);
    assert_eq!(service.registry().len().await, 1);
    assert!(service.registry().contains(&scoped_key(alice)).await);
}

#[tokio::test]
async fn test_teardown_during_connect_discards_new_connection() {
    // Arrange: a slow handshake for alice
    let adapter =
        MockBrokerAdapter::with_behavior(ConnectBehavior::SucceedAfter(Duration::from_millis(100)));
    let service = Arc::new(mock_service(&adapter));
    let pending = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .publish(
                    &target("devices/lamp"),
                    &envelope(json!({"on": true})),
                    Some(TenantScope::user("alice@example.com")),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Act: log alice out while her connection is being set up
    service.disconnect_user("alice@example.com").await;
    let outcome = pending.await.unwrap();
    settle().await;

    // Assert: no zombie entry and no running network loop
    assert!(!outcome.success);
    assert!(service.registry().is_empty().await);
    assert_eq!(adapter.active_loops(), 0);
}

#[tokio::test]
async fn test_session_reopened_during_teardown_never_shares_client_id() {
    // Arrange: a slow handshake for session s1
    let adapter =
        MockBrokerAdapter::with_behavior(ConnectBehavior::SucceedAfter(Duration::from_millis(100)));
    let service = Arc::new(mock_service(&adapter));
    let scope = Some(TenantScope::session(Some("a@x.io"), "s1"));
    let pending = {
        let service = Arc::clone(&service);
        let scope = scope.clone();
        tokio::spawn(async move {
            service
                .publish(&target("devices/lamp"), &envelope(json!({"on": true})), scope)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Act: end the session, then use it again straight away
    service.disconnect_session("s1").await;
    let reopened = service
        .publish(&target("devices/lamp"), &envelope(json!({"on": false})), scope.clone())
        .await;

    // Assert: the second client only started once the first was gone
    assert!(!pending.await.unwrap().success);
    assert!(reopened.success, "reopened publish failed: {:?}", reopened.message);
    let client_ids: Vec<String> = adapter
        .started_params()
        .into_iter()
        .map(|params| params.client_id)
        .collect();
    assert_eq!(client_ids, vec!["a@x.io_s1".to_string(), "a@x.io_s1".to_string()]);
    assert_eq!(adapter.overlapping_sessions(), 0);
    assert_eq!(service.registry().len().await, 1);
}
