//! Impure I/O operations for the MQTT client
//!
//! This module owns the `rumqttc` network loop of one pooled link: it drives
//! `EventLoop::poll`, publishes link state over a watch channel, and matches
//! PUBACKs to waiting publishers.

use super::connection::{
    configure_mqtt_options, ClientParams, ConnectError, LinkState, PublishError,
};
use super::message_handler::{AckOutcome, EventRoute, MessageHandler};
use crate::transport::{BrokerAdapter, BrokerClient};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Adapter that starts real `rumqttc` clients
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttAdapter;

impl BrokerAdapter for RumqttAdapter {
    fn start(&self, params: ClientParams) -> Result<Box<dyn BrokerClient>, ConnectError> {
        Ok(Box::new(RumqttClient::start(params)))
    }
}

/// Publishers waiting for their PUBACK
///
/// Requests leave the client in submission order, so a waiter is queued at
/// submission and bound to its packet id when the network loop reports the
/// outgoing publish.
#[derive(Default)]
struct AckTracker {
    inner: Mutex<AckState>,
}

#[derive(Default)]
struct AckState {
    queued: VecDeque<oneshot::Sender<AckOutcome>>,
    in_flight: HashMap<u16, oneshot::Sender<AckOutcome>>,
}

impl AckTracker {
    fn lock(&self) -> MutexGuard<'_, AckState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bind(&self, pkid: u16) {
        let mut state = self.lock();
        if let Some(waiter) = state.queued.pop_front() {
            if !waiter.is_closed() {
                state.in_flight.insert(pkid, waiter);
            }
        }
    }

    fn resolve(&self, pkid: u16, outcome: AckOutcome) {
        if let Some(waiter) = self.lock().in_flight.remove(&pkid) {
            let _ = waiter.send(outcome);
        }
    }

    fn fail_all(&self, reason: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let queued = state.queued.drain(..);
        let in_flight = state.in_flight.drain().map(|(_, waiter)| waiter);
        for waiter in queued.chain(in_flight) {
            let _ = waiter.send(AckOutcome::LinkLost(reason.to_string()));
        }
    }
}

/// One `rumqttc` connection and its network loop task
pub struct RumqttClient {
    client_id: String,
    endpoint: String,
    client: AsyncClient,
    state_tx: Arc<watch::Sender<LinkState>>,
    acks: Arc<AckTracker>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttClient {
    /// Build the client and spawn its network loop
    pub fn start(params: ClientParams) -> Self {
        let mqtt_options = configure_mqtt_options(&params);
        let (client, event_loop) = AsyncClient::new(mqtt_options, params.request_capacity);

        let (state_tx, _) = watch::channel(LinkState::Connecting);
        let state_tx = Arc::new(state_tx);
        let acks = Arc::new(AckTracker::default());
        let endpoint = params.endpoint();

        debug!(
            client_id = %params.client_id,
            endpoint = %endpoint,
            "Starting MQTT network loop"
        );

        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            Arc::clone(&state_tx),
            Arc::clone(&acks),
            endpoint.clone(),
        ));

        Self {
            client_id: params.client_id,
            endpoint,
            client,
            state_tx,
            acks,
            event_loop_handle: Mutex::new(Some(handle)),
        }
    }

    /// Poll until the link ends; there is no internal reconnection
    async fn run_event_loop(
        mut event_loop: EventLoop,
        state_tx: Arc<watch::Sender<LinkState>>,
        acks: Arc<AckTracker>,
        endpoint: String,
    ) {
        loop {
            let route = match event_loop.poll().await {
                Ok(event) => MessageHandler::route_mqtt_event(&event),
                Err(e) => MessageHandler::classify_connection_error(&e),
            };

            match route {
                EventRoute::ConnectionAcknowledged => {
                    info!(endpoint = %endpoint, "MQTT link established");
                    state_tx.send_replace(LinkState::Connected);
                }
                EventRoute::PublishSent(pkid) => acks.bind(pkid),
                EventRoute::PublishAcknowledged { pkid, outcome } => acks.resolve(pkid, outcome),
                EventRoute::ConnectionRefused(reason) => {
                    warn!(endpoint = %endpoint, reason = %reason, "MQTT broker refused connection");
                    acks.fail_all(&reason);
                    state_tx.send_replace(LinkState::Refused(reason));
                    break;
                }
                EventRoute::Disconnected(reason) => {
                    if state_tx.borrow().is_connected() {
                        warn!(endpoint = %endpoint, reason = %reason, "MQTT link lost");
                    } else {
                        debug!(endpoint = %endpoint, reason = %reason, "MQTT link closed");
                    }
                    acks.fail_all(&reason);
                    state_tx.send_replace(LinkState::Disconnected(reason));
                    break;
                }
                EventRoute::InfrastructureEvent(event) => {
                    tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event);
                }
                EventRoute::OutgoingEvent => {}
            }
        }
        debug!(endpoint = %endpoint, "MQTT network loop stopped");
    }

    fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.event_loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn mark_stopped(&self, reason: &str) {
        self.acks.fail_all(reason);
        self.state_tx
            .send_replace(LinkState::Disconnected(reason.to_string()));
    }
}

#[async_trait]
impl BrokerClient for RumqttClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn link_state(&self) -> LinkState {
        self.state_tx.borrow().clone()
    }

    fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        ack_timeout: Duration,
    ) -> Result<(), PublishError> {
        let state = self.link_state();
        if !state.is_connected() {
            return Err(PublishError::NotConnected { state });
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            // Submission and queueing happen under one lock so the network
            // loop cannot bind this publish's packet id to another waiter.
            let mut acks = self.acks.lock();
            self.client
                .try_publish(topic, QoS::AtLeastOnce, false, payload)
                .map_err(|e| PublishError::Client(e.to_string()))?;
            acks.queued.push_back(ack_tx);
        }

        let started = Instant::now();
        match tokio::time::timeout(ack_timeout, ack_rx).await {
            Ok(Ok(AckOutcome::Acked)) => {
                debug!(endpoint = %self.endpoint, topic = %topic, "Publish acknowledged");
                Ok(())
            }
            Ok(Ok(AckOutcome::Rejected(reason))) => Err(PublishError::Rejected {
                topic: topic.to_string(),
                reason,
            }),
            Ok(Ok(AckOutcome::LinkLost(reason))) => Err(PublishError::LinkLost {
                topic: topic.to_string(),
                reason,
            }),
            Ok(Err(_)) => Err(PublishError::LinkLost {
                topic: topic.to_string(),
                reason: "network loop stopped".to_string(),
            }),
            Err(_) => Err(PublishError::Timeout {
                topic: topic.to_string(),
                waited_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    async fn disconnect(&self, grace: Duration) {
        let Some(mut handle) = self.take_handle() else {
            return;
        };

        if self.link_state().is_connected() {
            let started = Instant::now();
            match tokio::time::timeout(grace, self.client.disconnect()).await {
                Ok(Ok(())) => {
                    let remaining = grace.saturating_sub(started.elapsed());
                    if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                        debug!(endpoint = %self.endpoint, "Network loop did not stop in time, aborting");
                    }
                }
                Ok(Err(e)) => {
                    warn!(endpoint = %self.endpoint, error = %e, "Disconnect request failed");
                }
                Err(_) => {
                    warn!(endpoint = %self.endpoint, "Disconnect request timed out");
                }
            }
        }

        handle.abort();
        self.mark_stopped("client disconnected");
        info!(client_id = %self.client_id, endpoint = %self.endpoint, "MQTT client disconnected");
    }

    fn abort(&self) {
        if let Some(handle) = self.take_handle() {
            handle.abort();
            self.mark_stopped("network loop aborted");
            debug!(client_id = %self.client_id, endpoint = %self.endpoint, "MQTT network loop aborted");
        }
    }
}

impl Drop for RumqttClient {
    fn drop(&mut self) {
        // Async disconnect is impossible here; only stop the network loop
        if let Some(handle) = self.take_handle() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_tracker_binds_in_submission_order() {
        let tracker = AckTracker::default();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        {
            let mut state = tracker.lock();
            state.queued.push_back(first_tx);
            state.queued.push_back(second_tx);
        }

        tracker.bind(1);
        tracker.bind(2);
        tracker.resolve(2, AckOutcome::Rejected("QuotaExceeded".to_string()));
        tracker.resolve(1, AckOutcome::Acked);

        assert_eq!(first_rx.try_recv().unwrap(), AckOutcome::Acked);
        assert_eq!(
            second_rx.try_recv().unwrap(),
            AckOutcome::Rejected("QuotaExceeded".to_string())
        );
    }

    #[test]
    fn test_ack_tracker_skips_abandoned_waiters() {
        let tracker = AckTracker::default();
        let (abandoned_tx, abandoned_rx) = oneshot::channel::<AckOutcome>();
        drop(abandoned_rx);
        tracker.lock().queued.push_back(abandoned_tx);

        tracker.bind(5);
        assert!(tracker.lock().in_flight.is_empty());
        assert!(tracker.lock().queued.is_empty());
    }

    #[test]
    fn test_ack_tracker_fail_all_notifies_everyone() {
        let tracker = AckTracker::default();
        let (queued_tx, mut queued_rx) = oneshot::channel();
        let (bound_tx, mut bound_rx) = oneshot::channel();
        tracker.lock().queued.push_back(bound_tx);
        tracker.bind(9);
        tracker.lock().queued.push_back(queued_tx);

        tracker.fail_all("io error");

        assert!(matches!(bound_rx.try_recv(), Ok(AckOutcome::LinkLost(_))));
        assert!(matches!(queued_rx.try_recv(), Ok(AckOutcome::LinkLost(_))));
        assert!(tracker.lock().in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_publish_fails_before_connack() {
        let client = RumqttClient::start(ClientParams {
            client_id: "test-publish-before-connack".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9,
            credentials: None,
            keep_alive: Duration::from_secs(60),
            request_capacity: 10,
        });

        let result = client
            .publish("test/topic", b"{}".to_vec(), Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(PublishError::NotConnected { .. })));
        client.abort();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_noop_safe() {
        let client = RumqttClient::start(ClientParams {
            client_id: "test-disconnect-unconnected".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9,
            credentials: None,
            keep_alive: Duration::from_secs(60),
            request_capacity: 10,
        });

        client.disconnect(Duration::from_millis(50)).await;
        client.disconnect(Duration::from_millis(50)).await;

        assert!(matches!(client.link_state(), LinkState::Disconnected(_)));
    }
}
