//! Mock implementations for testing
//!
//! Provides a scripted broker adapter and in-memory collaborators so the
//! pool and service can be exercised without a broker.

use crate::collaborators::{
    AssistantBrokerConfig, AssistantStore, Identity, IdentityResolver, SecretCodec, SessionState,
};
use crate::error::BridgeError;
use crate::transport::{
    BrokerAdapter, BrokerClient, ClientParams, ConnectError, LinkState, PublishError,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub type PublishedMessage = (String, Vec<u8>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How the next started client's handshake plays out
#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    /// ConnAck immediately
    Succeed,
    /// ConnAck after a delay
    SucceedAfter(Duration),
    /// Never answers; the network loop runs until aborted
    Hang,
    /// Broker refuses the handshake
    Refuse(String),
    /// Network error after a delay
    FailAfter(Duration, String),
    /// The adapter itself fails to start a client
    StartError(String),
}

/// How the broker answers publishes
#[derive(Debug, Clone)]
pub enum AckBehavior {
    Ack,
    Reject(String),
    /// No PUBACK ever arrives
    Silent,
}

#[derive(Default)]
struct MockBrokerState {
    script: Mutex<VecDeque<ConnectBehavior>>,
    default_behavior: Mutex<Option<ConnectBehavior>>,
    ack_behavior: Mutex<Option<AckBehavior>>,
    started: Mutex<Vec<ClientParams>>,
    links: Mutex<Vec<Arc<watch::Sender<LinkState>>>>,
    published: Mutex<Vec<PublishedMessage>>,
    active_loops: Arc<AtomicUsize>,
    open_sessions: Mutex<HashMap<String, usize>>,
    overlapping_sessions: AtomicUsize,
    disconnects: AtomicUsize,
    aborts: AtomicUsize,
}

impl MockBrokerState {
    /// A broker sees one session per client id; a second start under a live
    /// id would kick the first one off.
    fn open_session(&self, client_id: &str) {
        let mut open = lock(&self.open_sessions);
        let count = open.entry(client_id.to_string()).or_insert(0);
        if *count > 0 {
            self.overlapping_sessions.fetch_add(1, Ordering::SeqCst);
        }
        *count += 1;
    }

    fn close_session(&self, client_id: &str) {
        let mut open = lock(&self.open_sessions);
        if let Some(count) = open.get_mut(client_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                open.remove(client_id);
            }
        }
    }
}

/// Broker adapter with scripted connect behaviour
///
/// Cloning shares the recorded history, so a test can hand one clone to the
/// service and inspect the other.
#[derive(Clone, Default)]
pub struct MockBrokerAdapter {
    state: Arc<MockBrokerState>,
}

impl MockBrokerAdapter {
    /// Every handshake succeeds and every publish is acknowledged
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: ConnectBehavior) -> Self {
        let adapter = Self::default();
        *lock(&adapter.state.default_behavior) = Some(behavior);
        adapter
    }

    /// Behaviours consumed one per started client, before the default applies
    pub fn script(&self, behaviors: impl IntoIterator<Item = ConnectBehavior>) {
        lock(&self.state.script).extend(behaviors);
    }

    pub fn set_ack_behavior(&self, behavior: AckBehavior) {
        *lock(&self.state.ack_behavior) = Some(behavior);
    }

    /// Number of clients started so far
    pub fn start_count(&self) -> usize {
        lock(&self.state.started).len()
    }

    pub fn started_params(&self) -> Vec<ClientParams> {
        lock(&self.state.started).clone()
    }

    /// Network loops that have been started and not yet stopped
    pub fn active_loops(&self) -> usize {
        self.state.active_loops.load(Ordering::SeqCst)
    }

    /// Clients started while another client with the same id was still open
    pub fn overlapping_sessions(&self) -> usize {
        self.state.overlapping_sessions.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.state.aborts.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state.published).clone()
    }

    /// Simulate the broker dropping every established link
    pub fn drop_all_links(&self) {
        for link in lock(&self.state.links).iter() {
            if link.borrow().is_connected() {
                link.send_replace(LinkState::Disconnected("connection reset by peer".to_string()));
            }
        }
    }

    fn next_behavior(&self) -> ConnectBehavior {
        lock(&self.state.script)
            .pop_front()
            .or_else(|| lock(&self.state.default_behavior).clone())
            .unwrap_or(ConnectBehavior::Succeed)
    }
}

impl BrokerAdapter for MockBrokerAdapter {
    fn start(&self, params: ClientParams) -> Result<Box<dyn BrokerClient>, ConnectError> {
        let behavior = self.next_behavior();
        let endpoint = params.endpoint();
        lock(&self.state.started).push(params.clone());

        if let ConnectBehavior::StartError(reason) = behavior {
            return Err(ConnectError::Network { endpoint, reason });
        }

        self.state.open_session(&params.client_id);
        let (state_tx, _) = watch::channel(LinkState::Connecting);
        let state_tx = Arc::new(state_tx);
        lock(&self.state.links).push(Arc::clone(&state_tx));

        // Counted before spawning and released when the task future is
        // dropped, so an abort before the first poll is still accounted for.
        self.state.active_loops.fetch_add(1, Ordering::SeqCst);
        let guard = LoopGuard(Arc::clone(&self.state.active_loops));
        let handle = tokio::spawn(run_mock_loop(behavior, Arc::clone(&state_tx), guard));

        Ok(Box::new(MockBrokerClient {
            client_id: params.client_id,
            state_tx,
            broker: Arc::clone(&self.state),
            loop_handle: Mutex::new(Some(handle)),
        }))
    }
}

struct LoopGuard(Arc<AtomicUsize>);

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_mock_loop(
    behavior: ConnectBehavior,
    state_tx: Arc<watch::Sender<LinkState>>,
    _guard: LoopGuard,
) {
    match behavior {
        ConnectBehavior::Succeed => {
            state_tx.send_replace(LinkState::Connected);
        }
        ConnectBehavior::SucceedAfter(delay) => {
            tokio::time::sleep(delay).await;
            state_tx.send_replace(LinkState::Connected);
        }
        ConnectBehavior::Hang => {}
        ConnectBehavior::Refuse(reason) => {
            state_tx.send_replace(LinkState::Refused(reason));
            return;
        }
        ConnectBehavior::FailAfter(delay, reason) => {
            tokio::time::sleep(delay).await;
            state_tx.send_replace(LinkState::Disconnected(reason));
            return;
        }
        ConnectBehavior::StartError(_) => return,
    }

    // Keep running until the link drops or the task is aborted
    let mut state_rx = state_tx.subscribe();
    let _ = state_rx
        .wait_for(|state| matches!(state, LinkState::Disconnected(_)))
        .await;
}

/// Client handed out by [`MockBrokerAdapter`]
pub struct MockBrokerClient {
    client_id: String,
    state_tx: Arc<watch::Sender<LinkState>>,
    broker: Arc<MockBrokerState>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MockBrokerClient {
    fn stop(&self, reason: &str) -> bool {
        let Some(handle) = lock(&self.loop_handle).take() else {
            return false;
        };
        handle.abort();
        self.broker.close_session(&self.client_id);
        self.state_tx
            .send_replace(LinkState::Disconnected(reason.to_string()));
        true
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
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

        lock(&self.broker.published).push((topic.to_string(), payload));

        let behavior = lock(&self.broker.ack_behavior)
            .clone()
            .unwrap_or(AckBehavior::Ack);
        match behavior {
            AckBehavior::Ack => Ok(()),
            AckBehavior::Reject(reason) => Err(PublishError::Rejected {
                topic: topic.to_string(),
                reason,
            }),
            AckBehavior::Silent => {
                tokio::time::sleep(ack_timeout).await;
                Err(PublishError::Timeout {
                    topic: topic.to_string(),
                    waited_ms: ack_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn disconnect(&self, _grace: Duration) {
        if self.stop("client disconnected") {
            self.broker.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn abort(&self) {
        if self.stop("network loop aborted") {
            self.broker.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockBrokerClient {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.loop_handle).take() {
            handle.abort();
            self.broker.close_session(&self.client_id);
        }
    }
}

/// Identity resolver backed by a token table
#[derive(Debug, Default)]
pub struct MockIdentityResolver {
    identities: HashMap<String, Identity>,
    rejected: Vec<String>,
}

impl MockIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, bearer: &str, user_id: &str, email: Option<&str>) -> Self {
        self.identities.insert(
            bearer.to_string(),
            Identity {
                user_id: user_id.to_string(),
                email: email.map(str::to_string),
            },
        );
        self
    }

    /// Tokens that fail verification
    pub fn rejecting(mut self, bearer: &str) -> Self {
        self.rejected.push(bearer.to_string());
        self
    }
}

#[async_trait]
impl IdentityResolver for MockIdentityResolver {
    async fn resolve(&self, bearer: &str) -> Result<Option<Identity>, BridgeError> {
        if self.rejected.iter().any(|token| token == bearer) {
            return Err(BridgeError::authentication_failure("token signature invalid"));
        }
        Ok(self.identities.get(bearer).cloned())
    }
}

/// In-memory assistant and session store
#[derive(Debug, Default)]
pub struct MockAssistantStore {
    assistants: HashMap<String, AssistantBrokerConfig>,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl MockAssistantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assistant(mut self, assistant_id: &str, config: AssistantBrokerConfig) -> Self {
        self.assistants.insert(assistant_id.to_string(), config);
        self
    }

    pub fn with_session(self, session_id: &str, state: SessionState) -> Self {
        lock(&self.sessions).insert(session_id.to_string(), state);
        self
    }

    pub fn session(&self, session_id: &str) -> Option<SessionState> {
        lock(&self.sessions).get(session_id).cloned()
    }
}

#[async_trait]
impl AssistantStore for MockAssistantStore {
    async fn broker_config(&self, assistant_id: &str) -> Result<AssistantBrokerConfig, BridgeError> {
        self.assistants
            .get(assistant_id)
            .cloned()
            .ok_or_else(|| BridgeError::collaborator(format!("assistant {assistant_id} not found")))
    }

    async fn session_state(&self, session_id: &str) -> Result<Option<SessionState>, BridgeError> {
        Ok(self.session(session_id))
    }

    async fn record_session_state(
        &self,
        session_id: &str,
        state: SessionState,
    ) -> Result<(), BridgeError> {
        lock(&self.sessions).insert(session_id.to_string(), state);
        Ok(())
    }
}

/// Reversible stand-in for real encryption: prefixes with `enc:`
#[derive(Debug, Default, Clone, Copy)]
pub struct MockSecretCodec;

impl SecretCodec for MockSecretCodec {
    fn encrypt(&self, plaintext: &str) -> Result<String, BridgeError> {
        Ok(format!("enc:{plaintext}"))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, BridgeError> {
        ciphertext
            .strip_prefix("enc:")
            .map(str::to_string)
            .ok_or_else(|| BridgeError::credential_decrypt_failure("invalid token"))
    }
}
