//! The connection registry
//!
//! Single source of truth for pooled connections. Every structural change
//! happens under one async mutex; connection creation runs on its own task
//! so that a cancelled caller never strands the others waiting on it.

use super::key::ConnectionKey;
use super::managed::ManagedConnection;
use crate::observability::MetricsCollector;
use crate::transport::ConnectError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

type CreateResult = Result<Arc<ManagedConnection>, ConnectError>;

enum Slot {
    Live(Arc<ManagedConnection>),
    /// A creation task is running; its outcome is broadcast to every waiter
    Pending {
        generation: u64,
        result: watch::Receiver<Option<CreateResult>>,
        task: JoinHandle<()>,
    },
    /// A cancelled creation whose task has not stopped yet. The key stays
    /// reserved so a second client with the same client id cannot start
    /// alongside it.
    Retiring {
        generation: u64,
        stopped: watch::Receiver<bool>,
    },
}

#[derive(Default)]
struct RegistryState {
    slots: HashMap<ConnectionKey, Slot>,
    next_generation: u64,
}

enum Lookup {
    Reuse(Arc<ManagedConnection>),
    Await {
        generation: u64,
        result: watch::Receiver<Option<CreateResult>>,
    },
    Retiring {
        generation: u64,
        stopped: watch::Receiver<bool>,
    },
}

/// Concurrency-safe map from [`ConnectionKey`] to live connection
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    disconnect_grace: Duration,
    metrics: Arc<MetricsCollector>,
}

impl ConnectionRegistry {
    pub fn new(disconnect_grace: Duration, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            disconnect_grace,
            metrics,
        }
    }

    /// Return the live connection for `key`, creating it with `factory` if needed
    ///
    /// A pooled connection that fails its liveness check is disconnected and
    /// removed before its replacement is created. At most one factory runs per
    /// key; concurrent callers share its success or its failure. Callers
    /// waiting on a creation that is torn down get `Cancelled`.
    pub async fn get_or_create<F, Fut>(
        self: &Arc<Self>,
        key: &ConnectionKey,
        factory: F,
    ) -> Result<Arc<ManagedConnection>, ConnectError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ManagedConnection, ConnectError>> + Send + 'static,
    {
        let mut factory = Some(factory);

        loop {
            match self.lookup(key, &mut factory).await? {
                Lookup::Reuse(connection) => {
                    self.metrics.connection_reused();
                    debug!(key = %key, client_id = %connection.client_id(), "Reusing pooled connection");
                    return Ok(connection);
                }
                Lookup::Retiring {
                    generation,
                    mut stopped,
                } => {
                    debug!(key = %key, "Waiting for cancelled connection attempt to stop");
                    if stopped.wait_for(|done| *done).await.is_err() {
                        self.clear_retiring(key, generation).await;
                    }
                }
                Lookup::Await {
                    generation,
                    mut result,
                } => {
                    let settled = result
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|settled| settled.clone());
                    if let Some(outcome) = settled {
                        return outcome;
                    }

                    // The creation task stopped without reporting
                    self.clear_pending(key, generation).await;
                    return Err(ConnectError::Cancelled {
                        endpoint: key.endpoint(),
                    });
                }
            }
        }
    }

    async fn lookup<F, Fut>(
        self: &Arc<Self>,
        key: &ConnectionKey,
        factory: &mut Option<F>,
    ) -> Result<Lookup, ConnectError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ManagedConnection, ConnectError>> + Send + 'static,
    {
        let mut state = self.state.lock().await;

        match state.slots.get(key) {
            Some(Slot::Live(connection)) if connection.is_alive() => {
                return Ok(Lookup::Reuse(Arc::clone(connection)));
            }
            Some(Slot::Pending {
                generation, result, ..
            }) => {
                return Ok(Lookup::Await {
                    generation: *generation,
                    result: result.clone(),
                });
            }
            Some(Slot::Retiring {
                generation,
                stopped,
            }) => {
                return Ok(Lookup::Retiring {
                    generation: *generation,
                    stopped: stopped.clone(),
                });
            }
            Some(Slot::Live(_)) | None => {}
        }

        if let Some(Slot::Live(dead)) = state.slots.remove(key) {
            warn!(
                key = %key,
                client_id = %dead.client_id(),
                state = ?dead.link_state(),
                "Pooled connection failed liveness check, replacing"
            );
            dead.disconnect(self.disconnect_grace).await;
            self.metrics.connection_replaced();
            self.metrics.connections_closed(1);
        }

        let Some(factory) = factory.take() else {
            return Err(ConnectError::Cancelled {
                endpoint: key.endpoint(),
            });
        };

        let generation = state.next_generation;
        state.next_generation += 1;
        let (result_tx, result_rx) = watch::channel(None);

        let creation = factory();
        let registry = Arc::clone(self);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let created = creation.await.map(Arc::new);
            let installed = registry.install(&task_key, generation, created).await;
            result_tx.send_replace(Some(installed));
        });
        state.slots.insert(
            key.clone(),
            Slot::Pending {
                generation,
                result: result_rx.clone(),
                task,
            },
        );

        Ok(Lookup::Await {
            generation,
            result: result_rx,
        })
    }

    /// Publish a creation outcome, unless the slot was torn down meanwhile
    async fn install(&self, key: &ConnectionKey, generation: u64, created: CreateResult) -> CreateResult {
        let mut state = self.state.lock().await;
        let owns_slot = matches!(
            state.slots.get(key),
            Some(Slot::Pending { generation: current, .. }) if *current == generation
        );

        if !owns_slot {
            drop(state);
            return match created {
                Ok(connection) => {
                    info!(key = %key, "Connection torn down while connecting, discarding");
                    connection.disconnect(self.disconnect_grace).await;
                    self.metrics.connections_closed(1);
                    Err(ConnectError::Cancelled {
                        endpoint: key.endpoint(),
                    })
                }
                Err(e) => Err(e),
            };
        }

        match &created {
            Ok(connection) => {
                state
                    .slots
                    .insert(key.clone(), Slot::Live(Arc::clone(connection)));
            }
            Err(_) => {
                state.slots.remove(key);
            }
        }
        created
    }

    async fn clear_pending(&self, key: &ConnectionKey, generation: u64) {
        let mut state = self.state.lock().await;
        let stale = matches!(
            state.slots.get(key),
            Some(Slot::Pending { generation: current, .. }) if *current == generation
        );
        if stale {
            state.slots.remove(key);
        }
    }

    async fn clear_retiring(&self, key: &ConnectionKey, generation: u64) {
        let mut state = self.state.lock().await;
        let retired = matches!(
            state.slots.get(key),
            Some(Slot::Retiring { generation: current, .. }) if *current == generation
        );
        if retired {
            state.slots.remove(key);
        }
    }

    /// Abort an in-flight creation and hold its key until the task has stopped
    ///
    /// Stopping the task drops the half-connected client, which stops its
    /// network loop. Waiters on the creation observe `Cancelled`.
    fn retire(
        self: &Arc<Self>,
        state: &mut RegistryState,
        key: ConnectionKey,
        generation: u64,
        task: JoinHandle<()>,
    ) {
        debug!(key = %key, "Cancelling in-flight connection attempt");
        task.abort();

        let (stopped_tx, stopped_rx) = watch::channel(false);
        state.slots.insert(
            key.clone(),
            Slot::Retiring {
                generation,
                stopped: stopped_rx,
            },
        );

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let _ = task.await;
            registry.clear_retiring(&key, generation).await;
            stopped_tx.send_replace(true);
        });
    }

    /// Remove and disconnect every entry whose key matches
    ///
    /// Matching creations still in flight are cancelled. Returns the number of
    /// live connections closed.
    pub async fn remove_if<P>(self: &Arc<Self>, predicate: P) -> usize
    where
        P: Fn(&ConnectionKey) -> bool,
    {
        let mut state = self.state.lock().await;
        let matching: Vec<ConnectionKey> = state
            .slots
            .keys()
            .filter(|&key| predicate(key))
            .cloned()
            .collect();

        let mut removed = Vec::new();
        for key in matching {
            match state.slots.remove(&key) {
                Some(Slot::Live(connection)) => removed.push(connection),
                Some(Slot::Pending {
                    generation, task, ..
                }) => self.retire(&mut state, key, generation, task),
                Some(retiring @ Slot::Retiring { .. }) => {
                    state.slots.insert(key, retiring);
                }
                None => {}
            }
        }

        self.disconnect_all(removed).await
    }

    /// Remove and disconnect everything
    ///
    /// The registry stays usable: a later lookup starts a new connect attempt.
    pub async fn drain_all(self: &Arc<Self>) -> usize {
        let mut state = self.state.lock().await;
        let slots: Vec<(ConnectionKey, Slot)> = state.slots.drain().collect();

        let mut removed = Vec::new();
        for (key, slot) in slots {
            match slot {
                Slot::Live(connection) => removed.push(connection),
                Slot::Pending {
                    generation, task, ..
                } => self.retire(&mut state, key, generation, task),
                retiring @ Slot::Retiring { .. } => {
                    state.slots.insert(key, retiring);
                }
            }
        }

        self.disconnect_all(removed).await
    }

    async fn disconnect_all(&self, connections: Vec<Arc<ManagedConnection>>) -> usize {
        let count = connections.len();
        let mut disconnects = JoinSet::new();
        for connection in connections {
            let grace = self.disconnect_grace;
            disconnects.spawn(async move {
                connection.disconnect(grace).await;
                debug!(key = %connection.key(), client_id = %connection.client_id(), "Connection closed");
            });
        }
        while let Some(joined) = disconnects.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Disconnect task failed");
            }
        }

        self.metrics.connections_closed(count);
        count
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        self.state
            .lock()
            .await
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether a live entry exists for `key`
    pub async fn contains(&self, key: &ConnectionKey) -> bool {
        matches!(self.state.lock().await.slots.get(key), Some(Slot::Live(_)))
    }

    /// Keys of live entries
    pub async fn keys(&self) -> Vec<ConnectionKey> {
        self.state
            .lock()
            .await
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(key, _)| key.clone())
            .collect()
    }
}
