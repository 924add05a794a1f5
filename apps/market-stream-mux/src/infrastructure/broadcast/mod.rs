//! Broadcast Hub
//!
//! Fans each published event out to every client joined to its key.
//!
//! # Architecture
//!
//! Every client owns a bounded outbound queue. `publish` enqueues with
//! `try_send`, so one slow client can never stall a feed or its peers: a
//! full or closed queue gets that client evicted, which is the same as a
//! disconnect. Delivery is at-most-once with no replay; a client only sees
//! events published while it is joined.
//!
//! Hub membership and registry holders are kept in lockstep: `join` acquires
//! the key in the [`SubscriptionRegistry`] before recording membership,
//! `leave`/`on_disconnect` release it. Lock order is hub → registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;

use crate::application::ports::EventSink;
use crate::application::services::{RegistryError, SubscriptionRegistry};
use crate::domain::market::{FeedOrigin, MarketEvent};
use crate::domain::subscription::{ClientId, SubscriptionKey};
use crate::infrastructure::config::HubSettings;
use crate::infrastructure::metrics::{self, EvictionReason};

// =============================================================================
// Push Messages
// =============================================================================

/// Event as delivered to a client: `{"key": .., "event": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushEvent {
    /// Key the event was published for.
    pub key: SubscriptionKey,
    /// The event.
    pub event: MarketEvent,
    /// Source of the event.
    #[serde(skip)]
    pub origin: FeedOrigin,
}

/// Receiving side of a client's outbound queue.
#[derive(Debug)]
pub struct ClientFeed {
    client: ClientId,
    rx: mpsc::Receiver<Arc<PushEvent>>,
}

impl ClientFeed {
    /// Client this feed belongs to.
    #[must_use]
    pub const fn client(&self) -> ClientId {
        self.client
    }

    /// Next event, or `None` once the client has been disconnected and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<PushEvent>> {
        self.rx.recv().await
    }

    /// Next event if one is queued.
    pub fn try_recv(&mut self) -> Option<Arc<PushEvent>> {
        self.rx.try_recv().ok()
    }

    /// Convert into a [`tokio_stream::Stream`].
    #[must_use]
    pub fn into_stream(self) -> ReceiverStream<Arc<PushEvent>> {
        ReceiverStream::new(self.rx)
    }
}

// =============================================================================
// Configuration and Errors
// =============================================================================

/// Hub configuration.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Outbound queue depth per client.
    pub client_queue_capacity: usize,
    /// Maximum keys one client may join.
    pub max_keys_per_client: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&HubSettings::default())
    }
}

impl From<&HubSettings> for HubConfig {
    fn from(settings: &HubSettings) -> Self {
        Self {
            client_queue_capacity: settings.client_queue_capacity.max(1),
            max_keys_per_client: settings.max_keys_per_client,
        }
    }
}

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// Client is not registered (never connected, or already evicted).
    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    /// Client already joined the maximum number of keys.
    #[error("client key limit reached ({limit})")]
    TooManyKeys {
        /// Configured limit.
        limit: usize,
    },

    /// Registry refused the key.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Joined {
    /// Client newly joined the key.
    Added,
    /// Client was already joined.
    AlreadyJoined,
}

/// Result of a leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Left {
    /// Client left the key.
    Removed,
    /// Client was not joined.
    NotJoined,
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Registered clients.
    pub clients: usize,
    /// Keys with at least one member.
    pub keys: usize,
    /// Total (client, key) memberships.
    pub memberships: usize,
}

// =============================================================================
// Hub
// =============================================================================

#[derive(Debug)]
struct Subscriber {
    keys: HashSet<SubscriptionKey>,
    outbox: mpsc::Sender<Arc<PushEvent>>,
}

#[derive(Debug, Default)]
struct HubState {
    members: HashMap<SubscriptionKey, HashSet<ClientId>>,
    subscribers: HashMap<ClientId, Subscriber>,
}

/// Per-key fan-out to client queues.
#[derive(Debug)]
pub struct BroadcastHub {
    state: RwLock<HubState>,
    registry: Arc<SubscriptionRegistry>,
    config: HubConfig,
}

impl BroadcastHub {
    /// Create a hub backed by `registry`.
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>, config: HubConfig) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            registry,
            config,
        }
    }

    /// Registry backing this hub.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Register a client and return its outbound queue.
    ///
    /// Registering an existing client replaces its queue; the previous
    /// [`ClientFeed`] ends.
    pub fn register(&self, client: ClientId) -> ClientFeed {
        let (outbox, rx) = mpsc::channel(self.config.client_queue_capacity);
        let clients = {
            let mut state = self.state.write();
            state
                .subscribers
                .entry(client)
                .and_modify(|s| s.outbox = outbox.clone())
                .or_insert_with(|| Subscriber {
                    keys: HashSet::new(),
                    outbox,
                });
            state.subscribers.len()
        };
        metrics::set_connected_clients(clients);
        tracing::debug!(%client, "Client registered");
        ClientFeed { client, rx }
    }

    /// Join `client` to `key`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`HubError`] if the client is unknown, at its key limit, or
    /// the registry refuses the key. Nothing changes on error.
    pub fn join(&self, client: ClientId, key: &SubscriptionKey) -> Result<Joined, HubError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let subscriber = state
            .subscribers
            .get_mut(&client)
            .ok_or(HubError::UnknownClient(client))?;

        if subscriber.keys.contains(key) {
            return Ok(Joined::AlreadyJoined);
        }
        if subscriber.keys.len() >= self.config.max_keys_per_client {
            return Err(HubError::TooManyKeys {
                limit: self.config.max_keys_per_client,
            });
        }

        self.registry.acquire(key, client)?;
        subscriber.keys.insert(key.clone());
        state.members.entry(key.clone()).or_default().insert(client);
        Ok(Joined::Added)
    }

    /// Remove `client` from `key`. Idempotent.
    pub fn leave(&self, client: ClientId, key: &SubscriptionKey) -> Left {
        let mut state = self.state.write();
        let removed = state
            .subscribers
            .get_mut(&client)
            .is_some_and(|s| s.keys.remove(key));
        if !removed {
            return Left::NotJoined;
        }

        Self::remove_member(&mut state, key, client);
        self.registry.release(key, client);
        Left::Removed
    }

    /// Drop `client` entirely: leave every key and close its queue.
    ///
    /// Returns the keys the client was joined to.
    pub fn on_disconnect(&self, client: ClientId) -> Vec<SubscriptionKey> {
        let (keys, clients) = {
            let mut state = self.state.write();
            let Some(subscriber) = state.subscribers.remove(&client) else {
                return Vec::new();
            };
            let keys: Vec<_> = subscriber.keys.into_iter().collect();
            for key in &keys {
                Self::remove_member(&mut state, key, client);
                self.registry.release(key, client);
            }
            (keys, state.subscribers.len())
        };

        metrics::set_connected_clients(clients);
        tracing::info!(%client, keys = keys.len(), "Client disconnected");
        keys
    }

    /// Disconnect every registered client. Returns how many there were.
    pub fn disconnect_all(&self) -> usize {
        let clients: Vec<ClientId> = self.state.read().subscribers.keys().copied().collect();
        for client in &clients {
            self.on_disconnect(*client);
        }
        clients.len()
    }

    /// Deliver `event` to every client joined to `key` right now.
    ///
    /// Returns the number of clients the event was enqueued for.
    pub fn publish(&self, key: &SubscriptionKey, event: MarketEvent, origin: FeedOrigin) -> usize {
        let started = Instant::now();
        let push = Arc::new(PushEvent {
            key: key.clone(),
            event,
            origin,
        });

        let mut delivered = 0;
        let mut evicted = Vec::new();
        {
            let state = self.state.read();
            let Some(members) = state.members.get(key) else {
                return 0;
            };
            for client in members {
                let Some(subscriber) = state.subscribers.get(client) else {
                    continue;
                };
                match subscriber.outbox.try_send(Arc::clone(&push)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => evicted.push((*client, EvictionReason::QueueFull)),
                    Err(TrySendError::Closed(_)) => evicted.push((*client, EvictionReason::Closed)),
                }
            }
        }

        for (client, reason) in evicted {
            tracing::warn!(%client, %key, reason = reason.as_str(), "Evicting client");
            metrics::record_eviction(reason);
            self.on_disconnect(client);
        }

        metrics::record_published(origin, delivered);
        metrics::record_publish_duration(started.elapsed());
        delivered
    }

    /// Keys `client` is joined to.
    #[must_use]
    pub fn client_keys(&self, client: ClientId) -> HashSet<SubscriptionKey> {
        self.state
            .read()
            .subscribers
            .get(&client)
            .map(|s| s.keys.clone())
            .unwrap_or_default()
    }

    /// Clients joined to `key`.
    #[must_use]
    pub fn members(&self, key: &SubscriptionKey) -> HashSet<ClientId> {
        self.state
            .read()
            .members
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `client` is registered.
    #[must_use]
    pub fn is_registered(&self, client: ClientId) -> bool {
        self.state.read().subscribers.contains_key(&client)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let state = self.state.read();
        HubStats {
            clients: state.subscribers.len(),
            keys: state.members.len(),
            memberships: state.members.values().map(HashSet::len).sum(),
        }
    }

    fn remove_member(state: &mut HubState, key: &SubscriptionKey, client: ClientId) {
        if let Some(members) = state.members.get_mut(key) {
            members.remove(&client);
            if members.is_empty() {
                state.members.remove(key);
            }
        }
    }
}

impl EventSink for BroadcastHub {
    fn publish(&self, key: &SubscriptionKey, event: MarketEvent, origin: FeedOrigin) -> usize {
        Self::publish(self, key, event, origin)
    }
}

// =============================================================================
// Tests
// =============================================================================
