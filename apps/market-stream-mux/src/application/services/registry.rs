//! Subscription Registry
//!
//! Single source of truth for who holds which [`SubscriptionKey`], and the
//! only place that decides when a key's feed starts or stops.
//!
//! # Design
//!
//! Entries live in a map of `Arc<Mutex<Entry>>`. The outer lock is held
//! only long enough to find or insert a slot, so operations on different
//! keys run concurrently while operations on the same key serialize on its
//! entry mutex.
//!
//! - 0→1 holders: launch the key's feed
//! - 1→0 holders: retire the entry, stop the feed, remove the slot
//!
//! A retired slot is never reused. An `acquire` that races a release to
//! zero sees the `retired` flag, drops the slot, and inserts a fresh one.
//! The fresh feed receives the closed tokens of every feed still retiring
//! for that key, so it does not connect until all old sockets are gone.
//!
//! Lock order is entry → retiring → map. `acquire` never holds the map lock
//! while taking an entry lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::feed_handle::{FeedHandle, KeyStatus};
use crate::application::ports::{EventSink, FeedLauncher, LaunchRequest};
use crate::domain::subscription::{ClientId, SubscriptionKey};
use crate::infrastructure::metrics::{self, InvariantKind};

// =============================================================================
// Errors and Outcomes
// =============================================================================

/// Errors returned by [`SubscriptionRegistry::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Starting another key would exceed the active key limit.
    #[error("active key limit reached ({limit})")]
    TooManyKeys {
        /// Configured limit.
        limit: usize,
    },

    /// The key already has the maximum number of holders.
    #[error("subscriber limit reached for {key} ({limit})")]
    TooManySubscribers {
        /// Key that is full.
        key: SubscriptionKey,
        /// Configured limit.
        limit: usize,
    },
}

/// Result of a successful acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// First holder; a feed was launched.
    Started,
    /// Joined an existing feed.
    Joined,
    /// The client already held the key.
    AlreadyHeld,
}

/// Result of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Last holder left; the feed was signalled to stop.
    Stopped,
    /// Other holders remain.
    Remaining(usize),
    /// The client did not hold the key.
    NotHeld,
}

/// Capacity limits enforced by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    /// Maximum keys with a running feed.
    pub max_active_keys: usize,
    /// Maximum holders of a single key.
    pub max_subscribers_per_key: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_active_keys: 512,
            max_subscribers_per_key: 10_000,
        }
    }
}

// =============================================================================
// Entries
// =============================================================================

#[derive(Debug, Default)]
struct Entry {
    holders: HashSet<ClientId>,
    feed: Option<FeedHandle>,
    retired: bool,
}

type Slot = Arc<Mutex<Entry>>;

// =============================================================================
// Registry
// =============================================================================

/// Reference-counted registry of subscription keys and their feeds.
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<SubscriptionKey, Slot>>,
    retiring: Mutex<HashMap<SubscriptionKey, Vec<CancellationToken>>>,
    launcher: Arc<dyn FeedLauncher>,
    sink: Weak<dyn EventSink>,
    limits: RegistryLimits,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("active_keys", &self.entries.read().len())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create a registry that launches feeds through `launcher` and points
    /// them at `sink`.
    #[must_use]
    pub fn new(
        launcher: Arc<dyn FeedLauncher>,
        sink: Weak<dyn EventSink>,
        limits: RegistryLimits,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retiring: Mutex::new(HashMap::new()),
            launcher,
            sink,
            limits,
        }
    }

    /// Add `client` as a holder of `key`, launching the feed on 0→1.
    ///
    /// Idempotent per `(key, client)`. Connection problems never surface
    /// here; the launched feed retries on its own.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when a capacity limit would be exceeded.
    pub fn acquire(&self, key: &SubscriptionKey, client: ClientId) -> Result<Acquired, RegistryError> {
        loop {
            let slot = self.slot_for(key)?;
            let mut entry = slot.lock();
            if entry.retired {
                continue;
            }

            if entry.holders.contains(&client) {
                return Ok(Acquired::AlreadyHeld);
            }
            if entry.holders.len() >= self.limits.max_subscribers_per_key {
                return Err(RegistryError::TooManySubscribers {
                    key: key.clone(),
                    limit: self.limits.max_subscribers_per_key,
                });
            }

            entry.holders.insert(client);
            let first = entry.holders.len() == 1;

            if first && entry.feed.is_some() {
                tracing::error!(%key, "Registry entry had a feed but no holders");
                metrics::record_invariant_violation(InvariantKind::OrphanFeed);
            }
            if entry.feed.is_none() {
                if !first {
                    tracing::error!(%key, "Registry entry had holders but no feed, relaunching");
                    metrics::record_invariant_violation(InvariantKind::MissingFeed);
                }
                entry.feed = Some(self.launch(key));
            }

            drop(entry);
            if first {
                tracing::info!(%key, %client, "Key acquired, feed started");
                metrics::set_active_keys(self.entries.read().len());
                return Ok(Acquired::Started);
            }
            tracing::debug!(%key, %client, "Joined existing feed");
            return Ok(Acquired::Joined);
        }
    }

    /// Remove `client` as a holder of `key`, stopping the feed on 1→0.
    ///
    /// Does not wait for the feed to finish tearing down.
    pub fn release(&self, key: &SubscriptionKey, client: ClientId) -> Released {
        let Some(slot) = self.entries.read().get(key).cloned() else {
            return Released::NotHeld;
        };

        let mut entry = slot.lock();
        if entry.retired || !entry.holders.remove(&client) {
            return Released::NotHeld;
        }
        if !entry.holders.is_empty() {
            return Released::Remaining(entry.holders.len());
        }

        entry.retired = true;
        match entry.feed.take() {
            Some(feed) => {
                let closed = feed.stop();
                let mut retiring = self.retiring.lock();
                prune_closed(&mut retiring);
                retiring.entry(key.clone()).or_default().push(closed);
            }
            None => {
                tracing::error!(%key, "Released key had no feed");
                metrics::record_invariant_violation(InvariantKind::MissingFeed);
            }
        }

        let remaining_keys = {
            let mut entries = self.entries.write();
            if entries.get(key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                entries.remove(key);
            } else {
                tracing::error!(%key, "Retired entry was already removed");
                metrics::record_invariant_violation(InvariantKind::DoubleRemoval);
            }
            entries.len()
        };
        drop(entry);

        tracing::info!(%key, %client, "Last holder released, feed stopping");
        metrics::set_active_keys(remaining_keys);
        Released::Stopped
    }

    /// Keys that currently have at least one holder.
    #[must_use]
    pub fn active_keys(&self) -> HashSet<SubscriptionKey> {
        self.slots()
            .into_iter()
            .filter(|(_, slot)| {
                let entry = slot.lock();
                !entry.retired && !entry.holders.is_empty()
            })
            .map(|(key, _)| key)
            .collect()
    }

    /// Number of holders of `key`.
    #[must_use]
    pub fn refcount(&self, key: &SubscriptionKey) -> usize {
        let slot = self.entries.read().get(key).cloned();
        slot.map_or(0, |slot| slot.lock().holders.len())
    }

    /// Clients holding `key`.
    #[must_use]
    pub fn holders(&self, key: &SubscriptionKey) -> HashSet<ClientId> {
        let slot = self.entries.read().get(key).cloned();
        slot.map(|slot| slot.lock().holders.clone()).unwrap_or_default()
    }

    /// Status of `key`, if it has a running feed.
    #[must_use]
    pub fn key_status(&self, key: &SubscriptionKey) -> Option<KeyStatus> {
        let slot = self.entries.read().get(key).cloned()?;
        let entry = slot.lock();
        entry
            .feed
            .as_ref()
            .map(|feed| feed.status().snapshot(key, entry.holders.len()))
    }

    /// Status of every key with a running feed.
    #[must_use]
    pub fn snapshot(&self) -> Vec<KeyStatus> {
        self.slots()
            .into_iter()
            .filter_map(|(key, slot)| {
                let entry = slot.lock();
                entry
                    .feed
                    .as_ref()
                    .map(|feed| feed.status().snapshot(&key, entry.holders.len()))
            })
            .collect()
    }

    /// Stop every feed and wait up to `grace` for all of them to close.
    pub async fn shutdown(&self, grace: Duration) {
        let slots: Vec<_> = self.entries.write().drain().collect();
        let mut closing: Vec<CancellationToken> =
            self.retiring.lock().drain().flat_map(|(_, tokens)| tokens).collect();

        for (_, slot) in slots {
            let mut entry = slot.lock();
            entry.retired = true;
            entry.holders.clear();
            if let Some(feed) = entry.feed.take() {
                closing.push(feed.stop());
            }
        }
        metrics::set_active_keys(0);

        let all_closed = async {
            for token in &closing {
                token.cancelled().await;
            }
        };
        if tokio::time::timeout(grace, all_closed).await.is_err() {
            tracing::warn!(grace_ms = grace.as_millis(), "Feeds still closing at shutdown deadline");
        }
    }

    fn slot_for(&self, key: &SubscriptionKey) -> Result<Slot, RegistryError> {
        if let Some(slot) = self.entries.read().get(key) {
            return Ok(Arc::clone(slot));
        }

        let mut entries = self.entries.write();
        if let Some(slot) = entries.get(key) {
            return Ok(Arc::clone(slot));
        }
        if entries.len() >= self.limits.max_active_keys {
            return Err(RegistryError::TooManyKeys {
                limit: self.limits.max_active_keys,
            });
        }
        let slot = Slot::default();
        entries.insert(key.clone(), Arc::clone(&slot));
        Ok(slot)
    }

    fn slots(&self) -> Vec<(SubscriptionKey, Slot)> {
        self.entries
            .read()
            .iter()
            .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
            .collect()
    }

    fn launch(&self, key: &SubscriptionKey) -> FeedHandle {
        let predecessors = {
            let mut retiring = self.retiring.lock();
            prune_closed(&mut retiring);
            retiring.get(key).cloned().unwrap_or_default()
        };
        if !predecessors.is_empty() {
            tracing::debug!(
                %key,
                closing = predecessors.len(),
                "Previous feeds still closing, new feed will wait"
            );
        }

        self.launcher.launch(LaunchRequest {
            key: key.clone(),
            sink: self.sink.clone(),
            predecessors,
        })
    }
}

fn prune_closed(retiring: &mut HashMap<SubscriptionKey, Vec<CancellationToken>>) {
    retiring.retain(|_, tokens| {
        tokens.retain(|token| !token.is_cancelled());
        !tokens.is_empty()
    });
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::FeedStatus;
    use crate::domain::market::{FeedOrigin, MarketEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSink;

    impl EventSink for NullSink {
        fn publish(&self, _: &SubscriptionKey, _: MarketEvent, _: FeedOrigin) -> usize {
            0
        }
    }

    #[derive(Default)]
    struct CountingLauncher {
        launches: AtomicUsize,
        with_predecessor: AtomicUsize,
    }

    impl FeedLauncher for CountingLauncher {
        fn launch(&self, request: LaunchRequest) -> FeedHandle {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if !request.predecessors.is_empty() {
                self.with_predecessor.fetch_add(1, Ordering::SeqCst);
            }
            FeedHandle::detached(request.key, Arc::new(FeedStatus::new()))
        }
    }

    fn registry_with(limits: RegistryLimits) -> (SubscriptionRegistry, Arc<CountingLauncher>) {
        let launcher = Arc::new(CountingLauncher::default());
        let sink: Weak<dyn EventSink> = Weak::<NullSink>::new();
        let registry = SubscriptionRegistry::new(launcher.clone(), sink, limits);
        (registry, launcher)
    }

    fn registry() -> (SubscriptionRegistry, Arc<CountingLauncher>) {
        registry_with(RegistryLimits::default())
    }

    fn btc() -> SubscriptionKey {
        SubscriptionKey::kline("BTCUSDT", "1m").unwrap()
    }

    #[test]
    fn first_acquire_starts_feed() {
        let (registry, launcher) = registry();
        let client = ClientId::new();

        assert_eq!(registry.acquire(&btc(), client).unwrap(), Acquired::Started);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(registry.active_keys().contains(&btc()));
        assert!(registry.key_status(&btc()).is_some());
    }

    #[test]
    fn second_client_joins_without_launch() {
        let (registry, launcher) = registry();

        registry.acquire(&btc(), ClientId::new()).unwrap();
        assert_eq!(registry.acquire(&btc(), ClientId::new()).unwrap(), Acquired::Joined);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(registry.refcount(&btc()), 2);
    }

    #[test]
    fn acquire_is_idempotent() {
        let (registry, launcher) = registry();
        let client = ClientId::new();

        registry.acquire(&btc(), client).unwrap();
        assert_eq!(registry.acquire(&btc(), client).unwrap(), Acquired::AlreadyHeld);
        assert_eq!(registry.refcount(&btc()), 1);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_to_zero_removes_entry() {
        let (registry, _) = registry();
        let a = ClientId::new();
        let b = ClientId::new();

        registry.acquire(&btc(), a).unwrap();
        registry.acquire(&btc(), b).unwrap();

        assert_eq!(registry.release(&btc(), a), Released::Remaining(1));
        assert_eq!(registry.release(&btc(), a), Released::NotHeld);
        assert_eq!(registry.release(&btc(), b), Released::Stopped);
        assert!(registry.active_keys().is_empty());
        assert!(registry.key_status(&btc()).is_none());
    }

    #[test]
    fn release_unknown_key_is_not_held() {
        let (registry, _) = registry();
        assert_eq!(registry.release(&btc(), ClientId::new()), Released::NotHeld);
    }

    #[test]
    fn reacquire_after_stop_launches_again() {
        let (registry, launcher) = registry();
        let client = ClientId::new();

        registry.acquire(&btc(), client).unwrap();
        registry.release(&btc(), client);
        assert_eq!(registry.acquire(&btc(), client).unwrap(), Acquired::Started);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        // Detached handles close immediately, so no predecessor to wait on.
        assert_eq!(launcher.with_predecessor.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn key_limit_enforced() {
        let (registry, _) = registry_with(RegistryLimits {
            max_active_keys: 1,
            max_subscribers_per_key: 10,
        });
        let client = ClientId::new();

        registry.acquire(&btc(), client).unwrap();
        let eth = SubscriptionKey::ticker("ETHUSDT").unwrap();
        assert_eq!(
            registry.acquire(&eth, client).unwrap_err(),
            RegistryError::TooManyKeys { limit: 1 }
        );
        // Existing key still accepts holders.
        assert!(registry.acquire(&btc(), ClientId::new()).is_ok());
    }

    #[test]
    fn subscriber_limit_enforced() {
        let (registry, _) = registry_with(RegistryLimits {
            max_active_keys: 10,
            max_subscribers_per_key: 1,
        });

        registry.acquire(&btc(), ClientId::new()).unwrap();
        assert!(matches!(
            registry.acquire(&btc(), ClientId::new()),
            Err(RegistryError::TooManySubscribers { limit: 1, .. })
        ));
    }

    #[tokio::test]
    async fn reacquire_waits_on_closing_predecessor() {
        struct SpawningLauncher {
            with_predecessor: AtomicUsize,
        }

        impl FeedLauncher for SpawningLauncher {
            fn launch(&self, request: LaunchRequest) -> FeedHandle {
                if !request.predecessors.is_empty() {
                    self.with_predecessor.fetch_add(1, Ordering::SeqCst);
                }
                let cancel = CancellationToken::new();
                let observed = cancel.clone();
                FeedHandle::spawn(
                    request.key,
                    Arc::new(FeedStatus::new()),
                    cancel,
                    Duration::from_secs(1),
                    async move {
                        observed.cancelled().await;
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    },
                )
            }
        }

        let launcher = Arc::new(SpawningLauncher {
            with_predecessor: AtomicUsize::new(0),
        });
        let sink: Weak<dyn EventSink> = Weak::<NullSink>::new();
        let registry = SubscriptionRegistry::new(launcher.clone(), sink, RegistryLimits::default());
        let client = ClientId::new();

        registry.acquire(&btc(), client).unwrap();
        registry.release(&btc(), client);
        registry.acquire(&btc(), client).unwrap();
        assert_eq!(launcher.with_predecessor.load(Ordering::SeqCst), 1);

        registry.shutdown(Duration::from_secs(1)).await;
        assert!(registry.active_keys().is_empty());
    }

    /// Launcher whose feeds honor their predecessors and record how many
    /// of them are open at once.
    struct OverlapLauncher {
        launches: AtomicUsize,
        open: Arc<AtomicUsize>,
        max_open: Arc<AtomicUsize>,
        close_delay: Duration,
    }

    impl OverlapLauncher {
        fn new(close_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                open: Arc::new(AtomicUsize::new(0)),
                max_open: Arc::new(AtomicUsize::new(0)),
                close_delay,
            })
        }
    }

    struct OpenFeed(Arc<AtomicUsize>);

    impl OpenFeed {
        fn enter(open: Arc<AtomicUsize>, max_open: &AtomicUsize) -> Self {
            let now = open.fetch_add(1, Ordering::SeqCst) + 1;
            max_open.fetch_max(now, Ordering::SeqCst);
            Self(open)
        }
    }

    impl Drop for OpenFeed {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl FeedLauncher for OverlapLauncher {
        fn launch(&self, request: LaunchRequest) -> FeedHandle {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let LaunchRequest { key, predecessors, .. } = request;
            let cancel = CancellationToken::new();
            let observed = cancel.clone();
            let open = Arc::clone(&self.open);
            let max_open = Arc::clone(&self.max_open);
            let close_delay = self.close_delay;

            FeedHandle::spawn(
                key,
                Arc::new(FeedStatus::new()),
                cancel,
                Duration::from_secs(1),
                async move {
                    for predecessor in &predecessors {
                        tokio::select! {
                            () = observed.cancelled() => return,
                            () = predecessor.cancelled() => {}
                        }
                    }
                    let _open = OpenFeed::enter(open, &max_open);
                    observed.cancelled().await;
                    tokio::time::sleep(close_delay).await;
                },
            )
        }
    }

    fn overlap_registry(launcher: &Arc<OverlapLauncher>) -> SubscriptionRegistry {
        let sink: Weak<dyn EventSink> = Weak::<NullSink>::new();
        SubscriptionRegistry::new(launcher.clone(), sink, RegistryLimits::default())
    }

    #[tokio::test]
    async fn fast_closing_feed_does_not_hide_slow_predecessor() {
        let launcher = OverlapLauncher::new(Duration::from_millis(300));
        let registry = overlap_registry(&launcher);
        let client = ClientId::new();

        // First feed opens, then lingers while it closes.
        registry.acquire(&btc(), client).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.release(&btc(), client);

        // Second feed is cancelled while still waiting and closes at once.
        registry.acquire(&btc(), client).unwrap();
        registry.release(&btc(), client);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Third feed must still wait for the first.
        registry.acquire(&btc(), client).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 3);
        assert_eq!(launcher.max_open.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.open.load(Ordering::SeqCst), 1);

        registry.shutdown(Duration::from_secs(2)).await;
        assert_eq!(launcher.open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_release_keeps_single_feed() {
        let launcher = OverlapLauncher::new(Duration::from_millis(5));
        let registry = Arc::new(overlap_registry(&launcher));
        let key = btc();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let key = key.clone();
                tokio::task::spawn_blocking(move || {
                    let client = ClientId::new();
                    for _ in 0..100 {
                        registry.acquire(&key, client).unwrap();
                        std::thread::sleep(Duration::from_micros(200));
                        registry.release(&key, client);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }
        registry.shutdown(Duration::from_secs(5)).await;

        assert!(registry.active_keys().is_empty());
        assert_eq!(registry.refcount(&key), 0);
        assert!(launcher.launches.load(Ordering::SeqCst) >= 1);
        assert_eq!(launcher.max_open.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reads_do_not_block_release() {
        let (registry, _launcher) = registry();
        let registry = Arc::new(registry);
        let key = btc();

        let writer = {
            let registry = Arc::clone(&registry);
            let key = key.clone();
            tokio::task::spawn_blocking(move || {
                let client = ClientId::new();
                for _ in 0..5_000 {
                    registry.acquire(&key, client).unwrap();
                    registry.release(&key, client);
                }
            })
        };
        let reader = {
            let registry = Arc::clone(&registry);
            let key = key.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..5_000 {
                    let count = registry.refcount(&key);
                    let holders = registry.holders(&key);
                    assert!(count <= 1 && holders.len() <= 1);
                }
            })
        };

        tokio::time::timeout(Duration::from_secs(10), async {
            writer.await.unwrap();
            reader.await.unwrap();
        })
        .await
        .expect("registry reads deadlocked against release");
        assert_eq!(registry.refcount(&key), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Acquire(usize, usize),
            Release(usize, usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..4usize, 0..3usize).prop_map(|(c, k)| Op::Acquire(c, k)),
                (0..4usize, 0..3usize).prop_map(|(c, k)| Op::Release(c, k)),
            ]
        }

        proptest! {
            #[test]
            fn feed_active_iff_holders(ops in proptest::collection::vec(op(), 1..64)) {
                let (registry, launcher) = registry();
                let clients: Vec<_> = (0..4).map(|_| ClientId::new()).collect();
                let keys = [
                    SubscriptionKey::kline("BTCUSDT", "1m").unwrap(),
                    SubscriptionKey::ticker("ETHUSDT").unwrap(),
                    SubscriptionKey::kline("ADAUSDT", "5m").unwrap(),
                ];
                let mut model: HashMap<usize, HashSet<usize>> = HashMap::new();
                let mut expected_launches = 0;

                for op in ops {
                    match op {
                        Op::Acquire(c, k) => {
                            let holders = model.entry(k).or_default();
                            if holders.is_empty() {
                                expected_launches += 1;
                            }
                            holders.insert(c);
                            registry.acquire(&keys[k], clients[c]).unwrap();
                        }
                        Op::Release(c, k) => {
                            model.entry(k).or_default().remove(&c);
                            registry.release(&keys[k], clients[c]);
                        }
                    }

                    for (k, key) in keys.iter().enumerate() {
                        let held = model.get(&k).map_or(0, HashSet::len);
                        prop_assert_eq!(registry.refcount(key), held);
                        prop_assert_eq!(registry.key_status(key).is_some(), held > 0);
                    }
                }
                prop_assert_eq!(launcher.launches.load(Ordering::SeqCst), expected_launches);
            }
        }
    }
}
