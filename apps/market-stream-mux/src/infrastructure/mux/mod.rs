//! Market Data Mux
//!
//! Facade that gateways talk to. Wires the [`BroadcastHub`], the
//! [`SubscriptionRegistry`] and the feed launcher together and turns
//! `subscribe`/`unsubscribe` commands into hub membership changes.
//!
//! ```text
//! gateway ──► MarketDataMux ──► BroadcastHub ──► SubscriptionRegistry ──► FeedLauncher
//!                 ▲                  │ publish                                 │
//!                 └── ClientFeed ◄───┴──────────── FeedSupervisor ◄────────────┘
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{EventSink, FeedLauncher, SnapshotSource};
use crate::application::services::{KeyStatus, RegistryLimits, SubscriptionRegistry};
use crate::domain::subscription::{Channel, ClientId, KeyError, SubscriptionKey};
use crate::infrastructure::broadcast::{
    BroadcastHub, ClientFeed, HubConfig, HubError, HubStats, Joined, Left,
};
use crate::infrastructure::config::MuxConfig;
use crate::infrastructure::feeds::{FeedSettings, SupervisedFeedLauncher};

/// Errors returned to a gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MuxError {
    /// Symbol, channel or interval was rejected.
    #[error("invalid subscription: {0}")]
    InvalidKey(#[from] KeyError),

    /// Hub or registry refused the request.
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Outcome reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Client is now subscribed.
    Subscribed,
    /// Client was already subscribed.
    AlreadySubscribed,
    /// Client is no longer subscribed.
    Unsubscribed,
    /// Client was not subscribed.
    NotSubscribed,
}

/// Acknowledgement of a subscribe or unsubscribe command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    /// Canonical key the command resolved to.
    pub key: SubscriptionKey,
    /// What happened.
    pub status: AckStatus,
}

/// Per-key status with staleness resolved against the configured threshold.
#[derive(Debug, Clone, Serialize)]
pub struct KeyReport {
    /// Feed status.
    #[serde(flatten)]
    pub status: KeyStatus,
    /// No event within the staleness window.
    pub stale: bool,
}

/// Subscription multiplexer facade.
#[derive(Debug)]
pub struct MarketDataMux {
    hub: Arc<BroadcastHub>,
    root: CancellationToken,
    stale_after: Duration,
}

impl MarketDataMux {
    /// Build a mux whose feeds connect upstream and fall back to `snapshot`
    /// polling (or the synthetic walk when `snapshot` is `None`).
    #[must_use]
    pub fn new(
        config: &MuxConfig,
        snapshot: Option<Arc<dyn SnapshotSource>>,
        root: CancellationToken,
    ) -> Self {
        let launcher = SupervisedFeedLauncher::new(
            FeedSettings::from_config(config),
            snapshot,
            root.clone(),
        );
        Self::with_launcher(
            Arc::new(launcher),
            HubConfig::from(&config.hub),
            RegistryLimits::from(&config.registry),
            config.server.stale_after,
            root,
        )
    }

    /// Build a mux around an arbitrary launcher.
    #[must_use]
    pub fn with_launcher(
        launcher: Arc<dyn FeedLauncher>,
        hub: HubConfig,
        limits: RegistryLimits,
        stale_after: Duration,
        root: CancellationToken,
    ) -> Self {
        let hub = Arc::new_cyclic(|weak: &Weak<BroadcastHub>| {
            let sink: Weak<dyn EventSink> = weak.clone();
            let registry = Arc::new(SubscriptionRegistry::new(launcher, sink, limits));
            BroadcastHub::new(registry, hub)
        });

        Self {
            hub,
            root,
            stale_after,
        }
    }

    /// Register a new client.
    pub fn connect(&self) -> (ClientId, ClientFeed) {
        let client = ClientId::new();
        (client, self.hub.register(client))
    }

    /// Register a client under a caller-chosen id.
    pub fn register(&self, client: ClientId) -> ClientFeed {
        self.hub.register(client)
    }

    /// Subscribe `client` to `symbol`/`channel`/`interval`.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::InvalidKey`] for a malformed key and
    /// [`MuxError::Hub`] when the client is unknown or a limit is hit.
    pub fn subscribe(
        &self,
        client: ClientId,
        symbol: &str,
        channel: &str,
        interval: Option<&str>,
    ) -> Result<Ack, MuxError> {
        let key = parse_key(symbol, channel, interval)?;
        self.subscribe_key(client, key)
    }

    /// Subscribe `client` to an already-parsed key.
    ///
    /// # Errors
    ///
    /// See [`MarketDataMux::subscribe`].
    pub fn subscribe_key(&self, client: ClientId, key: SubscriptionKey) -> Result<Ack, MuxError> {
        let status = match self.hub.join(client, &key)? {
            Joined::Added => AckStatus::Subscribed,
            Joined::AlreadyJoined => AckStatus::AlreadySubscribed,
        };
        tracing::debug!(%client, %key, ?status, "Subscribe");
        Ok(Ack { key, status })
    }

    /// Unsubscribe `client` from `symbol`/`channel`/`interval`.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::InvalidKey`] for a malformed key.
    pub fn unsubscribe(
        &self,
        client: ClientId,
        symbol: &str,
        channel: &str,
        interval: Option<&str>,
    ) -> Result<Ack, MuxError> {
        let key = parse_key(symbol, channel, interval)?;
        let status = match self.hub.leave(client, &key) {
            Left::Removed => AckStatus::Unsubscribed,
            Left::NotJoined => AckStatus::NotSubscribed,
        };
        tracing::debug!(%client, %key, ?status, "Unsubscribe");
        Ok(Ack { key, status })
    }

    /// Drop `client` and release all of its keys.
    pub fn on_disconnect(&self, client: ClientId) -> Vec<SubscriptionKey> {
        self.hub.on_disconnect(client)
    }

    /// Status of `key`, if a feed is running for it.
    #[must_use]
    pub fn key_status(&self, key: &SubscriptionKey) -> Option<KeyReport> {
        self.hub
            .registry()
            .key_status(key)
            .map(|status| self.report(status))
    }

    /// Status of every running feed, sorted by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<KeyReport> {
        let mut reports: Vec<_> = self
            .hub
            .registry()
            .snapshot()
            .into_iter()
            .map(|status| self.report(status))
            .collect();
        reports.sort_by_key(|r| r.status.key.to_string());
        reports
    }

    /// Keys with at least one holder.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.hub.registry().active_keys().into_iter().collect();
        keys.sort_by_key(ToString::to_string);
        keys
    }

    /// Hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        self.hub.stats()
    }

    /// Underlying hub.
    #[must_use]
    pub const fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Staleness threshold used by [`KeyReport::stale`].
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Disconnect every client, stop every feed and wait up to `grace` for
    /// them to close.
    pub async fn shutdown(&self, grace: Duration) {
        let clients = self.hub.disconnect_all();
        tracing::info!(clients, "Shutting down mux");
        self.hub.registry().shutdown(grace).await;
        self.root.cancel();
    }

    fn report(&self, status: KeyStatus) -> KeyReport {
        let stale = status.is_stale(Utc::now(), self.stale_after);
        KeyReport { status, stale }
    }
}

fn parse_key(symbol: &str, channel: &str, interval: Option<&str>) -> Result<SubscriptionKey, KeyError> {
    let channel: Channel = channel.parse()?;
    SubscriptionKey::new(symbol, channel, interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::LaunchRequest;
    use crate::application::services::{FeedHandle, FeedState, FeedStatus};

    struct DetachedLauncher;

    impl FeedLauncher for DetachedLauncher {
        fn launch(&self, request: LaunchRequest) -> FeedHandle {
            let status = Arc::new(FeedStatus::new());
            status.set_state(FeedState::Open);
            FeedHandle::detached(request.key, status)
        }
    }

    fn mux() -> MarketDataMux {
        MarketDataMux::with_launcher(
            Arc::new(DetachedLauncher),
            HubConfig::default(),
            RegistryLimits::default(),
            Duration::from_secs(15),
            CancellationToken::new(),
        )
    }

    #[test]
    fn subscribe_normalizes_and_acks() {
        let mux = mux();
        let (client, _feed) = mux.connect();

        let ack = mux.subscribe(client, "btcusdt", "kline", Some("1m")).unwrap();
        assert_eq!(ack.status, AckStatus::Subscribed);
        assert_eq!(ack.key.to_string(), "BTCUSDT:kline:1m");

        let again = mux.subscribe(client, "BTCUSDT", "candles", Some("1m")).unwrap();
        assert_eq!(again.status, AckStatus::AlreadySubscribed);
        assert_eq!(mux.active_keys(), vec![ack.key]);
    }

    #[test]
    fn invalid_keys_are_rejected_without_side_effects() {
        let mux = mux();
        let (client, _feed) = mux.connect();

        assert!(matches!(
            mux.subscribe(client, "BTCUSDT", "depth", None),
            Err(MuxError::InvalidKey(KeyError::UnknownChannel(_)))
        ));
        assert!(matches!(
            mux.subscribe(client, "BTCUSDT", "kline", None),
            Err(MuxError::InvalidKey(KeyError::MissingInterval))
        ));
        assert!(matches!(
            mux.subscribe(client, "", "ticker", None),
            Err(MuxError::InvalidKey(_))
        ));
        assert!(mux.active_keys().is_empty());
    }

    #[test]
    fn unknown_client_cannot_subscribe() {
        let mux = mux();
        let stranger = ClientId::new();
        assert!(matches!(
            mux.subscribe(stranger, "BTCUSDT", "ticker", None),
            Err(MuxError::Hub(HubError::UnknownClient(_)))
        ));
    }

    #[test]
    fn unsubscribe_and_disconnect_release_keys() {
        let mux = mux();
        let (a, _fa) = mux.connect();
        let (b, _fb) = mux.connect();
        mux.subscribe(a, "BTCUSDT", "ticker", None).unwrap();
        mux.subscribe(b, "BTCUSDT", "ticker", None).unwrap();
        mux.subscribe(b, "ETHUSDT", "ticker", None).unwrap();

        let ack = mux.unsubscribe(a, "BTCUSDT", "ticker", None).unwrap();
        assert_eq!(ack.status, AckStatus::Unsubscribed);
        let ack = mux.unsubscribe(a, "BTCUSDT", "ticker", None).unwrap();
        assert_eq!(ack.status, AckStatus::NotSubscribed);
        assert_eq!(mux.active_keys().len(), 2);

        assert_eq!(mux.on_disconnect(b).len(), 2);
        assert!(mux.active_keys().is_empty());
    }

    #[test]
    fn key_status_reports_holders_and_staleness() {
        let mux = mux();
        let (a, _fa) = mux.connect();
        let (b, _fb) = mux.connect();
        let key = mux.subscribe(a, "ETHUSDT", "ticker", None).unwrap().key;
        mux.subscribe(b, "ETHUSDT", "ticker", None).unwrap();

        let report = mux.key_status(&key).unwrap();
        assert_eq!(report.status.holders, 2);
        assert_eq!(report.status.state, FeedState::Open);
        assert!(report.stale, "no event yet means stale");
        assert_eq!(mux.snapshot().len(), 1);

        let unknown = SubscriptionKey::ticker("DOTUSDT").unwrap();
        assert!(mux.key_status(&unknown).is_none());
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let mux = mux();
        let (a, mut feed) = mux.connect();
        mux.subscribe(a, "BTCUSDT", "ticker", None).unwrap();

        mux.shutdown(Duration::from_millis(100)).await;
        assert!(mux.active_keys().is_empty());
        assert_eq!(mux.stats().clients, 0);
        assert!(feed.recv().await.is_none());
    }
}
