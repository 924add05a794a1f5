//! Fallback Feed
//!
//! Keeps a key's subscribers fed while the live socket is unavailable.
//! Every poll tick it fetches a REST snapshot; if that fails and synthetic
//! data is enabled, it advances a random walk seeded from the last known
//! price instead. Events are tagged [`FeedOrigin::Polled`] or
//! [`FeedOrigin::Synthetic`] so consumers can tell them from live data.

pub mod synthetic;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::ports::SnapshotSource;
use crate::domain::market::{FeedOrigin, MarketEvent};
use crate::domain::subscription::SubscriptionKey;
use crate::infrastructure::config::FallbackSettings;

pub use synthetic::SyntheticWalk;

/// Fallback feed configuration.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Time between polls.
    pub poll_interval: Duration,
    /// Snapshot request timeout.
    pub request_timeout: Duration,
    /// Emit a synthetic walk when the snapshot fails.
    pub synthetic_enabled: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self::from(&FallbackSettings::default())
    }
}

impl From<&FallbackSettings> for FallbackConfig {
    fn from(settings: &FallbackSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval,
            request_timeout: settings.request_timeout,
            synthetic_enabled: settings.synthetic_enabled,
        }
    }
}

/// Polling/synthetic feed for one key.
pub struct FallbackFeed {
    config: FallbackConfig,
    key: SubscriptionKey,
    source: Option<Arc<dyn SnapshotSource>>,
    walk: SyntheticWalk,
    event_tx: mpsc::Sender<(MarketEvent, FeedOrigin)>,
    cancel: CancellationToken,
}

impl FallbackFeed {
    /// Create a fallback feed.
    ///
    /// `last_price` seeds the synthetic walk so it continues from the most
    /// recent real price.
    #[must_use]
    pub fn new(
        config: FallbackConfig,
        key: SubscriptionKey,
        source: Option<Arc<dyn SnapshotSource>>,
        last_price: Option<Decimal>,
        event_tx: mpsc::Sender<(MarketEvent, FeedOrigin)>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            walk: SyntheticWalk::new(key.clone(), last_price),
            config,
            key,
            source,
            event_tx,
            cancel,
        }
    }

    /// Replace the walk, e.g. with a seeded one.
    #[must_use]
    pub fn with_walk(mut self, walk: SyntheticWalk) -> Self {
        self.walk = walk;
        self
    }

    /// Poll until cancelled or the receiver is dropped.
    pub async fn run(mut self) {
        tracing::info!(
            key = %self.key,
            poll_ms = self.config.poll_interval.as_millis(),
            "Fallback feed started"
        );

        let cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let produced = tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => tokio::select! {
                    () = cancel.cancelled() => break,
                    produced = self.poll() => produced,
                },
            };

            if let Some(event) = produced
                && self.event_tx.send(event).await.is_err()
            {
                break;
            }
        }

        tracing::info!(key = %self.key, "Fallback feed stopped");
    }

    /// Produce at most one event.
    async fn poll(&mut self) -> Option<(MarketEvent, FeedOrigin)> {
        if let Some(source) = &self.source {
            match tokio::time::timeout(self.config.request_timeout, source.fetch(&self.key)).await {
                Ok(Ok(event)) => {
                    self.walk.seed(event.last_price());
                    return Some((event, FeedOrigin::Polled));
                }
                Ok(Err(e)) => {
                    tracing::warn!(key = %self.key, error = %e, "Snapshot poll failed");
                }
                Err(_) => {
                    tracing::warn!(
                        key = %self.key,
                        timeout_ms = self.config.request_timeout.as_millis(),
                        "Snapshot poll timed out"
                    );
                }
            }
        }

        if self.config.synthetic_enabled {
            return Some((self.walk.step(Utc::now()), FeedOrigin::Synthetic));
        }
        None
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{MockSnapshotSource, SnapshotError};
    use crate::domain::market::TickerEvent;

    fn key() -> SubscriptionKey {
        SubscriptionKey::ticker("BTCUSDT").unwrap()
    }

    fn config(synthetic_enabled: bool) -> FallbackConfig {
        FallbackConfig {
            poll_interval: Duration::from_millis(10),
            request_timeout: Duration::from_millis(200),
            synthetic_enabled,
        }
    }

    fn ticker(price: i64) -> MarketEvent {
        MarketEvent::Ticker(TickerEvent {
            symbol: "BTCUSDT".to_string(),
            price: Decimal::new(price, 0),
            change_pct: Decimal::ZERO,
            volume: Decimal::ONE,
            ts: Utc::now(),
        })
    }

    fn feed(
        source: Option<MockSnapshotSource>,
        synthetic: bool,
    ) -> (FallbackFeed, mpsc::Receiver<(MarketEvent, FeedOrigin)>, CancellationToken) {
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let source = source.map(|s| Arc::new(s) as Arc<dyn SnapshotSource>);
        let feed = FallbackFeed::new(config(synthetic), key(), source, None, tx, cancel.clone());
        (feed, rx, cancel)
    }

    #[tokio::test]
    async fn snapshot_success_is_polled_and_seeds_walk() {
        let mut source = MockSnapshotSource::new();
        source.expect_fetch().returning(|_| Ok(ticker(65_100)));

        let (mut feed, _rx, _cancel) = feed(Some(source), true);
        let (event, origin) = feed.poll().await.unwrap();
        assert_eq!(origin, FeedOrigin::Polled);
        assert_eq!(event.last_price(), Decimal::new(65_100, 0));
        assert_eq!(feed.walk.price(), Decimal::new(65_100, 0));
    }

    #[tokio::test]
    async fn snapshot_failure_falls_back_to_synthetic() {
        let mut source = MockSnapshotSource::new();
        source
            .expect_fetch()
            .returning(|_| Err(SnapshotError::Status(503)));

        let (mut feed, _rx, _cancel) = feed(Some(source), true);
        let (_, origin) = feed.poll().await.unwrap();
        assert_eq!(origin, FeedOrigin::Synthetic);
    }

    #[tokio::test]
    async fn nothing_when_synthetic_disabled() {
        let mut source = MockSnapshotSource::new();
        source
            .expect_fetch()
            .returning(|_| Err(SnapshotError::Http("refused".into())));

        let (mut feed, _rx, _cancel) = feed(Some(source), false);
        assert!(feed.poll().await.is_none());
    }

    #[tokio::test]
    async fn run_emits_until_cancelled() {
        let (feed, mut rx, cancel) = feed(None, true);
        let task = tokio::spawn(feed.run());

        for _ in 0..3 {
            let (_, origin) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(origin, FeedOrigin::Synthetic);
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
