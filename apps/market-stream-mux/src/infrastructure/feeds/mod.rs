//! Feed Supervision
//!
//! One [`FeedSupervisor`] task runs per active key. It owns the key's
//! [`UpstreamConnector`] and, when needed, its [`FallbackFeed`], and is the
//! only place that decides which of the two feeds subscribers.
//!
//! # Source Selection
//!
//! ```text
//! upstream disabled ───────────────────────────────► fallback only
//! live Reconnecting (attempt >= N) ────────────────► start fallback
//! live gave up ────────────────────────────────────► fallback only
//! live Open ───────────────────────────────────────► stop fallback
//! ```
//!
//! While live is open, any fallback event still in flight is discarded.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{EventSink, FeedLauncher, LaunchRequest, SnapshotSource};
use crate::application::services::{FeedHandle, FeedState, FeedStatus};
use crate::domain::market::{FeedOrigin, MarketEvent};
use crate::domain::subscription::SubscriptionKey;
use crate::infrastructure::binance::{ConnectorConfig, UpstreamConnector, UpstreamEvent};
use crate::infrastructure::config::MuxConfig;
use crate::infrastructure::fallback::{FallbackConfig, FallbackFeed};
use crate::infrastructure::metrics::{self, DropReason};

const LIVE_CHANNEL_CAPACITY: usize = 1_024;
const FALLBACK_CHANNEL_CAPACITY: usize = 16;
const CHILD_GRACE_MARGIN: Duration = Duration::from_millis(100);

// =============================================================================
// Settings
// =============================================================================

/// Settings shared by every supervised feed.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Attempt live connections at all.
    pub upstream_enabled: bool,
    /// Live connector configuration.
    pub connector: ConnectorConfig,
    /// Fallback feed configuration.
    pub fallback: FallbackConfig,
    /// Consecutive live failures before fallback starts.
    pub fallback_after_attempts: u32,
    /// Time a stopping feed gets before it is aborted.
    pub linger: Duration,
}

impl FeedSettings {
    /// Build feed settings from the mux configuration.
    #[must_use]
    pub fn from_config(config: &MuxConfig) -> Self {
        Self {
            upstream_enabled: config.upstream.enabled && !config.upstream.ws_url.trim().is_empty(),
            connector: ConnectorConfig::from_upstream_settings(&config.upstream),
            fallback: FallbackConfig::from(&config.fallback),
            fallback_after_attempts: config.upstream.fallback_after_attempts.max(1),
            linger: config.upstream.feed_linger,
        }
    }

    /// Time a stopping supervisor waits for its live and fallback tasks.
    /// Capped below the linger so the supervisor finishes before its
    /// handle aborts it.
    #[must_use]
    pub fn child_grace(&self) -> Duration {
        (self.connector.close_grace + CHILD_GRACE_MARGIN).min(self.linger * 3 / 4)
    }
}

// =============================================================================
// Launcher
// =============================================================================

/// [`FeedLauncher`] that spawns a [`FeedSupervisor`] per key.
pub struct SupervisedFeedLauncher {
    settings: Arc<FeedSettings>,
    snapshot: Option<Arc<dyn SnapshotSource>>,
    root: CancellationToken,
}

impl SupervisedFeedLauncher {
    /// Create a launcher. Every feed's token is a child of `root`.
    #[must_use]
    pub fn new(
        settings: FeedSettings,
        snapshot: Option<Arc<dyn SnapshotSource>>,
        root: CancellationToken,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            snapshot,
            root,
        }
    }
}

impl FeedLauncher for SupervisedFeedLauncher {
    fn launch(&self, request: LaunchRequest) -> FeedHandle {
        let cancel = self.root.child_token();
        let status = Arc::new(FeedStatus::new());
        let supervisor = FeedSupervisor {
            settings: Arc::clone(&self.settings),
            key: request.key.clone(),
            sink: request.sink,
            predecessors: request.predecessors,
            snapshot: self.snapshot.clone(),
            status: Arc::clone(&status),
            cancel: cancel.clone(),
        };

        FeedHandle::spawn(
            request.key,
            status,
            cancel,
            self.settings.linger,
            supervisor.run(),
        )
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct RunningFallback {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Per-key task choosing between live and fallback data.
pub struct FeedSupervisor {
    settings: Arc<FeedSettings>,
    key: SubscriptionKey,
    sink: Weak<dyn EventSink>,
    predecessors: Vec<CancellationToken>,
    snapshot: Option<Arc<dyn SnapshotSource>>,
    status: Arc<FeedStatus>,
    cancel: CancellationToken,
}

impl FeedSupervisor {
    /// Run until cancelled or the sink is gone.
    pub async fn run(self) {
        if !self.predecessors.is_empty() {
            let all_closed = async {
                for predecessor in &self.predecessors {
                    predecessor.cancelled().await;
                }
            };
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = all_closed => {}
            }
        }

        let (live_tx, mut live_rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        let (fallback_tx, mut fallback_rx) = mpsc::channel(FALLBACK_CHANNEL_CAPACITY);

        let mut live_task = None;
        let mut live_active = false;
        let mut live_open = false;
        let mut fallback: Option<RunningFallback> = None;

        if self.settings.upstream_enabled {
            let connector = UpstreamConnector::new(
                self.settings.connector.clone(),
                self.key.clone(),
                live_tx,
                self.cancel.child_token(),
            );
            let key = self.key.clone();
            live_task = Some(tokio::spawn(async move {
                if let Err(e) = connector.run().await {
                    tracing::warn!(%key, error = %e, "Upstream connector gave up");
                }
            }));
            live_active = true;
        } else {
            drop(live_tx);
            tracing::info!(key = %self.key, "Upstream disabled, serving fallback data");
            fallback = Some(self.start_fallback(&fallback_tx));
        }

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = live_rx.recv(), if live_active => match event {
                    Some(UpstreamEvent::Connecting { attempt }) => {
                        if attempt == 0 {
                            self.status.set_state(FeedState::Connecting);
                        }
                    }
                    Some(UpstreamEvent::Open) => {
                        live_open = true;
                        self.status.set_state(FeedState::Open);
                        self.status.set_retry_count(0);
                        if let Some(running) = fallback.take() {
                            tracing::info!(key = %self.key, "Live stream restored, stopping fallback");
                            running.cancel.cancel();
                        }
                    }
                    Some(UpstreamEvent::Reconnecting { attempt, .. }) => {
                        live_open = false;
                        self.status.set_state(FeedState::Reconnecting);
                        self.status.set_retry_count(attempt);
                        if attempt >= self.settings.fallback_after_attempts && fallback.is_none() {
                            tracing::info!(key = %self.key, attempt, "Live stream unavailable, starting fallback");
                            fallback = Some(self.start_fallback(&fallback_tx));
                        }
                    }
                    Some(UpstreamEvent::Market(event)) => {
                        if !self.forward(event, FeedOrigin::Live) {
                            break;
                        }
                    }
                    None => {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        live_active = false;
                        live_open = false;
                        self.status.set_state(FeedState::Reconnecting);
                        if fallback.is_none() {
                            fallback = Some(self.start_fallback(&fallback_tx));
                        }
                    }
                },
                Some((event, origin)) = fallback_rx.recv() => {
                    if live_open {
                        metrics::record_frame_dropped(DropReason::Superseded);
                        continue;
                    }
                    if !self.forward(event, origin) {
                        break;
                    }
                }
            }
        }

        self.shutdown(live_task, fallback).await;
    }

    fn start_fallback(
        &self,
        tx: &mpsc::Sender<(MarketEvent, FeedOrigin)>,
    ) -> RunningFallback {
        metrics::record_fallback_activation();
        let cancel = self.cancel.child_token();
        let feed = FallbackFeed::new(
            self.settings.fallback.clone(),
            self.key.clone(),
            self.snapshot.clone(),
            self.status.snapshot(&self.key, 0).last_price,
            tx.clone(),
            cancel.clone(),
        );
        RunningFallback {
            cancel,
            task: tokio::spawn(async move {
                metrics::adjust_fallback_feeds(1.0);
                feed.run().await;
                metrics::adjust_fallback_feeds(-1.0);
            }),
        }
    }

    /// Publish to the sink. Returns `false` once the sink is gone.
    fn forward(&self, event: MarketEvent, origin: FeedOrigin) -> bool {
        let Some(sink) = self.sink.upgrade() else {
            tracing::debug!(key = %self.key, "Event sink dropped, stopping feed");
            return false;
        };
        self.status
            .record_event(origin, Utc::now(), event.last_price());
        sink.publish(&self.key, event, origin);
        true
    }

    async fn shutdown(&self, live_task: Option<JoinHandle<()>>, fallback: Option<RunningFallback>) {
        self.cancel.cancel();

        let children = async {
            if let Some(task) = live_task {
                let _ = task.await;
            }
            if let Some(running) = fallback {
                let _ = running.task.await;
            }
        };
        if tokio::time::timeout(self.settings.child_grace(), children).await.is_err() {
            tracing::warn!(key = %self.key, "Feed children did not stop within grace period");
        }
        self.status.set_state(FeedState::Closed);
        tracing::debug!(key = %self.key, "Feed supervisor exited");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::binance::ReconnectConfig;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(SubscriptionKey, FeedOrigin)>>,
    }

    impl EventSink for RecordingSink {
        fn publish(&self, key: &SubscriptionKey, _event: MarketEvent, origin: FeedOrigin) -> usize {
            self.events.lock().push((key.clone(), origin));
            1
        }
    }

    fn settings(upstream_enabled: bool, base_url: String) -> FeedSettings {
        FeedSettings {
            upstream_enabled,
            connector: ConnectorConfig {
                base_url,
                connect_timeout: Duration::from_millis(200),
                idle_timeout: Duration::from_secs(5),
                close_grace: Duration::from_millis(100),
                reconnect: ReconnectConfig {
                    initial_delay: Duration::from_millis(20),
                    max_delay: Duration::from_millis(40),
                    multiplier: 2.0,
                    jitter_factor: 0.0,
                    max_attempts: 0,
                    stable_after: Duration::from_secs(60),
                },
            },
            fallback: FallbackConfig {
                poll_interval: Duration::from_millis(10),
                request_timeout: Duration::from_millis(100),
                synthetic_enabled: true,
            },
            fallback_after_attempts: 1,
            linger: Duration::from_millis(300),
        }
    }

    async fn wait_for_events(sink: &RecordingSink, n: usize) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while sink.events.lock().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn launch(
        settings: FeedSettings,
        sink: &Arc<RecordingSink>,
        predecessors: Vec<CancellationToken>,
    ) -> FeedHandle {
        let launcher = SupervisedFeedLauncher::new(settings, None, CancellationToken::new());
        let sink: Arc<dyn EventSink> = sink.clone();
        launcher.launch(LaunchRequest {
            key: SubscriptionKey::kline("BTCUSDT", "1m").unwrap(),
            sink: Arc::downgrade(&sink),
            predecessors,
        })
    }

    #[tokio::test]
    async fn disabled_upstream_serves_synthetic_data() {
        let sink = Arc::new(RecordingSink::default());
        let handle = launch(settings(false, String::new()), &sink, Vec::new());

        wait_for_events(&sink, 2).await;
        assert!(sink
            .events
            .lock()
            .iter()
            .all(|(_, origin)| *origin == FeedOrigin::Synthetic));

        let closed = handle.stop();
        tokio::time::timeout(Duration::from_secs(1), closed.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_upstream_switches_to_fallback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = Arc::new(RecordingSink::default());
        let handle = launch(settings(true, format!("ws://{addr}/ws")), &sink, Vec::new());

        wait_for_events(&sink, 1).await;
        let status = handle.status().snapshot(handle.key(), 1);
        assert_eq!(status.state, FeedState::Reconnecting);
        assert!(status.retry_count >= 1);
        assert_eq!(status.origin, Some(FeedOrigin::Synthetic));
        drop(handle);
    }

    #[tokio::test]
    async fn waits_for_predecessor_before_starting() {
        let sink = Arc::new(RecordingSink::default());
        let predecessor = CancellationToken::new();
        let _handle = launch(settings(false, String::new()), &sink, vec![predecessor.clone()]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(sink.events.lock().is_empty());

        predecessor.cancel();
        wait_for_events(&sink, 1).await;
    }

    #[tokio::test]
    async fn waits_for_every_predecessor() {
        let sink = Arc::new(RecordingSink::default());
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        let _handle = launch(
            settings(false, String::new()),
            &sink,
            vec![first.clone(), second.clone()],
        );

        second.cancel();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(sink.events.lock().is_empty());

        first.cancel();
        wait_for_events(&sink, 1).await;
    }

    #[test]
    fn child_grace_is_shorter_than_linger() {
        let defaults = FeedSettings::from_config(&MuxConfig::default());
        assert!(defaults.child_grace() < defaults.linger);

        let mut slow_close = settings(false, String::new());
        slow_close.connector.close_grace = Duration::from_secs(5);
        assert!(slow_close.child_grace() < slow_close.linger);
        assert_eq!(slow_close.child_grace(), Duration::from_millis(225));
    }
}
