//! Feed Handles
//!
//! A [`FeedHandle`] owns the task producing events for one key. Stopping a
//! handle never blocks the caller: it cancels the task and returns a
//! *closed* token that fires once the task has exited (or was aborted after
//! the linger window).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::market::FeedOrigin;
use crate::domain::subscription::SubscriptionKey;

// =============================================================================
// Feed State
// =============================================================================

/// Connection state of a key's feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    /// Establishing the first connection.
    Connecting,
    /// Live upstream socket open.
    Open,
    /// Waiting out backoff after a failure.
    Reconnecting,
    /// Task exited.
    Closed,
}

/// Shared, lock-light status of one feed.
#[derive(Debug)]
pub struct FeedStatus {
    state: RwLock<FeedState>,
    origin: RwLock<Option<FeedOrigin>>,
    retry_count: AtomicU32,
    events: AtomicU64,
    last_event: RwLock<Option<(DateTime<Utc>, Decimal)>>,
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedStatus {
    /// Status of a feed that has not connected yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FeedState::Connecting),
            origin: RwLock::new(None),
            retry_count: AtomicU32::new(0),
            events: AtomicU64::new(0),
            last_event: RwLock::new(None),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> FeedState {
        *self.state.read()
    }

    /// Update the state.
    pub fn set_state(&self, state: FeedState) {
        *self.state.write() = state;
    }

    /// Update the consecutive retry count.
    pub fn set_retry_count(&self, retries: u32) {
        self.retry_count.store(retries, Ordering::Relaxed);
    }

    /// Origin of the most recent event.
    #[must_use]
    pub fn origin(&self) -> Option<FeedOrigin> {
        *self.origin.read()
    }

    /// Record an event that was forwarded to subscribers.
    pub fn record_event(&self, origin: FeedOrigin, at: DateTime<Utc>, price: Decimal) {
        self.events.fetch_add(1, Ordering::Relaxed);
        *self.origin.write() = Some(origin);
        *self.last_event.write() = Some((at, price));
    }

    /// Time the most recent event was forwarded.
    #[must_use]
    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.last_event.read().map(|(at, _)| at)
    }

    /// Build a status snapshot for `key`.
    #[must_use]
    pub fn snapshot(&self, key: &SubscriptionKey, holders: usize) -> KeyStatus {
        let last = *self.last_event.read();
        KeyStatus {
            key: key.clone(),
            state: self.state(),
            origin: self.origin(),
            holders,
            retry_count: self.retry_count.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            last_event_at: last.map(|(at, _)| at),
            last_price: last.map(|(_, price)| price),
        }
    }
}

/// Point-in-time view of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
    /// Subscription key.
    pub key: SubscriptionKey,
    /// Feed connection state.
    pub state: FeedState,
    /// Origin of the latest event, if any.
    pub origin: Option<FeedOrigin>,
    /// Number of clients holding the key.
    pub holders: usize,
    /// Consecutive failed connection attempts.
    pub retry_count: u32,
    /// Events forwarded since the feed started.
    pub events: u64,
    /// Time of the latest event.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Latest price seen.
    pub last_price: Option<Decimal>,
}

impl KeyStatus {
    /// Whether no event arrived within `stale_after` of `now`.
    ///
    /// A key that never produced an event is stale.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let Some(at) = self.last_event_at else {
            return true;
        };
        chrono::Duration::from_std(stale_after).is_ok_and(|limit| now - at > limit)
    }
}

// =============================================================================
// Feed Handle
// =============================================================================

/// Owner of one feed task.
///
/// Dropping a handle without calling [`FeedHandle::stop`] still tears the
/// task down.
#[derive(Debug)]
pub struct FeedHandle {
    key: SubscriptionKey,
    cancel: CancellationToken,
    closed: CancellationToken,
    status: Arc<FeedStatus>,
    task: Option<JoinHandle<()>>,
    linger: Duration,
    stopped: bool,
}

impl FeedHandle {
    /// Spawn `feed` and take ownership of it.
    ///
    /// `cancel` must be the token `feed` observes.
    pub fn spawn<F>(
        key: SubscriptionKey,
        status: Arc<FeedStatus>,
        cancel: CancellationToken,
        linger: Duration,
        feed: F,
    ) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(feed);
        Self {
            key,
            cancel,
            closed: CancellationToken::new(),
            status,
            task: Some(task),
            linger,
            stopped: false,
        }
    }

    /// A handle with no task behind it. Stopping it closes immediately.
    #[must_use]
    pub fn detached(key: SubscriptionKey, status: Arc<FeedStatus>) -> Self {
        Self {
            key,
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            status,
            task: None,
            linger: Duration::ZERO,
            stopped: false,
        }
    }

    /// Key this feed produces events for.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Shared status.
    #[must_use]
    pub const fn status(&self) -> &Arc<FeedStatus> {
        &self.status
    }

    /// Whether the feed has been asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal the feed to stop and return its closed token.
    ///
    /// The task gets `linger` to exit on its own before it is aborted.
    #[must_use = "the closed token is the only way to observe teardown"]
    pub fn stop(mut self) -> CancellationToken {
        self.teardown()
    }

    fn teardown(&mut self) -> CancellationToken {
        self.stopped = true;
        self.cancel.cancel();
        let closed = self.closed.clone();
        let status = Arc::clone(&self.status);

        let Some(mut task) = self.task.take() else {
            status.set_state(FeedState::Closed);
            closed.cancel();
            return self.closed.clone();
        };

        let linger = self.linger;
        let key = self.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if tokio::time::timeout(linger, &mut task).await.is_err() {
                        tracing::warn!(%key, linger_ms = linger.as_millis(), "Feed did not exit in time, aborting");
                        task.abort();
                        let _ = task.await;
                    }
                    status.set_state(FeedState::Closed);
                    closed.cancel();
                });
            }
            Err(_) => {
                task.abort();
                status.set_state(FeedState::Closed);
                closed.cancel();
            }
        }

        self.closed.clone()
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.teardown();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
