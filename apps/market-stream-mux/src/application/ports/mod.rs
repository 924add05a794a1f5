//! Port Interfaces
//!
//! Contracts between the subscription lifecycle and the adapters that move
//! market data, following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`FeedLauncher`]: starts the task that produces events for one key
//! - [`SnapshotSource`]: fetches a point-in-time snapshot over REST
//!
//! ## Driver Ports (Inbound)
//!
//! - [`EventSink`]: receives events produced by a running feed

use std::sync::Weak;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::application::services::FeedHandle;
use crate::domain::market::{FeedOrigin, MarketEvent};
use crate::domain::subscription::SubscriptionKey;

// =============================================================================
// Event Sink
// =============================================================================

/// Destination for events produced by a feed.
pub trait EventSink: Send + Sync {
    /// Publish an event for `key`.
    ///
    /// Returns the number of subscribers the event was enqueued for.
    fn publish(&self, key: &SubscriptionKey, event: MarketEvent, origin: FeedOrigin) -> usize;
}

// =============================================================================
// Feed Launcher
// =============================================================================

/// Everything a launcher needs to start a feed for one key.
#[derive(Clone)]
pub struct LaunchRequest {
    /// Key to produce events for.
    pub key: SubscriptionKey,
    /// Where events go. Weak so a running feed never keeps the hub alive.
    pub sink: Weak<dyn EventSink>,
    /// Closed tokens of earlier feeds for the same key that are still
    /// tearing down. The new feed must not connect before all of them fire.
    pub predecessors: Vec<CancellationToken>,
}

impl std::fmt::Debug for LaunchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchRequest")
            .field("key", &self.key)
            .field("predecessors", &self.predecessors.len())
            .finish_non_exhaustive()
    }
}

/// Starts feeds on behalf of the registry.
///
/// `launch` must not block: it spawns the feed and returns its handle.
/// Connection failures are the feed's concern and are retried inside it.
pub trait FeedLauncher: Send + Sync {
    /// Start a feed for `request.key`.
    fn launch(&self, request: LaunchRequest) -> FeedHandle;
}

// =============================================================================
// Snapshot Source
// =============================================================================

/// Errors from a snapshot source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    /// Request could not be sent or timed out.
    #[error("snapshot request failed: {0}")]
    Http(String),

    /// Server answered with a non-success status.
    #[error("snapshot endpoint returned status {0}")]
    Status(u16),

    /// Body did not match the expected schema.
    #[error("failed to decode snapshot: {0}")]
    Decode(String),

    /// Server returned no data for the key.
    #[error("no snapshot data for {0}")]
    Empty(String),
}

/// Point-in-time market data source used by the fallback feed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the latest event for `key`.
    async fn fetch(&self, key: &SubscriptionKey) -> Result<MarketEvent, SnapshotError>;
}
