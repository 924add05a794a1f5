//! Prometheus Metrics Module
//!
//! Exposes mux metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: upstream frames received and dropped
//! - **Events**: events published per origin and deliveries to clients
//! - **Clients**: connected clients and evictions
//! - **Feeds**: active keys, open upstream sockets, reconnects, fallbacks
//! - **Invariants**: registry consistency violations (alert on any)
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::market::FeedOrigin;
use crate::domain::subscription::Channel;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "stream_mux_frames_received_total",
        "Total frames received from upstream exchange sockets"
    );
    describe_counter!(
        "stream_mux_frames_dropped_total",
        "Total upstream frames dropped by reason"
    );

    describe_counter!(
        "stream_mux_events_published_total",
        "Total events published to the hub by origin"
    );
    describe_counter!(
        "stream_mux_deliveries_total",
        "Total events enqueued to client outboxes"
    );
    describe_histogram!(
        "stream_mux_publish_seconds",
        "Time to fan one event out to every subscriber of its key"
    );

    describe_gauge!("stream_mux_connected_clients", "Registered clients");
    describe_counter!(
        "stream_mux_client_evictions_total",
        "Clients evicted because their outbox was full or closed"
    );

    describe_gauge!(
        "stream_mux_active_keys",
        "Subscription keys with at least one holder"
    );
    describe_gauge!(
        "stream_mux_upstream_connections",
        "Open upstream WebSocket connections"
    );
    describe_counter!(
        "stream_mux_reconnects_total",
        "Total upstream reconnection attempts"
    );
    describe_counter!(
        "stream_mux_fallback_activations_total",
        "Times a feed switched to its fallback source"
    );
    describe_gauge!(
        "stream_mux_fallback_feeds",
        "Feeds currently served by a fallback source"
    );
    describe_counter!(
        "stream_mux_snapshot_requests_total",
        "REST snapshot requests by outcome"
    );

    describe_counter!(
        "stream_mux_invariant_violations_total",
        "Registry invariant violations by kind"
    );
}

// =============================================================================
// Labels
// =============================================================================

/// Why an upstream frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Frame failed to parse.
    Parse,
    /// Frame belonged to a different key.
    Mismatch,
    /// Fallback event arrived while live was open.
    Superseded,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Mismatch => "mismatch",
            Self::Superseded => "superseded",
        }
    }
}

/// Why a client was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Outbound queue was full.
    QueueFull,
    /// Receiver side was dropped.
    Closed,
}

impl EvictionReason {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
        }
    }
}

/// Kind of registry invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantKind {
    /// Holders present with no feed.
    MissingFeed,
    /// Feed present on an entry that had no holders.
    OrphanFeed,
    /// Entry removed twice or replaced underneath its owner.
    DoubleRemoval,
}

impl InvariantKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::MissingFeed => "missing_feed",
            Self::OrphanFeed => "orphan_feed",
            Self::DoubleRemoval => "double_removal",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame received from an upstream socket.
pub fn record_frame_received(channel: Channel) {
    counter!(
        "stream_mux_frames_received_total",
        "channel" => channel.as_str()
    )
    .increment(1);
}

/// Record a dropped upstream frame.
pub fn record_frame_dropped(reason: DropReason) {
    counter!(
        "stream_mux_frames_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record an event published to the hub and the number of clients reached.
pub fn record_published(origin: FeedOrigin, delivered: usize) {
    counter!(
        "stream_mux_events_published_total",
        "origin" => origin.as_str()
    )
    .increment(1);
    counter!("stream_mux_deliveries_total").increment(delivered as u64);
}

/// Record fan-out duration for one event.
pub fn record_publish_duration(duration: Duration) {
    histogram!("stream_mux_publish_seconds").record(duration.as_secs_f64());
}

/// Update the connected client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_connected_clients(count: usize) {
    gauge!("stream_mux_connected_clients").set(count as f64);
}

/// Record a client eviction.
pub fn record_eviction(reason: EvictionReason) {
    counter!(
        "stream_mux_client_evictions_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Update the active key count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_keys(count: usize) {
    gauge!("stream_mux_active_keys").set(count as f64);
}

/// Track an upstream socket opening (`+1`) or closing (`-1`).
pub fn adjust_upstream_connections(delta: f64) {
    gauge!("stream_mux_upstream_connections").increment(delta);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect(channel: Channel) {
    counter!(
        "stream_mux_reconnects_total",
        "channel" => channel.as_str()
    )
    .increment(1);
}

/// Record a switch to the fallback source.
pub fn record_fallback_activation() {
    counter!("stream_mux_fallback_activations_total").increment(1);
}

/// Track a fallback feed starting (`+1`) or stopping (`-1`).
pub fn adjust_fallback_feeds(delta: f64) {
    gauge!("stream_mux_fallback_feeds").increment(delta);
}

/// Record the outcome of a REST snapshot request.
pub fn record_snapshot_request(success: bool) {
    counter!(
        "stream_mux_snapshot_requests_total",
        "outcome" => if success { "ok" } else { "error" }
    )
    .increment(1);
}

/// Record a registry invariant violation.
pub fn record_invariant_violation(kind: InvariantKind) {
    counter!(
        "stream_mux_invariant_violations_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
