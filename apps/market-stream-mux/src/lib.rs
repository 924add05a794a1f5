#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Stream Mux - Exchange Market Data Multiplexer
//!
//! Keeps at most one upstream exchange WebSocket per subscription key
//! (`symbol:channel[:interval]`) and fans parsed ticker/kline events out to
//! every client joined to that key. When the exchange is unreachable a
//! per-key fallback feed polls REST snapshots or runs a synthetic walk.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `market`: Ticker and kline events, event origin
//!   - `subscription`: Subscription keys and client ids
//!
//! - **Application**: Lifecycle rules and port definitions
//!   - `ports`: Event sink, feed launcher, snapshot source
//!   - `services`: Reference-counted subscription registry, feed handles
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: Upstream WebSocket connector and REST snapshot client
//!   - `fallback`: Polling and synthetic feeds
//!   - `feeds`: Per-key supervisor choosing live vs fallback
//!   - `broadcast`: Per-client bounded fan-out
//!   - `mux`: Gateway-facing facade
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                         +-----------------+
//! Exchange WS (per key) ->|                 |     +--------------+---> Client 1
//!                         | FeedSupervisor  |---->| BroadcastHub |---> Client 2
//! REST / synthetic ------>|   (per key)     |     +--------------+---> Client N
//!                         +-----------------+            |
//!                                 ^   join/leave/disconnect
//!                                 |                      v
//!                           launch/stop <---- SubscriptionRegistry
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no external dependencies.
pub mod domain;

/// Application layer - Lifecycle services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{FeedOrigin, KlineEvent, MarketEvent, TickerEvent};
pub use domain::subscription::{Channel, ClientId, KeyError, SubscriptionKey};

// Application
pub use application::ports::{EventSink, FeedLauncher, LaunchRequest, SnapshotError, SnapshotSource};
pub use application::services::{
    FeedHandle, FeedState, FeedStatus, KeyStatus, RegistryError, RegistryLimits,
    SubscriptionRegistry,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, MuxConfig};

// Facade and hub
pub use infrastructure::broadcast::{BroadcastHub, ClientFeed, HubConfig, HubError, PushEvent};
pub use infrastructure::mux::{Ack, AckStatus, KeyReport, MarketDataMux, MuxError};

// Upstream adapters
pub use infrastructure::binance::BinanceRestClient;

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
