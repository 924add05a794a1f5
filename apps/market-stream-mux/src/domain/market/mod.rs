//! Market Event Types
//!
//! Typed representations of the exchange updates the mux fans out.
//! Adapters parse raw frames into these types at the connection
//! boundary; everything downstream works with [`MarketEvent`] only.
//!
//! # Wire Shape
//!
//! Events serialize with an internal `type` tag:
//!
//! ```json
//! {"type":"ticker","symbol":"BTCUSDT","price":"65100.00", ...}
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Events
// =============================================================================

/// Rolling 24h ticker update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerEvent {
    /// Upper-case exchange symbol.
    pub symbol: String,
    /// Last traded price.
    pub price: Decimal,
    /// Percent change over the rolling window.
    pub change_pct: Decimal,
    /// Base asset volume over the rolling window.
    pub volume: Decimal,
    /// Event time.
    pub ts: DateTime<Utc>,
}

/// Candle update for one interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineEvent {
    /// Upper-case exchange symbol.
    pub symbol: String,
    /// Interval code such as `1m`.
    pub interval: String,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Latest (or final) close price.
    pub close: Decimal,
    /// Base asset volume.
    pub volume: Decimal,
    /// Candle open time.
    pub open_time: DateTime<Utc>,
    /// Candle close time.
    pub close_time: DateTime<Utc>,
    /// Whether the candle is final.
    pub is_closed: bool,
    /// Event time.
    pub ts: DateTime<Utc>,
}

/// A parsed market data update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MarketEvent {
    /// Ticker update.
    Ticker(TickerEvent),
    /// Kline (candle) update.
    Kline(KlineEvent),
}

impl MarketEvent {
    /// Symbol the event belongs to.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Ticker(t) => &t.symbol,
            Self::Kline(k) => &k.symbol,
        }
    }

    /// Event timestamp.
    #[must_use]
    pub const fn ts(&self) -> DateTime<Utc> {
        match self {
            Self::Ticker(t) => t.ts,
            Self::Kline(k) => k.ts,
        }
    }

    /// Most recent price carried by the event.
    #[must_use]
    pub const fn last_price(&self) -> Decimal {
        match self {
            Self::Ticker(t) => t.price,
            Self::Kline(k) => k.close,
        }
    }
}

// =============================================================================
// Origin
// =============================================================================

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedOrigin {
    /// Live upstream WebSocket.
    Live,
    /// REST snapshot poll.
    Polled,
    /// Locally generated random walk.
    Synthetic,
}

impl FeedOrigin {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Polled => "polled",
            Self::Synthetic => "synthetic",
        }
    }
}

impl std::fmt::Display for FeedOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
