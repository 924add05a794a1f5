//! Subscription Keys
//!
//! Domain types that identify what a client is listening to.
//!
//! # Design
//!
//! A [`SubscriptionKey`] is the unit of sharing: every client that asks for
//! the same `(symbol, channel, interval)` shares one upstream feed. Keys are
//! canonicalized on creation so that `btcusdt`, ` BTCUSDT ` and `BTCUSDT`
//! collapse to the same map entry:
//!
//! - symbols are trimmed and upper-cased, and must be ASCII alphanumeric
//! - kline keys require a valid exchange interval
//! - ticker keys never carry an interval; a supplied one is discarded

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Error Type
// =============================================================================

/// Errors produced while building a subscription key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Symbol was empty after trimming.
    #[error("symbol must not be empty")]
    EmptySymbol,

    /// Symbol contained characters other than ASCII letters and digits.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Channel name was not recognized.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// Kline subscription without an interval.
    #[error("kline subscriptions require an interval")]
    MissingInterval,

    /// Interval is not one the exchange publishes.
    #[error("unsupported interval: {0}")]
    InvalidInterval(String),

    /// Textual key was not `SYMBOL:channel[:interval]`.
    #[error("malformed key: {0}")]
    Malformed(String),
}

// =============================================================================
// Channel
// =============================================================================

/// Kind of market data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Rolling 24h ticker.
    Ticker,
    /// Candles for a fixed interval.
    Kline,
}

impl Channel {
    /// Lower-case channel name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Kline => "kline",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ticker" => Ok(Self::Ticker),
            "kline" | "candle" | "candles" => Ok(Self::Kline),
            other => Err(KeyError::UnknownChannel(other.to_string())),
        }
    }
}

// =============================================================================
// Intervals
// =============================================================================

/// Interval codes published by the exchange with their nominal length.
///
/// `1M` is case-sensitive and approximated as 30 days.
const INTERVALS: &[(&str, u64)] = &[
    ("1s", 1),
    ("1m", 60),
    ("3m", 3 * 60),
    ("5m", 5 * 60),
    ("15m", 15 * 60),
    ("30m", 30 * 60),
    ("1h", 3600),
    ("2h", 2 * 3600),
    ("4h", 4 * 3600),
    ("6h", 6 * 3600),
    ("8h", 8 * 3600),
    ("12h", 12 * 3600),
    ("1d", 86_400),
    ("3d", 3 * 86_400),
    ("1w", 7 * 86_400),
    ("1M", 30 * 86_400),
];

/// Nominal duration of an interval code, if the code is valid.
#[must_use]
pub fn interval_duration(interval: &str) -> Option<Duration> {
    INTERVALS
        .iter()
        .find(|(code, _)| *code == interval)
        .map(|(_, secs)| Duration::from_secs(*secs))
}

// =============================================================================
// Subscription Key
// =============================================================================

/// Canonical identity of one shared market data stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawKey")]
pub struct SubscriptionKey {
    symbol: String,
    channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interval: Option<String>,
}

impl SubscriptionKey {
    /// Build a canonical key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the symbol is empty or not alphanumeric, or
    /// if a kline key has a missing or unsupported interval.
    pub fn new(symbol: &str, channel: Channel, interval: Option<&str>) -> Result<Self, KeyError> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(KeyError::EmptySymbol);
        }
        if !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(KeyError::InvalidSymbol(symbol.to_string()));
        }

        let interval = match channel {
            Channel::Ticker => None,
            Channel::Kline => {
                let code = interval
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or(KeyError::MissingInterval)?;
                if interval_duration(code).is_none() {
                    return Err(KeyError::InvalidInterval(code.to_string()));
                }
                Some(code.to_string())
            }
        };

        Ok(Self {
            symbol: symbol.to_ascii_uppercase(),
            channel,
            interval,
        })
    }

    /// Ticker key for a symbol.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the symbol is invalid.
    pub fn ticker(symbol: &str) -> Result<Self, KeyError> {
        Self::new(symbol, Channel::Ticker, None)
    }

    /// Kline key for a symbol and interval.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the symbol or interval is invalid.
    pub fn kline(symbol: &str, interval: &str) -> Result<Self, KeyError> {
        Self::new(symbol, Channel::Kline, Some(interval))
    }

    /// Upper-case symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Stream channel.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Interval code for kline keys.
    #[must_use]
    pub fn interval(&self) -> Option<&str> {
        self.interval.as_deref()
    }

    /// Candle length for kline keys.
    #[must_use]
    pub fn interval_duration(&self) -> Option<Duration> {
        self.interval.as_deref().and_then(interval_duration)
    }

    /// Exchange raw stream name, e.g. `btcusdt@kline_1m` or `btcusdt@ticker`.
    #[must_use]
    pub fn stream_name(&self) -> String {
        let symbol = self.symbol.to_ascii_lowercase();
        match (&self.channel, &self.interval) {
            (Channel::Kline, Some(interval)) => format!("{symbol}@kline_{interval}"),
            _ => format!("{symbol}@ticker"),
        }
    }
}

/// Unvalidated key as it arrives from a client.
#[derive(Deserialize)]
struct RawKey {
    symbol: String,
    channel: Channel,
    #[serde(default)]
    interval: Option<String>,
}

impl TryFrom<RawKey> for SubscriptionKey {
    type Error = KeyError;

    fn try_from(raw: RawKey) -> Result<Self, Self::Error> {
        Self::new(&raw.symbol, raw.channel, raw.interval.as_deref())
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.interval {
            Some(interval) => write!(f, "{}:{}:{interval}", self.symbol, self.channel),
            None => write!(f, "{}:{}", self.symbol, self.channel),
        }
    }
}

impl FromStr for SubscriptionKey {
    type Err = KeyError;

    /// Parse `SYMBOL:channel[:interval]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let (Some(symbol), Some(channel)) = (parts.next(), parts.next()) else {
            return Err(KeyError::Malformed(s.to_string()));
        };
        let interval = parts.next();
        if parts.next().is_some() {
            return Err(KeyError::Malformed(s.to_string()));
        }
        Self::new(symbol, channel.parse()?, interval)
    }
}

// =============================================================================
// Client Identity
// =============================================================================

/// Opaque identifier for one connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Tests
// =============================================================================
