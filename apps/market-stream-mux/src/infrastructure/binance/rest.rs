//! REST Snapshot Client
//!
//! Fetches point-in-time market data over the exchange's public REST API.
//! Used by the fallback feed while no live socket is available.
//!
//! # Endpoints
//!
//! - `GET {base}/ticker/24hr?symbol=BTCUSDT`
//! - `GET {base}/klines?symbol=BTCUSDT&interval=1m&limit=1`

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::{self, DeserializeOwned, IgnoredAny, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::application::ports::{SnapshotError, SnapshotSource};
use crate::domain::market::{KlineEvent, MarketEvent, TickerEvent};
use crate::domain::subscription::{Channel, SubscriptionKey};
use crate::infrastructure::metrics;

// =============================================================================
// Response Types
// =============================================================================

/// `/ticker/24hr` response body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    last_price: Decimal,
    price_change_percent: Decimal,
    volume: Decimal,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    close_time: DateTime<Utc>,
}

/// One `/klines` row: `[openTime, open, high, low, close, volume, closeTime, ...]`.
#[derive(Debug)]
struct KlineRow {
    open_time: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    close_time: DateTime<Utc>,
}

impl<'de> Deserialize<'de> for KlineRow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = KlineRow;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a kline row array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<KlineRow, A::Error> {
                fn millis<E: de::Error>(ms: i64) -> Result<DateTime<Utc>, E> {
                    DateTime::from_timestamp_millis(ms)
                        .ok_or_else(|| E::custom(format!("timestamp out of range: {ms}")))
                }
                fn next<'de, T: Deserialize<'de>, A: SeqAccess<'de>>(
                    seq: &mut A,
                    index: usize,
                ) -> Result<T, A::Error> {
                    seq.next_element()?
                        .ok_or_else(|| de::Error::invalid_length(index, &"at least 7 elements"))
                }

                let row = KlineRow {
                    open_time: millis(next(&mut seq, 0)?)?,
                    open: next(&mut seq, 1)?,
                    high: next(&mut seq, 2)?,
                    low: next(&mut seq, 3)?,
                    close: next(&mut seq, 4)?,
                    volume: next(&mut seq, 5)?,
                    close_time: millis(next(&mut seq, 6)?)?,
                };
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(row)
            }
        }

        deserializer.deserialize_seq(RowVisitor)
    }
}

// =============================================================================
// Client
// =============================================================================

/// REST snapshot client.
#[derive(Debug, Clone)]
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
}

impl BinanceRestClient {
    /// Create a client for `base_url` (e.g. `https://api.binance.com/api/v3`).
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SnapshotError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SnapshotError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SnapshotError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| SnapshotError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SnapshotError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SnapshotError::Http(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| SnapshotError::Decode(e.to_string()))
    }

    async fn fetch_ticker(&self, key: &SubscriptionKey) -> Result<MarketEvent, SnapshotError> {
        let ticker: Ticker24h = self
            .get("/ticker/24hr", &[("symbol", key.symbol())])
            .await?;

        Ok(MarketEvent::Ticker(TickerEvent {
            symbol: key.symbol().to_string(),
            price: ticker.last_price,
            change_pct: ticker.price_change_percent,
            volume: ticker.volume,
            ts: ticker.close_time,
        }))
    }

    async fn fetch_kline(&self, key: &SubscriptionKey) -> Result<MarketEvent, SnapshotError> {
        let interval = key.interval().unwrap_or_default();
        let rows: Vec<KlineRow> = self
            .get(
                "/klines",
                &[("symbol", key.symbol()), ("interval", interval), ("limit", "1")],
            )
            .await?;
        let row = rows
            .into_iter()
            .next_back()
            .ok_or_else(|| SnapshotError::Empty(key.to_string()))?;

        let now = Utc::now();
        Ok(MarketEvent::Kline(KlineEvent {
            symbol: key.symbol().to_string(),
            interval: interval.to_string(),
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            open_time: row.open_time,
            close_time: row.close_time,
            is_closed: row.close_time < now,
            ts: now,
        }))
    }
}

#[async_trait]
impl SnapshotSource for BinanceRestClient {
    async fn fetch(&self, key: &SubscriptionKey) -> Result<MarketEvent, SnapshotError> {
        let result = match key.channel() {
            Channel::Ticker => self.fetch_ticker(key).await,
            Channel::Kline => self.fetch_kline(key).await,
        };
        metrics::record_snapshot_request(result.is_ok());
        result
    }
}

// =============================================================================
// Tests
// =============================================================================
