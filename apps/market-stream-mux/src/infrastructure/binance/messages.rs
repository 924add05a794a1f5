//! Binance WebSocket Message Types
//!
//! Wire format types for the exchange's raw and combined market streams.
//! These types map directly to the exchange JSON schemas; conversion into
//! domain events happens in the codec.
//!
//! # Frames
//!
//! - `kline`: candle update, payload nested under `k`
//! - `24hrTicker`: rolling window ticker
//! - Combined streams wrap either frame as `{"stream": .., "data": ..}`
//! - Control replies look like `{"result": null, "id": 1}`
//! - Errors look like `{"code": 2, "msg": ".."}`
//!
//! # References
//!
//! - [WebSocket Streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

// =============================================================================
// Envelope
// =============================================================================

/// Any text frame the exchange may send on a market stream socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    /// Combined stream wrapper.
    Combined {
        /// Stream name, e.g. `btcusdt@kline_1m`.
        stream: String,
        /// Wrapped frame.
        data: StreamFrame,
    },
    /// Reply to a control request.
    Control {
        /// Request id being answered.
        id: u64,
        /// Result payload, usually null.
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    /// Exchange error.
    Error {
        /// Error code.
        code: i64,
        /// Error message.
        msg: String,
    },
    /// Bare market frame on a raw stream.
    Frame(StreamFrame),
}

/// Market data frame, discriminated by the `e` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "e")]
pub enum StreamFrame {
    /// Candle update.
    #[serde(rename = "kline")]
    Kline(KlineFrame),
    /// Rolling 24h ticker.
    #[serde(rename = "24hrTicker")]
    Ticker(TickerFrame),
}

// =============================================================================
// Kline
// =============================================================================

/// `kline` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KlineFrame {
    /// Event time.
    #[serde(rename = "E", with = "chrono::serde::ts_milliseconds")]
    pub event_time: DateTime<Utc>,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Candle payload.
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

/// Candle payload nested in a `kline` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KlinePayload {
    /// Candle open time.
    #[serde(rename = "t", with = "chrono::serde::ts_milliseconds")]
    pub open_time: DateTime<Utc>,
    /// Candle close time.
    #[serde(rename = "T", with = "chrono::serde::ts_milliseconds")]
    pub close_time: DateTime<Utc>,
    /// Interval code.
    #[serde(rename = "i")]
    pub interval: String,
    /// Open price.
    #[serde(rename = "o")]
    pub open: Decimal,
    /// Close price.
    #[serde(rename = "c")]
    pub close: Decimal,
    /// High price.
    #[serde(rename = "h")]
    pub high: Decimal,
    /// Low price.
    #[serde(rename = "l")]
    pub low: Decimal,
    /// Base asset volume.
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Whether this candle is final.
    #[serde(rename = "x")]
    pub is_closed: bool,
}

// =============================================================================
// Ticker
// =============================================================================

/// `24hrTicker` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TickerFrame {
    /// Event time.
    #[serde(rename = "E", with = "chrono::serde::ts_milliseconds")]
    pub event_time: DateTime<Utc>,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Price change percent.
    #[serde(rename = "P")]
    pub change_pct: Decimal,
    /// Last price.
    #[serde(rename = "c")]
    pub last_price: Decimal,
    /// Base asset volume.
    #[serde(rename = "v")]
    pub volume: Decimal,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const KLINE: &str = r#"{
        "e":"kline","E":1700000000123,"s":"BTCUSDT",
        "k":{"t":1700000000000,"T":1700000059999,"s":"BTCUSDT","i":"1m",
             "f":100,"L":200,"o":"65000.00","c":"65100.00","h":"65200.00",
             "l":"64950.00","v":"12.50","n":100,"x":false,"q":"0","V":"0","Q":"0","B":"0"}
    }"#;

    #[test]
    fn parses_kline_frame() {
        let Envelope::Frame(StreamFrame::Kline(frame)) = serde_json::from_str(KLINE).unwrap() else {
            panic!("expected kline frame");
        };
        assert_eq!(frame.symbol, "BTCUSDT");
        assert_eq!(frame.kline.interval, "1m");
        assert_eq!(frame.kline.close.to_string(), "65100.00");
        assert!(!frame.kline.is_closed);
        assert_eq!(frame.kline.open_time.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn parses_ticker_frame() {
        let json = r#"{"e":"24hrTicker","E":1700000000000,"s":"ETHUSDT","p":"10.0",
            "P":"0.385","w":"2600","c":"2610.50","Q":"1","o":"2600","h":"2620",
            "l":"2590","v":"12345.6","q":"0","O":0,"C":0,"F":0,"L":0,"n":0}"#;
        let Envelope::Frame(StreamFrame::Ticker(frame)) = serde_json::from_str(json).unwrap() else {
            panic!("expected ticker frame");
        };
        assert_eq!(frame.symbol, "ETHUSDT");
        assert_eq!(frame.last_price.to_string(), "2610.50");
        assert_eq!(frame.change_pct.to_string(), "0.385");
    }

    #[test]
    fn parses_combined_and_control_frames() {
        let combined = format!(r#"{{"stream":"btcusdt@kline_1m","data":{KLINE}}}"#);
        assert!(matches!(
            serde_json::from_str::<Envelope>(&combined).unwrap(),
            Envelope::Combined { ref stream, .. } if stream == "btcusdt@kline_1m"
        ));

        assert!(matches!(
            serde_json::from_str::<Envelope>(r#"{"result":null,"id":1}"#).unwrap(),
            Envelope::Control { id: 1, .. }
        ));

        assert!(matches!(
            serde_json::from_str::<Envelope>(r#"{"code":2,"msg":"Invalid request"}"#).unwrap(),
            Envelope::Error { code: 2, .. }
        ));
    }

    #[test]
    fn rejects_unknown_event_type() {
        assert!(serde_json::from_str::<Envelope>(r#"{"e":"trade","E":1,"s":"BTCUSDT"}"#).is_err());
    }
}
