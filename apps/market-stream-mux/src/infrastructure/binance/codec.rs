//! Frame Codec
//!
//! Turns exchange text frames into [`MarketEvent`]s for one subscription key.
//! A codec is bound to its key so frames for any other stream are rejected
//! at the boundary instead of leaking to the wrong subscribers.

use crate::domain::market::{KlineEvent, MarketEvent, TickerEvent};
use crate::domain::subscription::{Channel, SubscriptionKey};

use super::messages::{Envelope, KlineFrame, StreamFrame, TickerFrame};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame belongs to a different stream.
    #[error("frame for {got} on stream {expected}")]
    Mismatch {
        /// Stream the codec is bound to.
        expected: String,
        /// Stream the frame claims to be for.
        got: String,
    },

    /// Exchange reported an error.
    #[error("exchange error {code}: {msg}")]
    Exchange {
        /// Error code.
        code: i64,
        /// Error message.
        msg: String,
    },

    /// Frame parsed but its values are inconsistent.
    #[error("invalid frame: {0}")]
    InvalidFormat(String),
}

/// Decoder for one key's stream.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    key: SubscriptionKey,
    stream: String,
}

impl FrameCodec {
    /// Create a codec bound to `key`.
    #[must_use]
    pub fn new(key: SubscriptionKey) -> Self {
        let stream = key.stream_name();
        Self { key, stream }
    }

    /// Decode a text frame.
    ///
    /// Returns `Ok(None)` for control replies that carry no market data.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is malformed, inconsistent, reports an
    /// exchange error, or belongs to another stream.
    pub fn decode(&self, text: &str) -> Result<Option<MarketEvent>, CodecError> {
        match serde_json::from_str::<Envelope>(text.trim())? {
            Envelope::Control { id, .. } => {
                tracing::trace!(id, "Ignoring control reply");
                Ok(None)
            }
            Envelope::Error { code, msg } => Err(CodecError::Exchange { code, msg }),
            Envelope::Combined { stream, data } => {
                if stream != self.stream {
                    return Err(self.mismatch(stream));
                }
                self.convert(data).map(Some)
            }
            Envelope::Frame(frame) => self.convert(frame).map(Some),
        }
    }

    fn convert(&self, frame: StreamFrame) -> Result<MarketEvent, CodecError> {
        match (frame, self.key.channel()) {
            (StreamFrame::Kline(kline), Channel::Kline) => self.convert_kline(kline),
            (StreamFrame::Ticker(ticker), Channel::Ticker) => self.convert_ticker(ticker),
            (StreamFrame::Kline(kline), Channel::Ticker) => Err(self.mismatch(format!(
                "{}@kline_{}",
                kline.symbol.to_ascii_lowercase(),
                kline.kline.interval
            ))),
            (StreamFrame::Ticker(ticker), Channel::Kline) => Err(self.mismatch(format!(
                "{}@ticker",
                ticker.symbol.to_ascii_lowercase()
            ))),
        }
    }

    fn convert_kline(&self, frame: KlineFrame) -> Result<MarketEvent, CodecError> {
        let k = frame.kline;
        if !frame.symbol.eq_ignore_ascii_case(self.key.symbol())
            || self.key.interval() != Some(k.interval.as_str())
        {
            return Err(self.mismatch(format!(
                "{}@kline_{}",
                frame.symbol.to_ascii_lowercase(),
                k.interval
            )));
        }
        if k.high < k.low {
            return Err(CodecError::InvalidFormat(format!(
                "high {} below low {}",
                k.high, k.low
            )));
        }

        Ok(MarketEvent::Kline(KlineEvent {
            symbol: self.key.symbol().to_string(),
            interval: k.interval,
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            volume: k.volume,
            open_time: k.open_time,
            close_time: k.close_time,
            is_closed: k.is_closed,
            ts: frame.event_time,
        }))
    }

    fn convert_ticker(&self, frame: TickerFrame) -> Result<MarketEvent, CodecError> {
        if !frame.symbol.eq_ignore_ascii_case(self.key.symbol()) {
            return Err(self.mismatch(format!("{}@ticker", frame.symbol.to_ascii_lowercase())));
        }

        Ok(MarketEvent::Ticker(TickerEvent {
            symbol: self.key.symbol().to_string(),
            price: frame.last_price,
            change_pct: frame.change_pct,
            volume: frame.volume,
            ts: frame.event_time,
        }))
    }

    fn mismatch(&self, got: String) -> CodecError {
        CodecError::Mismatch {
            expected: self.stream.clone(),
            got,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn kline_frame(symbol: &str, interval: &str, high: &str, low: &str) -> String {
        format!(
            r#"{{"e":"kline","E":1700000000123,"s":"{symbol}","k":{{"t":1700000000000,
            "T":1700000059999,"s":"{symbol}","i":"{interval}","o":"65000.00","c":"65100.00",
            "h":"{high}","l":"{low}","v":"12.5","x":false}}}}"#
        )
    }

    fn kline_codec() -> FrameCodec {
        FrameCodec::new(SubscriptionKey::kline("BTCUSDT", "1m").unwrap())
    }

    #[test]
    fn decodes_kline_for_bound_key() {
        let event = kline_codec()
            .decode(&kline_frame("BTCUSDT", "1m", "65200.00", "64950.00"))
            .unwrap()
            .unwrap();

        let MarketEvent::Kline(kline) = event else {
            panic!("expected kline");
        };
        assert_eq!(kline.close, Decimal::from_str("65100.00").unwrap());
        assert!(!kline.is_closed);
        assert_eq!(kline.interval, "1m");
    }

    #[test]
    fn decodes_combined_wrapper() {
        let text = format!(
            r#"{{"stream":"btcusdt@kline_1m","data":{}}}"#,
            kline_frame("BTCUSDT", "1m", "65200.00", "64950.00")
        );
        assert!(kline_codec().decode(&text).unwrap().is_some());

        let wrong = format!(
            r#"{{"stream":"ethusdt@kline_1m","data":{}}}"#,
            kline_frame("BTCUSDT", "1m", "65200.00", "64950.00")
        );
        assert!(matches!(
            kline_codec().decode(&wrong),
            Err(CodecError::Mismatch { .. })
        ));
    }

    #[test]
    fn control_reply_yields_nothing() {
        assert!(kline_codec().decode(r#"{"result":null,"id":7}"#).unwrap().is_none());
    }

    #[test]
    fn rejects_other_symbol_or_interval() {
        let codec = kline_codec();
        assert!(matches!(
            codec.decode(&kline_frame("ETHUSDT", "1m", "2", "1")),
            Err(CodecError::Mismatch { .. })
        ));
        assert!(matches!(
            codec.decode(&kline_frame("BTCUSDT", "5m", "2", "1")),
            Err(CodecError::Mismatch { .. })
        ));
    }

    #[test]
    fn rejects_ticker_on_kline_stream() {
        let text = r#"{"e":"24hrTicker","E":1,"s":"BTCUSDT","P":"1","c":"1","v":"1"}"#;
        assert!(matches!(
            kline_codec().decode(text),
            Err(CodecError::Mismatch { .. })
        ));
    }

    #[test]
    fn rejects_inverted_candle() {
        assert!(matches!(
            kline_codec().decode(&kline_frame("BTCUSDT", "1m", "1.0", "2.0")),
            Err(CodecError::InvalidFormat(_))
        ));
    }

    #[test]
    fn surfaces_exchange_errors_and_garbage() {
        assert!(matches!(
            kline_codec().decode(r#"{"code":-1121,"msg":"Invalid symbol."}"#),
            Err(CodecError::Exchange { code: -1121, .. })
        ));
        assert!(matches!(kline_codec().decode("not json"), Err(CodecError::Json(_))));
    }

    #[test]
    fn decodes_ticker() {
        let codec = FrameCodec::new(SubscriptionKey::ticker("ethusdt").unwrap());
        let text = r#"{"e":"24hrTicker","E":1700000000000,"s":"ETHUSDT","P":"-1.5","c":"2600.10","v":"99"}"#;
        let Some(MarketEvent::Ticker(ticker)) = codec.decode(text).unwrap() else {
            panic!("expected ticker");
        };
        assert_eq!(ticker.symbol, "ETHUSDT");
        assert_eq!(ticker.price, Decimal::from_str("2600.10").unwrap());
    }
}
