//! Synthetic Random Walk
//!
//! Last-resort price source used when neither the live socket nor the REST
//! snapshot is reachable. Each step moves the price by at most ±0.5%.
//! Kline walks keep a candle aligned to the interval grid and emit the
//! closed candle once when the grid boundary passes.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use crate::domain::market::{KlineEvent, MarketEvent, TickerEvent};
use crate::domain::subscription::SubscriptionKey;

/// Largest per-step move, in millionths (5000 = 0.5%).
const MAX_STEP_PPM: i64 = 5_000;
/// Largest wick beyond the traded price, in millionths (3000 = 0.3%).
const MAX_WICK_PPM: i64 = 3_000;

/// Starting price for symbols without a known last price.
#[must_use]
pub fn base_price(symbol: &str) -> Decimal {
    match symbol {
        "BTCUSDT" => Decimal::new(43_000, 0),
        "ETHUSDT" => Decimal::new(2_600, 0),
        "ADAUSDT" => Decimal::new(45, 2),
        "DOTUSDT" => Decimal::new(65, 1),
        _ => Decimal::ONE_HUNDRED,
    }
}

#[derive(Debug, Clone)]
struct Candle {
    open_time: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

/// Random walk generator for one key.
#[derive(Debug)]
pub struct SyntheticWalk {
    key: SubscriptionKey,
    rng: StdRng,
    price: Decimal,
    session_open: Decimal,
    volume: Decimal,
    candle: Option<Candle>,
}

impl SyntheticWalk {
    /// Walk seeded from `last_price`, or the symbol's base price.
    #[must_use]
    pub fn new(key: SubscriptionKey, last_price: Option<Decimal>) -> Self {
        Self::with_rng(key, last_price, StdRng::from_os_rng())
    }

    /// Walk with an explicit RNG.
    #[must_use]
    pub fn with_rng(key: SubscriptionKey, last_price: Option<Decimal>, rng: StdRng) -> Self {
        let price = last_price
            .filter(|p| p.is_sign_positive() && !p.is_zero())
            .unwrap_or_else(|| base_price(key.symbol()));
        Self {
            key,
            rng,
            price,
            session_open: price,
            volume: Decimal::ZERO,
            candle: None,
        }
    }

    /// Current walk price.
    #[must_use]
    pub const fn price(&self) -> Decimal {
        self.price
    }

    /// Move the walk to a price observed elsewhere.
    pub fn seed(&mut self, price: Decimal) {
        if price.is_sign_positive() && !price.is_zero() {
            self.price = price;
        }
    }

    /// Advance one step and produce the resulting event.
    pub fn step(&mut self, now: DateTime<Utc>) -> MarketEvent {
        let tick_volume = Decimal::from(self.rng.random_range(100_u32..=1_000));
        match self.key.interval_duration() {
            Some(interval) => self.step_kline(now, interval, tick_volume),
            None => self.step_ticker(now, tick_volume),
        }
    }

    fn walk(&mut self) -> Decimal {
        let ppm = self.rng.random_range(-MAX_STEP_PPM..=MAX_STEP_PPM);
        self.price = (self.price * (Decimal::ONE + Decimal::new(ppm, 6))).round_dp(8);
        self.price
    }

    fn wick(&mut self, price: Decimal, up: bool) -> Decimal {
        let ppm = self.rng.random_range(0..=MAX_WICK_PPM);
        let factor = Decimal::new(ppm, 6);
        let adjusted = if up {
            price * (Decimal::ONE + factor)
        } else {
            price * (Decimal::ONE - factor)
        };
        adjusted.round_dp(8)
    }

    fn step_ticker(&mut self, now: DateTime<Utc>, tick_volume: Decimal) -> MarketEvent {
        let price = self.walk();
        self.volume += tick_volume;
        let change_pct = ((price - self.session_open) / self.session_open * Decimal::ONE_HUNDRED)
            .round_dp(3);

        MarketEvent::Ticker(TickerEvent {
            symbol: self.key.symbol().to_string(),
            price,
            change_pct,
            volume: self.volume,
            ts: now,
        })
    }

    fn step_kline(
        &mut self,
        now: DateTime<Utc>,
        interval: std::time::Duration,
        tick_volume: Decimal,
    ) -> MarketEvent {
        let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1);
        let bucket_ms = now.timestamp_millis().div_euclid(interval_ms) * interval_ms;
        let bucket = DateTime::from_timestamp_millis(bucket_ms).unwrap_or(now);

        if let Some(candle) = self.candle.take_if(|c| c.open_time != bucket) {
            // Boundary crossed: publish the finished candle once.
            return self.kline_event(&candle, interval_ms, true, now);
        }

        let price = self.walk();
        let high = self.wick(price, true);
        let low = self.wick(price, false);

        let candle = self.candle.get_or_insert_with(|| Candle {
            open_time: bucket,
            open: price,
            high,
            low,
            close: price,
            volume: Decimal::ZERO,
        });
        candle.high = candle.high.max(high);
        candle.low = candle.low.min(low);
        candle.close = price;
        candle.volume += tick_volume;

        let candle = candle.clone();
        self.kline_event(&candle, interval_ms, false, now)
    }

    fn kline_event(
        &self,
        candle: &Candle,
        interval_ms: i64,
        is_closed: bool,
        now: DateTime<Utc>,
    ) -> MarketEvent {
        MarketEvent::Kline(KlineEvent {
            symbol: self.key.symbol().to_string(),
            interval: self.key.interval().unwrap_or_default().to_string(),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            open_time: candle.open_time,
            close_time: candle.open_time + ChronoDuration::milliseconds(interval_ms - 1),
            is_closed,
            ts: now,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
