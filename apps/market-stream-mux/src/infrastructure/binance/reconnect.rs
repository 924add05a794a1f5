//! Reconnection Policy
//!
//! Exponential backoff with jitter for upstream reconnection. A connection
//! that stayed open for at least `stable_after` resets the policy, so a
//! socket that drops after hours of service reconnects at the base delay
//! instead of inheriting an old, inflated one.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::infrastructure::config::UpstreamSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Jitter factor as a fraction (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Maximum number of consecutive attempts (0 = unlimited).
    pub max_attempts: u32,
    /// Open duration after which the backoff resets.
    pub stable_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
            stable_after: Duration::from_secs(60),
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from [`UpstreamSettings`].
    #[must_use]
    pub const fn from_upstream_settings(settings: &UpstreamSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: settings.max_reconnect_attempts,
            stable_after: settings.reconnect_stable_after,
        }
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use market_stream_mux::infrastructure::binance::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Instant;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// // First failure
/// assert!(policy.next_delay(Instant::now()).is_some());
///
/// // Connection opened again
/// policy.mark_open(Instant::now());
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
    opened_at: Option<Instant>,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
            opened_at: None,
        }
    }

    /// Record that a connection opened at `now`.
    pub const fn mark_open(&mut self, now: Instant) {
        self.opened_at = Some(now);
    }

    /// Delay before the next attempt after a failure observed at `now`.
    ///
    /// Resets first if the failed connection had been open for at least
    /// `stable_after`. Returns `None` once max attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        if let Some(opened_at) = self.opened_at.take()
            && now.saturating_duration_since(opened_at) >= self.config.stable_after
        {
            self.reset();
        }

        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            return None;
        }

        self.attempt_count += 1;

        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay_with_jitter)
    }

    /// Reset to the initial delay.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Consecutive failed attempts since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial_ms: u64, max_ms: u64) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 0,
            stable_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(5));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!((config.jitter_factor - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.stable_after, Duration::from_secs(60));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let mut policy = ReconnectPolicy::new(config(5_000, 60_000));
        let now = Instant::now();

        let delays: Vec<_> = (0..6).map(|_| policy.next_delay(now).unwrap()).collect();
        let secs: Vec<_> = delays.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![5, 10, 20, 40, 60, 60]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn short_open_period_keeps_backoff() {
        let mut policy = ReconnectPolicy::new(config(100, 10_000));
        let start = Instant::now();

        let _ = policy.next_delay(start);
        let _ = policy.next_delay(start);
        policy.mark_open(start);
        let d = policy.next_delay(start + Duration::from_secs(5)).unwrap();
        assert_eq!(d, Duration::from_millis(400));
        assert_eq!(policy.attempt_count(), 3);
    }

    #[test]
    fn stable_open_period_resets_backoff() {
        let mut policy = ReconnectPolicy::new(config(100, 10_000));
        let start = Instant::now();

        let _ = policy.next_delay(start);
        let _ = policy.next_delay(start);
        policy.mark_open(start);
        let d = policy.next_delay(start + Duration::from_secs(61)).unwrap();
        assert_eq!(d, Duration::from_millis(100));
        assert_eq!(policy.attempt_count(), 1);
    }

    #[test]
    fn max_attempts_exhausts() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            max_attempts: 2,
            ..config(100, 1_000)
        });
        let now = Instant::now();

        assert!(policy.next_delay(now).is_some());
        assert!(policy.next_delay(now).is_some());
        assert!(policy.next_delay(now).is_none());

        policy.reset();
        assert!(policy.next_delay(now).is_some());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            jitter_factor: 0.1,
            ..config(1_000, 10_000)
        });

        for _ in 0..50 {
            policy.reset();
            let d = policy.next_delay(Instant::now()).unwrap();
            assert!(d >= Duration::from_millis(900) && d <= Duration::from_millis(1_100));
        }
    }
}
