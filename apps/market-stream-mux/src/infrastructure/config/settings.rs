//! Mux Configuration Settings
//!
//! Configuration types for the mux, loaded from `STREAM_MUX_*` environment
//! variables. Every setting has a default; unparseable values fall back to
//! the default and [`MuxConfig::validate`] rejects inconsistent ones.

use std::time::Duration;

use crate::application::services::RegistryLimits;
use crate::domain::subscription::{KeyError, SubscriptionKey};

/// Upstream WebSocket settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Whether live upstream connections are attempted at all.
    pub enabled: bool,
    /// Raw stream base URL.
    pub ws_url: String,
    /// Connect attempt timeout.
    pub connect_timeout: Duration,
    /// Maximum silence on an open socket.
    pub idle_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Open duration after which backoff resets.
    pub reconnect_stable_after: Duration,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Consecutive failures before the fallback feed starts.
    pub fallback_after_attempts: u32,
    /// Time a stopping feed gets to exit before it is aborted.
    pub feed_linger: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ws_url: "wss://stream.binance.com:9443/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            reconnect_delay_initial: Duration::from_millis(5_000),
            reconnect_delay_max: Duration::from_secs(60),
            reconnect_delay_multiplier: 2.0,
            reconnect_stable_after: Duration::from_secs(60),
            max_reconnect_attempts: 0,
            fallback_after_attempts: 3,
            feed_linger: Duration::from_millis(2_000),
        }
    }
}

/// Fallback feed settings.
#[derive(Debug, Clone)]
pub struct FallbackSettings {
    /// REST API base URL.
    pub rest_url: String,
    /// Time between polls.
    pub poll_interval: Duration,
    /// REST request timeout.
    pub request_timeout: Duration,
    /// Emit a synthetic walk when REST fails.
    pub synthetic_enabled: bool,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            rest_url: "https://api.binance.com/api/v3".to_string(),
            poll_interval: Duration::from_millis(2_500),
            request_timeout: Duration::from_secs(5),
            synthetic_enabled: true,
        }
    }
}

/// Broadcast hub settings.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Outbound queue depth per client.
    pub client_queue_capacity: usize,
    /// Maximum keys one client may join.
    pub max_keys_per_client: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            client_queue_capacity: 256,
            max_keys_per_client: 64,
        }
    }
}

/// Subscription registry limits.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Maximum keys with a running feed.
    pub max_active_keys: usize,
    /// Maximum holders per key.
    pub max_subscribers_per_key: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        let limits = RegistryLimits::default();
        Self {
            max_active_keys: limits.max_active_keys,
            max_subscribers_per_key: limits.max_subscribers_per_key,
        }
    }
}

impl From<&RegistrySettings> for RegistryLimits {
    fn from(settings: &RegistrySettings) -> Self {
        Self {
            max_active_keys: settings.max_active_keys,
            max_subscribers_per_key: settings.max_subscribers_per_key,
        }
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
    /// Silence after which a key is reported stale.
    pub stale_after: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            health_port: 8082,
            stale_after: Duration::from_secs(15),
        }
    }
}

/// Complete mux configuration.
#[derive(Debug, Clone, Default)]
pub struct MuxConfig {
    /// Upstream WebSocket settings.
    pub upstream: UpstreamSettings,
    /// Fallback feed settings.
    pub fallback: FallbackSettings,
    /// Broadcast hub settings.
    pub hub: HubSettings,
    /// Registry limits.
    pub registry: RegistrySettings,
    /// Server settings.
    pub server: ServerSettings,
    /// Keys subscribed at startup by an internal client.
    pub preload: Vec<SubscriptionKey>,
}

impl MuxConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a preload key is malformed or the resulting
    /// configuration fails [`MuxConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`MuxConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let upstream_defaults = UpstreamSettings::default();
        let fallback_defaults = FallbackSettings::default();
        let hub_defaults = HubSettings::default();
        let registry_defaults = RegistrySettings::default();
        let server_defaults = ServerSettings::default();

        let upstream = UpstreamSettings {
            enabled: env.bool("STREAM_MUX_UPSTREAM_ENABLED", upstream_defaults.enabled),
            ws_url: env.string("STREAM_MUX_UPSTREAM_WS_URL", &upstream_defaults.ws_url),
            connect_timeout: env.secs(
                "STREAM_MUX_CONNECT_TIMEOUT_SECS",
                upstream_defaults.connect_timeout,
            ),
            idle_timeout: env.secs("STREAM_MUX_IDLE_TIMEOUT_SECS", upstream_defaults.idle_timeout),
            reconnect_delay_initial: env.millis(
                "STREAM_MUX_RECONNECT_DELAY_INITIAL_MS",
                upstream_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs(
                "STREAM_MUX_RECONNECT_DELAY_MAX_SECS",
                upstream_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse(
                "STREAM_MUX_RECONNECT_DELAY_MULTIPLIER",
                upstream_defaults.reconnect_delay_multiplier,
            ),
            reconnect_stable_after: env.secs(
                "STREAM_MUX_RECONNECT_STABLE_AFTER_SECS",
                upstream_defaults.reconnect_stable_after,
            ),
            max_reconnect_attempts: env.parse(
                "STREAM_MUX_MAX_RECONNECT_ATTEMPTS",
                upstream_defaults.max_reconnect_attempts,
            ),
            fallback_after_attempts: env.parse(
                "STREAM_MUX_FALLBACK_AFTER_ATTEMPTS",
                upstream_defaults.fallback_after_attempts,
            ),
            feed_linger: env.millis("STREAM_MUX_FEED_LINGER_MS", upstream_defaults.feed_linger),
        };

        let fallback = FallbackSettings {
            rest_url: env.string("STREAM_MUX_FALLBACK_REST_URL", &fallback_defaults.rest_url),
            poll_interval: env.millis(
                "STREAM_MUX_FALLBACK_POLL_INTERVAL_MS",
                fallback_defaults.poll_interval,
            ),
            request_timeout: env.secs(
                "STREAM_MUX_FALLBACK_REQUEST_TIMEOUT_SECS",
                fallback_defaults.request_timeout,
            ),
            synthetic_enabled: env.bool(
                "STREAM_MUX_FALLBACK_SYNTHETIC",
                fallback_defaults.synthetic_enabled,
            ),
        };

        let hub = HubSettings {
            client_queue_capacity: env.parse(
                "STREAM_MUX_CLIENT_QUEUE_CAPACITY",
                hub_defaults.client_queue_capacity,
            ),
            max_keys_per_client: env.parse(
                "STREAM_MUX_MAX_KEYS_PER_CLIENT",
                hub_defaults.max_keys_per_client,
            ),
        };

        let registry = RegistrySettings {
            max_active_keys: env.parse("STREAM_MUX_MAX_ACTIVE_KEYS", registry_defaults.max_active_keys),
            max_subscribers_per_key: env.parse(
                "STREAM_MUX_MAX_SUBSCRIBERS_PER_KEY",
                registry_defaults.max_subscribers_per_key,
            ),
        };

        let server = ServerSettings {
            health_port: env.parse("STREAM_MUX_HEALTH_PORT", server_defaults.health_port),
            stale_after: env.secs("STREAM_MUX_STALE_AFTER_SECS", server_defaults.stale_after),
        };

        let preload = env
            .string("STREAM_MUX_PRELOAD", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse()
                    .map_err(|source| ConfigError::InvalidPreload {
                        entry: s.to_string(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self {
            upstream,
            fallback,
            hub,
            registry,
            server,
            preload,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.upstream.enabled && self.upstream.ws_url.trim().is_empty() {
            return invalid("upstream is enabled but STREAM_MUX_UPSTREAM_WS_URL is empty");
        }
        if self.upstream.reconnect_delay_initial.is_zero() {
            return invalid("initial reconnect delay must be positive");
        }
        if self.upstream.reconnect_delay_max < self.upstream.reconnect_delay_initial {
            return invalid("max reconnect delay is below the initial delay");
        }
        if self.upstream.reconnect_delay_multiplier < 1.0 {
            return invalid("reconnect multiplier must be at least 1.0");
        }
        if self.fallback.poll_interval.is_zero() {
            return invalid("fallback poll interval must be positive");
        }
        if self.hub.client_queue_capacity == 0 {
            return invalid("client queue capacity must be positive");
        }
        if self.hub.max_keys_per_client == 0 {
            return invalid("max keys per client must be positive");
        }
        if self.registry.max_active_keys == 0 || self.registry.max_subscribers_per_key == 0 {
            return invalid("registry limits must be positive");
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A preload entry is not a valid key.
    #[error("invalid STREAM_MUX_PRELOAD entry {entry:?}: {source}")]
    InvalidPreload {
        /// Offending entry.
        entry: String,
        /// Parse failure.
        source: KeyError,
    },
    /// Settings are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: &str) -> String {
        (self.0)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.0)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        (self.0)(key).map_or(default, |v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        })
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<MuxConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        MuxConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = load(&[]).unwrap();
        assert!(config.upstream.enabled);
        assert_eq!(config.upstream.ws_url, "wss://stream.binance.com:9443/ws");
        assert_eq!(config.upstream.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.upstream.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.upstream.reconnect_delay_initial, Duration::from_secs(5));
        assert_eq!(config.upstream.reconnect_delay_max, Duration::from_secs(60));
        assert_eq!(config.upstream.fallback_after_attempts, 3);
        assert_eq!(config.fallback.poll_interval, Duration::from_millis(2_500));
        assert_eq!(config.hub.client_queue_capacity, 256);
        assert_eq!(config.registry.max_active_keys, 512);
        assert_eq!(config.server.health_port, 8082);
        assert!(config.preload.is_empty());
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let config = load(&[
            ("STREAM_MUX_UPSTREAM_ENABLED", "false"),
            ("STREAM_MUX_CLIENT_QUEUE_CAPACITY", "32"),
            ("STREAM_MUX_HEALTH_PORT", "not-a-port"),
            ("STREAM_MUX_FALLBACK_POLL_INTERVAL_MS", "100"),
        ])
        .unwrap();
        assert!(!config.upstream.enabled);
        assert_eq!(config.hub.client_queue_capacity, 32);
        assert_eq!(config.server.health_port, 8082);
        assert_eq!(config.fallback.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn preload_keys_parsed() {
        let config = load(&[("STREAM_MUX_PRELOAD", "btcusdt:kline:1m, ETHUSDT:ticker,")]).unwrap();
        assert_eq!(
            config.preload,
            vec![
                SubscriptionKey::kline("BTCUSDT", "1m").unwrap(),
                SubscriptionKey::ticker("ETHUSDT").unwrap(),
            ]
        );

        assert!(matches!(
            load(&[("STREAM_MUX_PRELOAD", "BTCUSDT:kline:9m")]),
            Err(ConfigError::InvalidPreload { .. })
        ));
    }

    #[test]
    fn validation_rejects_inconsistent_settings() {
        assert!(load(&[("STREAM_MUX_CLIENT_QUEUE_CAPACITY", "0")]).is_err());
        assert!(load(&[("STREAM_MUX_UPSTREAM_WS_URL", "")]).is_err());
        assert!(load(&[
            ("STREAM_MUX_UPSTREAM_WS_URL", ""),
            ("STREAM_MUX_UPSTREAM_ENABLED", "false"),
        ])
        .is_ok());
        assert!(load(&[
            ("STREAM_MUX_RECONNECT_DELAY_INITIAL_MS", "90000"),
            ("STREAM_MUX_RECONNECT_DELAY_MAX_SECS", "60"),
        ])
        .is_err());
    }

    #[test]
    fn registry_limits_from_settings() {
        let limits = RegistryLimits::from(&RegistrySettings::default());
        assert_eq!(limits.max_subscribers_per_key, 10_000);
    }
}
