//! Upstream Connector
//!
//! Owns exactly one exchange WebSocket for one [`SubscriptionKey`], parses
//! its frames into [`MarketEvent`]s, and reconnects with backoff on failure.
//!
//! # Stream URL
//!
//! `{base_url}/{stream_name}`, e.g.
//! `wss://stream.binance.com:9443/ws/btcusdt@kline_1m`
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──► Open ──► (failure) ──► Reconnecting ──► Connecting ...
//!      │                                                       │
//!      └──────────────── cancel ──► Closed ◄───────────────────┘
//! ```
//!
//! The connector never synthesizes data. Gaps while reconnecting are
//! visible to the supervisor as [`UpstreamEvent::Reconnecting`].

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, FrameCodec};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::domain::market::MarketEvent;
use crate::domain::subscription::SubscriptionKey;
use crate::infrastructure::config::UpstreamSettings;
use crate::infrastructure::metrics::{self, DropReason};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the upstream connector.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Connect attempt did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// No frame arrived within the idle window.
    #[error("no frames for {0:?}")]
    IdleTimeout(Duration),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Server closed the connection.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

// =============================================================================
// Events
// =============================================================================

/// Events emitted by the connector to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Starting a connection attempt.
    Connecting {
        /// Consecutive failures before this attempt.
        attempt: u32,
    },
    /// Socket is open and streaming.
    Open,
    /// Connection failed; waiting before the next attempt.
    Reconnecting {
        /// Consecutive failures so far.
        attempt: u32,
        /// Backoff before the next attempt.
        delay: Duration,
    },
    /// Parsed market event.
    Market(MarketEvent),
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for an upstream connector.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Raw stream base URL without a trailing slash.
    pub base_url: String,
    /// Connect attempt timeout.
    pub connect_timeout: Duration,
    /// Maximum silence before the socket is considered dead.
    pub idle_timeout: Duration,
    /// Time allowed for the close handshake on cancel.
    pub close_grace: Duration,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://stream.binance.com:9443/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            close_grace: Duration::from_secs(1),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ConnectorConfig {
    /// Create configuration from [`UpstreamSettings`].
    #[must_use]
    pub fn from_upstream_settings(settings: &UpstreamSettings) -> Self {
        Self {
            base_url: settings.ws_url.trim_end_matches('/').to_string(),
            connect_timeout: settings.connect_timeout,
            idle_timeout: settings.idle_timeout,
            close_grace: settings.feed_linger / 2,
            reconnect: ReconnectConfig::from_upstream_settings(settings),
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Single-key exchange WebSocket client.
pub struct UpstreamConnector {
    config: ConnectorConfig,
    key: SubscriptionKey,
    codec: FrameCodec,
    event_tx: mpsc::Sender<UpstreamEvent>,
    cancel: CancellationToken,
}

impl UpstreamConnector {
    /// Create a new connector.
    #[must_use]
    pub fn new(
        config: ConnectorConfig,
        key: SubscriptionKey,
        event_tx: mpsc::Sender<UpstreamEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            codec: FrameCodec::new(key.clone()),
            config,
            key,
            event_tx,
            cancel,
        }
    }

    /// Full stream URL for this key.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}/{}", self.config.base_url, self.key.stream_name())
    }

    /// Run the connection loop until cancelled or retries are exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::MaxReconnectAttemptsExceeded`] when the
    /// reconnect policy gives up.
    pub async fn run(self) -> Result<(), ConnectorError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                tracing::debug!(key = %self.key, "Upstream connector cancelled");
                return Ok(());
            }

            let _ = self
                .event_tx
                .send(UpstreamEvent::Connecting {
                    attempt: policy.attempt_count(),
                })
                .await;

            match self.connect_and_run(&mut policy).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "Upstream connection error");

                    let Some(delay) = policy.next_delay(Instant::now()) else {
                        return Err(ConnectorError::MaxReconnectAttemptsExceeded);
                    };
                    let attempt = policy.attempt_count();
                    tracing::info!(
                        key = %self.key,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Reconnecting to upstream"
                    );
                    metrics::record_reconnect(self.key.channel());

                    let _ = self
                        .event_tx
                        .send(UpstreamEvent::Reconnecting { attempt, delay })
                        .await;

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::debug!(key = %self.key, "Cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connect and stream until error or cancellation.
    async fn connect_and_run(&self, policy: &mut ReconnectPolicy) -> Result<(), ConnectorError> {
        let url = self.url();
        tracing::info!(key = %self.key, %url, "Connecting to upstream");

        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = connect => result
                .map_err(|_| ConnectorError::ConnectTimeout(self.config.connect_timeout))??,
        };

        policy.mark_open(Instant::now());
        tracing::info!(key = %self.key, "Upstream stream open");
        let _ = self.event_tx.send(UpstreamEvent::Open).await;

        metrics::adjust_upstream_connections(1.0);
        let result = self.stream(ws_stream).await;
        metrics::adjust_upstream_connections(-1.0);
        result
    }

    async fn stream(&self, ws_stream: WsStream) -> Result<(), ConnectorError> {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "unsubscribed".into(),
                    }));
                    let graceful = async {
                        write.send(close).await?;
                        // Drain until the server acknowledges the close.
                        while let Some(msg) = read.next().await {
                            if matches!(msg?, Message::Close(_)) {
                                break;
                            }
                        }
                        Ok::<(), ConnectorError>(())
                    };
                    if tokio::time::timeout(self.config.close_grace, graceful).await.is_err() {
                        tracing::debug!(key = %self.key, "Close handshake timed out");
                    }
                    return Ok(());
                }
                msg = tokio::time::timeout(self.config.idle_timeout, read.next()) => {
                    let Ok(msg) = msg else {
                        return Err(ConnectorError::IdleTimeout(self.config.idle_timeout));
                    };
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !self.handle_text(&text).await {
                                return Ok(());
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(key = %self.key, ?frame, "Server sent close frame");
                            return Err(ConnectorError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!(key = %self.key, "WebSocket stream ended");
                            return Err(ConnectorError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    /// Decode and forward one text frame. Returns `false` once the
    /// supervisor is gone.
    async fn handle_text(&self, text: &str) -> bool {
        metrics::record_frame_received(self.key.channel());

        match self.codec.decode(text) {
            Ok(Some(event)) => self.event_tx.send(UpstreamEvent::Market(event)).await.is_ok(),
            Ok(None) => true,
            Err(e @ CodecError::Mismatch { .. }) => {
                tracing::warn!(key = %self.key, error = %e, "Dropping frame for another stream");
                metrics::record_frame_dropped(DropReason::Mismatch);
                true
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Dropping unparseable frame");
                metrics::record_frame_dropped(DropReason::Parse);
                true
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
