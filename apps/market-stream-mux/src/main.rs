//! Market Stream Mux Binary
//!
//! Starts the health server and the mux. Clients are attached by an embedding
//! gateway; `STREAM_MUX_PRELOAD` subscribes an internal logging client so the
//! binary can be run on its own.
//!
//! # Usage
//!
//! ```bash
//! STREAM_MUX_PRELOAD=BTCUSDT:kline:1m,ETHUSDT:ticker cargo run --bin market-stream-mux
//! ```
//!
//! # Environment Variables
//!
//! - `STREAM_MUX_*`: see `MuxConfig`
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-stream-mux)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_stream_mux::infrastructure::health::{HealthServer, HealthServerState};
use market_stream_mux::infrastructure::telemetry;
use market_stream_mux::{
    BinanceRestClient, ClientFeed, MarketDataMux, MuxConfig, SnapshotSource, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Time feeds get to close after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Market Stream Mux");

    let _metrics_handle = init_metrics();

    let config = MuxConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let snapshot = snapshot_source(&config)?;
    let mux = Arc::new(MarketDataMux::new(
        &config,
        snapshot,
        shutdown_token.child_token(),
    ));

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&mux),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    if !config.preload.is_empty() {
        let (client, feed) = mux.connect();
        for key in &config.preload {
            match mux.subscribe_key(client, key.clone()) {
                Ok(ack) => tracing::info!(key = %ack.key, "Preloaded subscription"),
                Err(e) => tracing::warn!(%key, error = %e, "Preload subscription failed"),
            }
        }
        tokio::spawn(log_events(feed));
    }

    tracing::info!("Market stream mux ready");

    await_shutdown().await;

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    mux.shutdown(SHUTDOWN_TIMEOUT).await;
    shutdown_token.cancel();
    let _ = health_task.await;

    tracing::info!("Market stream mux stopped");
    Ok(())
}

/// REST client used by fallback feeds, if a REST URL is configured.
fn snapshot_source(config: &MuxConfig) -> anyhow::Result<Option<Arc<dyn SnapshotSource>>> {
    let url = config.fallback.rest_url.trim();
    if url.is_empty() {
        return Ok(None);
    }
    let client = BinanceRestClient::new(url, config.fallback.request_timeout)
        .context("failed to build REST snapshot client")?;
    Ok(Some(Arc::new(client)))
}

/// Drain the preload client's queue into the log.
async fn log_events(mut feed: ClientFeed) {
    while let Some(push) = feed.recv().await {
        tracing::info!(
            key = %push.key,
            origin = %push.origin,
            price = %push.event.last_price(),
            "Market event"
        );
    }
    tracing::debug!(client = %feed.client(), "Preload client closed");
}

/// Log the parsed configuration.
fn log_config(config: &MuxConfig) {
    tracing::info!(
        upstream_enabled = config.upstream.enabled,
        health_port = config.server.health_port,
        max_active_keys = config.registry.max_active_keys,
        client_queue_capacity = config.hub.client_queue_capacity,
        preload = config.preload.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        ws_url = %config.upstream.ws_url,
        rest_url = %config.fallback.rest_url,
        synthetic = config.fallback.synthetic_enabled,
        "Upstream endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGTERM or SIGINT.
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
