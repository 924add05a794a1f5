//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, per-key feed status, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status with every running key
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (fails only when every key is stale)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::FeedState;
use crate::domain::market::FeedOrigin;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::mux::{KeyReport, MarketDataMux};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Client counts.
    pub clients: ClientStatus,
    /// Aggregate feed counts.
    pub feeds: FeedSummary,
    /// Status of every running key.
    pub keys: Vec<KeyReport>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every feed is live and fresh.
    Healthy,
    /// Some feeds are reconnecting, on fallback, or stale.
    Degraded,
    /// Every feed is stale.
    Unhealthy,
}

/// Registered client counts.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClientStatus {
    /// Registered clients.
    pub total: usize,
    /// Total (client, key) memberships.
    pub subscriptions: usize,
}

/// Aggregate over running feeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedSummary {
    /// Running feeds.
    pub total: usize,
    /// Feeds with an open upstream socket.
    pub live: usize,
    /// Feeds whose last event came from a fallback source.
    pub fallback: usize,
    /// Feeds with no event inside the staleness window.
    pub stale: usize,
}

impl FeedSummary {
    fn from_reports(reports: &[KeyReport]) -> Self {
        reports.iter().fold(Self::default(), |mut acc, report| {
            acc.total += 1;
            if report.status.state == FeedState::Open {
                acc.live += 1;
            }
            if matches!(
                report.status.origin,
                Some(FeedOrigin::Polled | FeedOrigin::Synthetic)
            ) {
                acc.fallback += 1;
            }
            if report.stale {
                acc.stale += 1;
            }
            acc
        })
    }
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    mux: Arc<MarketDataMux>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, mux: Arc<MarketDataMux>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            mux,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let summary = FeedSummary::from_reports(&state.mux.snapshot());
    if determine_health_status(&summary) == HealthStatus::Unhealthy {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let keys = state.mux.snapshot();
    let feeds = FeedSummary::from_reports(&keys);
    let stats = state.mux.stats();

    HealthResponse {
        status: determine_health_status(&feeds),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        clients: ClientStatus {
            total: stats.clients,
            subscriptions: stats.memberships,
        },
        feeds,
        keys,
    }
}

fn determine_health_status(feeds: &FeedSummary) -> HealthStatus {
    if feeds.total > 0 && feeds.stale == feeds.total {
        HealthStatus::Unhealthy
    } else if feeds.stale > 0 || feeds.fallback > 0 || feeds.live < feeds.total {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const fn summary(total: usize, live: usize, fallback: usize, stale: usize) -> FeedSummary {
        FeedSummary {
            total,
            live,
            fallback,
            stale,
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn idle_service_is_healthy() {
        assert_eq!(determine_health_status(&summary(0, 0, 0, 0)), HealthStatus::Healthy);
    }

    #[test]
    fn all_live_and_fresh_is_healthy() {
        assert_eq!(determine_health_status(&summary(3, 3, 0, 0)), HealthStatus::Healthy);
    }

    #[test]
    fn fallback_or_partial_staleness_degrades() {
        assert_eq!(determine_health_status(&summary(2, 1, 1, 0)), HealthStatus::Degraded);
        assert_eq!(determine_health_status(&summary(2, 2, 0, 1)), HealthStatus::Degraded);
        assert_eq!(determine_health_status(&summary(2, 0, 0, 0)), HealthStatus::Degraded);
    }

    #[test]
    fn everything_stale_is_unhealthy() {
        assert_eq!(determine_health_status(&summary(2, 0, 2, 2)), HealthStatus::Unhealthy);
    }
}
