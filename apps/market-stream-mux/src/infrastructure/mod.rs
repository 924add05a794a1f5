//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Binance WebSocket connector and REST snapshot client.
pub mod binance;

/// Per-key fan-out to bounded client queues.
pub mod broadcast;

/// Environment-driven configuration.
pub mod config;

/// Polling and synthetic fallback feeds.
pub mod fallback;

/// Per-key feed supervision (live vs fallback).
pub mod feeds;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Gateway-facing facade.
pub mod mux;

/// OpenTelemetry tracing integration.
pub mod telemetry;
