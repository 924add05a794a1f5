//! Domain Layer - Core market data and subscription types.
//!
//! This layer contains the typed market events and the canonical
//! subscription key. Nothing here performs I/O; every type is plain
//! Rust with serde support so adapters can put it on the wire.

/// Typed market events (ticker, kline) and their origin.
pub mod market;

/// Subscription keys, channels, intervals, and client identifiers.
pub mod subscription;
