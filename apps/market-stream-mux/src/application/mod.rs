//! Application Layer - Use cases and port definitions.
//!
//! This layer owns the subscription lifecycle: the registry that decides
//! when a key's feed starts and stops, the handles that own feed tasks,
//! and the ports infrastructure adapters implement.

/// Port interfaces for feeds, snapshot sources, and event sinks.
pub mod ports;

/// Subscription registry and feed handles.
pub mod services;
