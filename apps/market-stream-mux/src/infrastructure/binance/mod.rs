//! Binance Market Data Adapters
//!
//! - **Connector**: one raw-stream WebSocket per subscription key
//! - **Codec**: typed frame parsing bound to a key
//! - **REST**: point-in-time snapshots for the fallback feed

pub mod codec;
pub mod connector;
pub mod messages;
pub mod reconnect;
pub mod rest;

pub use codec::{CodecError, FrameCodec};
pub use connector::{ConnectorConfig, ConnectorError, UpstreamConnector, UpstreamEvent};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use rest::BinanceRestClient;
