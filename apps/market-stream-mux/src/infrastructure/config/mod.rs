//! Configuration Module
//!
//! Configuration loading for the mux service.

mod settings;

pub use settings::{
    ConfigError, FallbackSettings, HubSettings, MuxConfig, RegistrySettings, ServerSettings,
    UpstreamSettings,
};
