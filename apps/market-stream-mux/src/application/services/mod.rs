//! Application Services
//!
//! - [`SubscriptionRegistry`]: reference-counts holders per key and owns
//!   the lifecycle of each key's feed
//! - [`FeedHandle`]: ownership of one running feed task and its status

mod feed_handle;
mod registry;

pub use feed_handle::{FeedHandle, FeedState, FeedStatus, KeyStatus};
pub use registry::{Acquired, RegistryError, RegistryLimits, Released, SubscriptionRegistry};
