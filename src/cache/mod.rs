//! Local cache module
//!
//! The store each node owns. Membership code treats it as opaque.

pub mod store;

pub use store::{Cache, CacheConfig, CacheStats, DEFAULT_MAX_ENTRIES};
