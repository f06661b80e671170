//! Read-through query cache
//!
//! - [`key`]: deterministic keys derived from page requests
//! - [`ResultCache`]: typed pages over a pluggable [`CacheStore`]
//! - builtin in-memory store with a periodic expiry sweep
//! - optional Redis store behind the `redis` feature

pub mod config;
mod entry;
pub mod key;
#[cfg(feature = "redis")]
pub mod proxy;
mod result;
mod store;
mod sweeper;

pub use config::{CacheConfig, CacheMode, RedisConfig};
pub use entry::CacheEntry;
pub use key::QueryKeyCodec;
#[cfg(feature = "redis")]
pub use proxy::RedisCacheStore;
pub use result::ResultCache;
pub use store::{CacheStats, CacheStore, CacheStoreError, InMemoryCacheStore};
pub use sweeper::run_expiration_task;
