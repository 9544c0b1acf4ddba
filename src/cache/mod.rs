//! Caching layer.
//!
//! Two independent facilities share this module:
//!
//! - [`Memoizer`]: memoizes async computations in a [`CacheStore`] with
//!   expiry, tag invalidation and retry with backoff.
//! - [`FileCacheMiddleware`]: serves responses from files on disk and writes
//!   misses through a request-scoped [`CacheSender`].
//!
//! Stores are looked up in an explicit [`StoreRegistry`], usually built from
//! [`CacheConfig`].
//!
//! ```
//! use rttp_cache::cache::{CacheConfig, Memoizer, StoreRegistry};
//!
//! let config = CacheConfig::default();
//! let registry = StoreRegistry::from_config(&config).unwrap();
//! let memo = Memoizer::from_registry(&registry, &config).unwrap();
//! assert_eq!(registry.active_name(), "memory");
//! # let _ = memo;
//! ```

pub mod config;
pub mod file;
pub mod key;
pub mod memoize;
pub mod registry;
pub mod retry;
pub mod store;

pub use config::{CacheConfig, ConfigLoadError, parse_ttl};
pub use file::{
    BoxError, CacheContent, CachePath, CacheSender, DefaultFileHooks, FileCacheError,
    FileCacheMiddleware, FileCacheSettings, FileHooks, SendOptions, Setting,
};
pub use key::CacheKey;
pub use memoize::{ConfigError, MemoError, MemoInput, MemoSettings, Memoizer, RetryDecision, RetryDelay};
pub use registry::{MEMORY_BACKEND, StoreRegistry};
pub use retry::{Backoff, retry_with_backoff};
pub use store::{CacheStore, MemoryStore, StoreError};
