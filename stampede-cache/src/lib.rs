//! # Stampede Cache
//!
//! A cache data layer between an application's data-access code and Redis.
//!
//! ## Features
//!
//! - **Jittered TTLs**: every write (and every read-cache hint) draws its
//!   expiry from a band around the base TTL so keys written together do not
//!   expire together
//! - **Batch operations**: MGET/MSET/DEL in single round-trips, pipelined
//!   per-key expiries when a TTL is configured
//! - **Script-backed bulk ops**: all-keys-exist checks and prefix
//!   invalidation run server-side, loaded once and invoked by SHA1
//! - **Deadlines and cancellation** on every call through [`CallContext`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stampede_cache::{CacheConfig, CacheDataLayer, CallContext};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::new("orders")
//!         .with_ttl_ms(60_000)
//!         .with_redis_url("redis://127.0.0.1:6379");
//!     let cache = CacheDataLayer::connect(config).await?;
//!
//!     let cx = CallContext::with_timeout(Duration::from_millis(200));
//!     let key = cache.namespaced_key("42");
//!     cache.set(&cx, &key, "{\"total\": 10}").await?;
//!     let value = cache.get(&cx, &key).await?;
//!     println!("Value: {}", value);
//!
//!     cache.clear_namespace(&cx).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod glob;
pub mod jitter;
pub mod layer;
pub mod scripts;
pub mod store;

pub use config::{CacheConfig, RedisConfig};
pub use context::CallContext;
pub use error::{CacheError, CancelReason, Result, StoreError, StoreResult};
pub use jitter::JitterPolicy;
pub use layer::{CacheDataLayer, InvalidationReport, Kv};
pub use scripts::{DELETE_CHUNK_SIZE, ScriptRegistry};
pub use store::{CallStats, MemoryStore, RedisStore, ScriptRef, ScriptValue, StoreConnection};
