//! unicache - a unified in-process caching library for Rust
//!
//! This library serves values behind a single `load` operation with:
//! - Soft and hard expiration carried next to every payload
//! - Background refresh of soft-expired entries
//! - Deduplication of concurrent loader calls per key (stampede mitigation)
//! - A self-describing byte envelope with Snappy/Gzip compression
//! - Atomic, lock-free hot-swappable configuration
//!
//! # Example
//!
//! ```ignore
//! use unicache::{Expiration, InMemoryConfig, OpOptions, UnifiedCache};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct User {
//!     id: String,
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), unicache::CacheError> {
//!     let cache = UnifiedCache::in_memory("users", InMemoryConfig::default())?;
//!
//!     // Serve from cache; on a miss the loader runs once per key even
//!     // under concurrent demand, and everyone gets its result.
//!     let user: User = cache
//!         .load(
//!             |keys| async move {
//!                 let users = fetch_from_db(&keys).await;
//!                 Ok(users)
//!             },
//!             "user:123",
//!             Expiration::secs(300),
//!             // serve stale after 30s while a background task refreshes
//!             OpOptions::new().soft_expiration(Duration::from_secs(30)),
//!         )
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

mod cache;
mod codec;
mod compression;
mod config;
mod entry;
mod envelope;
mod error;
mod load;
mod options;
mod singleflight;
mod stats;
mod store;
pub mod stores;
mod unified;
mod utils;
mod wrapper;

// Re-export public API
pub use cache::UnifiedCache;
pub use codec::{CodecConfig, CodecType, CustomCodec};
pub use compression::{
    CompressionAlgo, CompressionConfig, DEFAULT_MIN_LEN_FOR_COMPRESSION, compress, decompress,
};
pub use config::{
    AcrossInstanceConfig, CacheKind, Config, CostFunction, EvictOnSetConfig, InMemoryConfig,
    ManufacturerConfig, StampedeMitigationStrategy, StoreBackend, StoreConfig,
};
pub use entry::{
    CacheItem, CacheValue, Expiration, HARD_TIMEOUT_FOREVER, ItemData, MetaHeader, StorageMode,
    StoredValue,
};
pub use envelope::{decode as envelope_decode, encode as envelope_encode, is_encoded};
pub use error::CacheError;
pub use load::LoaderError;
pub use options::{NonExistKeyStrategy, OpOptions};
pub use store::{Store, StoreWriteOptions};
pub use stores::{HashMapStore, MokaStore};
pub use unified::{init_unified_cache, unified_cache};
