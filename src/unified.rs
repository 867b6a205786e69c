//! Process-global cache accessor.
//!
//! A thin convenience over [`UnifiedCache`] for applications that want one
//! shared in-memory cache without threading a handle around. The cache
//! itself needs none of this; construct instances directly where possible.

use std::sync::OnceLock;

use crate::cache::UnifiedCache;
use crate::config::{
    CostFunction, InMemoryConfig, ManufacturerConfig, StampedeMitigationStrategy, StoreConfig,
};
use crate::error::CacheError;

/// Byte budget used when `init_unified_cache` is given a zero capacity.
const DEFAULT_UNIFIED_CAPACITY_BYTES: u64 = 268_435_456;

static UNIFIED_CACHE: OnceLock<UnifiedCache> = OnceLock::new();

/// Initialize the process-global cache.
///
/// `capacity_bytes` bounds the cache by payload size; zero selects a 256 MiB
/// budget. Stampede mitigation is on (`InProcessSignal`). Calling this more
/// than once keeps the first cache and returns an error for the rest.
pub fn init_unified_cache(capacity_bytes: u64) -> Result<(), CacheError> {
    let capacity = if capacity_bytes == 0 {
        DEFAULT_UNIFIED_CAPACITY_BYTES
    } else {
        capacity_bytes
    };

    let cache = UnifiedCache::in_memory(
        "unified_in_memory_cache",
        InMemoryConfig {
            store: StoreConfig {
                capacity,
                cost_function: CostFunction::ByteSize,
                ..Default::default()
            },
            manufacturer: ManufacturerConfig {
                stampede_mitigation: StampedeMitigationStrategy::InProcessSignal,
                ..Default::default()
            },
            ..Default::default()
        },
    )?;

    UNIFIED_CACHE
        .set(cache)
        .map_err(|_| CacheError::InvalidConfig("unified cache already initialized".into()))
}

/// The process-global cache, if [`init_unified_cache`] has run.
pub fn unified_cache() -> Option<&'static UnifiedCache> {
    UNIFIED_CACHE.get()
}
