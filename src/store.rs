use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::entry::{StorageMode, StoredValue};
use crate::error::CacheError;

/// Write-path knobs forwarded to the store.
///
/// `expiration_map` carries per-key TTL overrides for `set_many` and wins
/// over the shared TTL argument.
#[derive(Debug, Clone)]
pub struct StoreWriteOptions {
    /// Fire-and-forget hint for stores that support it.
    pub no_reply: bool,
    /// For `increment`/`decrement`: create the key with 0 when absent.
    pub init_non_exist_key: bool,
    /// Synchronously drain the store's write buffer before returning, so the
    /// write is visible to the next read.
    pub wait_drain: bool,
    /// Per-key TTL overrides, keyed by the store-level key. `None` values
    /// mean no TTL for that key.
    pub expiration_map: Option<HashMap<String, Option<Duration>>>,
}

impl Default for StoreWriteOptions {
    fn default() -> Self {
        StoreWriteOptions {
            no_reply: true,
            init_non_exist_key: true,
            wait_drain: false,
            expiration_map: None,
        }
    }
}

/// A store is a uniform interface over a pluggable key/value engine.
///
/// TTL semantics at this layer: `None` means no TTL; the wrapper has already
/// translated `Default`/`Never` before calling in. The store is responsible
/// for evicting expired entries on its own.
#[async_trait]
pub trait Store: Send + Sync {
    /// A name for logs and stats, e.g. "moka" or "hashmap".
    fn name(&self) -> &'static str;

    /// Whether this store holds in-memory records or envelope bytes.
    fn storage_mode(&self) -> StorageMode;

    /// Return the stored value; `None` for a miss.
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, CacheError>;

    /// Return values aligned to `keys`; `None` at the positions of missing
    /// keys.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<StoredValue>>, CacheError>;

    /// Set a value, replacing any existing one.
    async fn set(
        &self,
        key: &str,
        value: StoredValue,
        ttl: Option<Duration>,
        opts: &StoreWriteOptions,
    ) -> Result<(), CacheError>;

    /// Set multiple values; `opts.expiration_map` overrides `ttl` per key.
    async fn set_many(
        &self,
        entries: Vec<(String, StoredValue)>,
        ttl: Option<Duration>,
        opts: &StoreWriteOptions,
    ) -> Result<(), CacheError>;

    /// Store the value only if the key is absent; `NotStored` otherwise.
    async fn add(
        &self,
        key: &str,
        value: StoredValue,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    /// Store the value only if the key exists; `NotStored` otherwise.
    async fn replace(
        &self,
        key: &str,
        value: StoredValue,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    /// Remove the key. A missing key is not an error at this layer.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove multiple keys.
    async fn delete_many(
        &self,
        keys: &[String],
        opts: &StoreWriteOptions,
    ) -> Result<(), CacheError>;

    /// Increment a counter key by `delta` and return the new value.
    /// `init` creates the counter at 0 when absent.
    async fn increment(&self, key: &str, delta: u64, init: bool) -> Result<i64, CacheError>;

    /// Decrement a counter key by `delta` and return the new value.
    async fn decrement(&self, key: &str, delta: u64, init: bool) -> Result<i64, CacheError>;

    /// Update the store-level TTL of an existing key.
    async fn expire(&self, key: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Remove all entries.
    async fn flush(&self) -> Result<(), CacheError>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), CacheError>;

    /// Block until buffered writes are applied. A no-op for unbuffered
    /// stores.
    async fn wait_drain(&self);

    /// Release resources. Idempotency is guaranteed by the caller's atomic
    /// close guard.
    async fn close(&self);
}
