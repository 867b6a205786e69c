use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;

use crate::config::{CostFunction, StoreConfig};
use crate::entry::{StorageMode, StoredValue};
use crate::error::CacheError;
use crate::store::{Store, StoreWriteOptions};

/// What the moka cache actually holds: the value plus its absolute expiry.
#[derive(Clone)]
struct TtlEntry {
    value: StoredValue,
    expire_at: Option<Instant>,
}

impl TtlEntry {
    fn new(value: StoredValue, ttl: Option<Duration>) -> Self {
        TtlEntry {
            value,
            expire_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expire_at, Some(at) if at <= now)
    }
}

/// Per-entry TTL policy: each entry carries its own deadline.
struct PerEntryExpiry;

impl Expiry<String, TtlEntry> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &TtlEntry,
        created_at: Instant,
    ) -> Option<Duration> {
        value.expire_at.map(|at| at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &TtlEntry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.expire_at.map(|at| at.saturating_duration_since(updated_at))
    }
}

/// TinyLFU in-memory store holding values by reference.
///
/// Admission and eviction are frequency-sampled, so a cold write may be
/// rejected under pressure; `wait_drain` flushes the internal buffers to
/// make writes deterministic in tests.
pub struct MokaStore {
    cache: Cache<String, TtlEntry>,
}

impl MokaStore {
    pub fn new(config: &StoreConfig) -> Self {
        let mut builder = Cache::builder()
            .max_capacity(config.effective_capacity())
            .expire_after(PerEntryExpiry);

        if config.cost_function == CostFunction::ByteSize {
            builder = builder.weigher(|key: &String, entry: &TtlEntry| {
                (key.len() + entry.value.byte_len()).min(u32::MAX as usize) as u32
            });
        }

        MokaStore {
            cache: builder.build(),
        }
    }

    /// Entry count as far as moka's sampling can tell.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl Store for MokaStore {
    fn name(&self) -> &'static str {
        "moka"
    }

    fn storage_mode(&self) -> StorageMode {
        StorageMode::Typed
    }

    async fn get(&self, key: &str) -> Result<Option<StoredValue>, CacheError> {
        match self.cache.get(key).await {
            Some(entry) => {
                // the expiry policy lags a tick behind the wall clock
                if entry.is_expired(Instant::now()) {
                    self.cache.invalidate(key).await;
                    return Ok(None);
                }
                Ok(Some(entry.value))
            }
            None => Ok(None),
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<StoredValue>>, CacheError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn set(
        &self,
        key: &str,
        value: StoredValue,
        ttl: Option<Duration>,
        opts: &StoreWriteOptions,
    ) -> Result<(), CacheError> {
        self.cache
            .insert(key.to_string(), TtlEntry::new(value, ttl))
            .await;
        if opts.wait_drain {
            self.cache.run_pending_tasks().await;
        }
        Ok(())
    }

    async fn set_many(
        &self,
        entries: Vec<(String, StoredValue)>,
        ttl: Option<Duration>,
        opts: &StoreWriteOptions,
    ) -> Result<(), CacheError> {
        for (key, value) in entries {
            let entry_ttl = match opts
                .expiration_map
                .as_ref()
                .and_then(|map| map.get(&key))
            {
                Some(override_ttl) => *override_ttl,
                None => ttl,
            };
            self.cache
                .insert(key, TtlEntry::new(value, entry_ttl))
                .await;
        }
        if opts.wait_drain {
            self.cache.run_pending_tasks().await;
        }
        Ok(())
    }

    async fn add(
        &self,
        key: &str,
        value: StoredValue,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let entry = self
            .cache
            .entry(key.to_string())
            .or_insert_with(async { TtlEntry::new(value, ttl) })
            .await;
        if entry.is_fresh() {
            Ok(())
        } else {
            Err(CacheError::NotStored)
        }
    }

    async fn replace(
        &self,
        key: &str,
        value: StoredValue,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        if self.get(key).await?.is_none() {
            return Err(CacheError::NotStored);
        }
        self.cache
            .insert(key.to_string(), TtlEntry::new(value, ttl))
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn delete_many(
        &self,
        keys: &[String],
        _opts: &StoreWriteOptions,
    ) -> Result<(), CacheError> {
        for key in keys {
            self.cache.invalidate(key).await;
        }
        Ok(())
    }

    async fn increment(&self, _key: &str, _delta: u64, _init: bool) -> Result<i64, CacheError> {
        // counters are not tracked by the typed in-memory store
        Ok(0)
    }

    async fn decrement(&self, _key: &str, _delta: u64, _init: bool) -> Result<i64, CacheError> {
        Ok(0)
    }

    async fn expire(&self, key: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        if let Some(entry) = self.cache.get(key).await {
            self.cache
                .insert(key.to_string(), TtlEntry::new(entry.value, ttl))
                .await;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn wait_drain(&self) {
        self.cache.run_pending_tasks().await;
    }

    async fn close(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }
}
