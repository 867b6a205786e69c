use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::config::{EvictOnSetConfig, StoreConfig};
use crate::entry::{StorageMode, StoredValue};
use crate::error::CacheError;
use crate::store::{Store, StoreWriteOptions};
use crate::utils::rand_simple;

struct Slot {
    value: StoredValue,
    expire_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expire_at, Some(at) if at <= now)
    }
}

/// Thread-safe in-memory store holding envelope bytes behind an `RwLock`ed
/// map.
///
/// This backend runs the full marshal → envelope → store pipeline, so what
/// it holds is byte-for-byte what an external byte store would hold. Expired
/// entries are dropped lazily on read and swept on write per
/// [`EvictOnSetConfig`].
pub struct HashMapStore {
    state: RwLock<HashMap<String, Slot>>,
    evict_on_set: Option<EvictOnSetConfig>,
}

impl HashMapStore {
    pub fn new(config: &StoreConfig) -> Self {
        HashMapStore {
            state: RwLock::new(HashMap::new()),
            evict_on_set: config.evict_on_set.clone(),
        }
    }

    async fn maybe_evict(&self) {
        let Some(config) = &self.evict_on_set else {
            return;
        };
        if config.frequency <= 0.0 {
            return;
        }
        if config.frequency < 1.0 && rand_simple() >= config.frequency {
            return;
        }

        let mut state = self.state.write().await;
        let now = Instant::now();
        state.retain(|_, slot| !slot.is_expired(now));

        if state.len() > config.max_items {
            let mut by_expiry: Vec<(String, Option<Instant>)> = state
                .iter()
                .map(|(k, slot)| (k.clone(), slot.expire_at))
                .collect();
            // soonest-expiring first; entries with no TTL are kept longest
            by_expiry.sort_by_key(|(_, at)| at.unwrap_or(now + Duration::from_secs(86_400 * 365)));

            let to_remove = state.len() - config.max_items;
            for (key, _) in by_expiry.into_iter().take(to_remove) {
                state.remove(&key);
            }
        }
    }

    async fn counter_op(&self, key: &str, delta: i64, init: bool) -> Result<i64, CacheError> {
        let mut state = self.state.write().await;
        let now = Instant::now();

        let current = match state.get(key) {
            Some(slot) if !slot.is_expired(now) => match &slot.value {
                StoredValue::Encoded(bytes) => std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| {
                        CacheError::Storage(format!("key {} does not hold a number", key))
                    })?,
                StoredValue::Item(_) => {
                    return Err(CacheError::Storage(format!(
                        "key {} does not hold a number",
                        key
                    )));
                }
            },
            _ => {
                if !init {
                    return Err(CacheError::CacheMiss);
                }
                0
            }
        };

        let next = current + delta;
        let expire_at = state.get(key).and_then(|slot| slot.expire_at);
        state.insert(
            key.to_string(),
            Slot {
                value: StoredValue::Encoded(Bytes::from(next.to_string())),
                expire_at,
            },
        );
        Ok(next)
    }
}

#[async_trait]
impl Store for HashMapStore {
    fn name(&self) -> &'static str {
        "hashmap"
    }

    fn storage_mode(&self) -> StorageMode {
        StorageMode::Encoded
    }

    async fn get(&self, key: &str) -> Result<Option<StoredValue>, CacheError> {
        {
            let state = self.state.read().await;
            match state.get(key) {
                Some(slot) if !slot.is_expired(Instant::now()) => {
                    return Ok(Some(slot.value.clone()));
                }
                None => return Ok(None),
                Some(_) => {}
            }
        }
        // lazy removal of the expired entry
        let mut state = self.state.write().await;
        if let Some(slot) = state.get(key) {
            if slot.is_expired(Instant::now()) {
                state.remove(key);
            }
        }
        Ok(None)
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
        _opts: &StoreWriteOptions,
    ) -> Result<(), CacheError> {
        {
            let mut state = self.state.write().await;
            state.insert(
                key.to_string(),
                Slot {
                    value,
                    expire_at: ttl.map(|d| Instant::now() + d),
                },
            );
        }
        self.maybe_evict().await;
        Ok(())
    }

    async fn set_many(
        &self,
        entries: Vec<(String, StoredValue)>,
        ttl: Option<Duration>,
        opts: &StoreWriteOptions,
    ) -> Result<(), CacheError> {
        {
            let mut state = self.state.write().await;
            let now = Instant::now();
            for (key, value) in entries {
                let entry_ttl = match opts
                    .expiration_map
                    .as_ref()
                    .and_then(|map| map.get(&key))
                {
                    Some(override_ttl) => *override_ttl,
                    None => ttl,
                };
                state.insert(
                    key,
                    Slot {
                        value,
                        expire_at: entry_ttl.map(|d| now + d),
                    },
                );
            }
        }
        self.maybe_evict().await;
        Ok(())
    }

    async fn add(
        &self,
        key: &str,
        value: StoredValue,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        match state.get(key) {
            Some(slot) if !slot.is_expired(now) => Err(CacheError::NotStored),
            _ => {
                state.insert(
                    key.to_string(),
                    Slot {
                        value,
                        expire_at: ttl.map(|d| now + d),
                    },
                );
                Ok(())
            }
        }
    }

    async fn replace(
        &self,
        key: &str,
        value: StoredValue,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        match state.get(key) {
            Some(slot) if !slot.is_expired(now) => {
                state.insert(
                    key.to_string(),
                    Slot {
                        value,
                        expire_at: ttl.map(|d| now + d),
                    },
                );
                Ok(())
            }
            _ => Err(CacheError::NotStored),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        state.remove(key);
        Ok(())
    }

    async fn delete_many(
        &self,
        keys: &[String],
        _opts: &StoreWriteOptions,
    ) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        for key in keys {
            state.remove(key);
        }
        Ok(())
    }

    async fn increment(&self, key: &str, delta: u64, init: bool) -> Result<i64, CacheError> {
        self.counter_op(key, delta as i64, init).await
    }

    async fn decrement(&self, key: &str, delta: u64, init: bool) -> Result<i64, CacheError> {
        self.counter_op(key, -(delta as i64), init).await
    }

    async fn expire(&self, key: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        if let Some(slot) = state.get_mut(key) {
            slot.expire_at = ttl.map(|d| Instant::now() + d);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.state.write().await.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn wait_drain(&self) {}

    async fn close(&self) {
        self.state.write().await.clear();
    }
}
