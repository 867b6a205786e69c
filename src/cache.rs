use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, InMemoryConfig};
use crate::entry::{CacheValue, Expiration};
use crate::error::CacheError;
use crate::load::LoaderError;
use crate::options::OpOptions;
use crate::wrapper::CacheWrapper;

/// The unified cache: every kind of backing store behind one operation set.
///
/// The cache is cheap to clone and safe to share across tasks. Values are
/// typed per call; the same cache instance can hold values of different
/// types under different keys.
///
/// # Example
///
/// ```ignore
/// use unicache::{UnifiedCache, InMemoryConfig, Expiration, OpOptions};
///
/// let cache = UnifiedCache::in_memory("users", InMemoryConfig::default())?;
///
/// cache.set("user:1", &user, Expiration::secs(300), OpOptions::new()).await?;
/// let user: User = cache.get("user:1", OpOptions::new()).await?;
///
/// // or let the cache drive the origin on a miss:
/// let user: User = cache
///     .load(
///         |keys| async move { Ok(fetch_users(keys).await) },
///         "user:1",
///         Expiration::secs(300),
///         OpOptions::new(),
///     )
///     .await?;
/// ```
#[derive(Clone)]
pub struct UnifiedCache {
    inner: Arc<CacheWrapper>,
}

impl UnifiedCache {
    /// Create a cache from a full [`Config`].
    pub fn new(name: &str, config: Config) -> Result<Self, CacheError> {
        Ok(UnifiedCache {
            inner: Arc::new(CacheWrapper::new(name, config)?),
        })
    }

    /// Create an in-memory cache.
    pub fn in_memory(name: &str, config: InMemoryConfig) -> Result<Self, CacheError> {
        Self::new(name, Config::in_memory(config))
    }

    /// Return the cached value for `key`, or `CacheMiss`.
    pub async fn get<V: CacheValue>(&self, key: &str, opts: OpOptions) -> Result<V, CacheError> {
        self.inner.get(key, &opts).await
    }

    /// Fill the receiver map with the cached values for its keys.
    ///
    /// Missing keys follow the configured
    /// [`NonExistKeyStrategy`](crate::NonExistKeyStrategy): left as `None`
    /// (default) or removed from the map.
    pub async fn get_many<V: CacheValue>(
        &self,
        receivers: &mut HashMap<String, Option<V>>,
        opts: OpOptions,
    ) -> Result<(), CacheError> {
        self.inner.get_many(receivers, &opts).await
    }

    /// Set a value, replacing any existing entry.
    pub async fn set<V: CacheValue>(
        &self,
        key: &str,
        value: &V,
        expire: Expiration,
        opts: OpOptions,
    ) -> Result<(), CacheError> {
        self.inner.set(key, value, expire, &opts).await
    }

    /// Set multiple values. Per-key expirations supplied through
    /// [`OpOptions::expiration_map`] win over `expire`.
    pub async fn set_many<V: CacheValue>(
        &self,
        values: &HashMap<String, V>,
        expire: Expiration,
        opts: OpOptions,
    ) -> Result<(), CacheError> {
        self.inner.set_many(values, expire, &opts).await
    }

    /// Store the value only if the key is absent; `NotStored` otherwise.
    pub async fn add<V: CacheValue>(
        &self,
        key: &str,
        value: &V,
        expire: Expiration,
        opts: OpOptions,
    ) -> Result<(), CacheError> {
        self.inner.add(key, value, expire, &opts).await
    }

    /// Store the value only if the key already exists; `NotStored` otherwise.
    pub async fn replace<V: CacheValue>(
        &self,
        key: &str,
        value: &V,
        expire: Expiration,
        opts: OpOptions,
    ) -> Result<(), CacheError> {
        self.inner.replace(key, value, expire, &opts).await
    }

    /// Remove a key. Removing an absent key is not an error.
    pub async fn delete(&self, key: &str, opts: OpOptions) -> Result<(), CacheError> {
        self.inner.delete(key, &opts).await
    }

    /// Remove multiple keys.
    pub async fn delete_many(&self, keys: &[String], opts: OpOptions) -> Result<(), CacheError> {
        self.inner.delete_many(keys, &opts).await
    }

    /// Increment a counter and return the new value.
    pub async fn increment(
        &self,
        key: &str,
        delta: u64,
        opts: OpOptions,
    ) -> Result<i64, CacheError> {
        self.inner.increment(key, delta, &opts).await
    }

    /// Decrement a counter and return the new value.
    pub async fn decrement(
        &self,
        key: &str,
        delta: u64,
        opts: OpOptions,
    ) -> Result<i64, CacheError> {
        self.inner.decrement(key, delta, &opts).await
    }

    /// Rewrite a key's hard expiration, preserving its soft timestamp.
    pub async fn expire(
        &self,
        key: &str,
        expire: Expiration,
        opts: OpOptions,
    ) -> Result<(), CacheError> {
        self.inner.expire(key, expire, &opts).await
    }

    /// Like `get`, but a missing key invokes `loader`, caches its result
    /// and returns it.
    ///
    /// The loader receives the requested keys and must return one
    /// `Option<V>` per key, in order. A `None` result is not cached and
    /// surfaces as `CacheMiss`. A soft-expired entry (see
    /// [`OpOptions::soft_expiration`]) is returned immediately while a
    /// detached task refreshes it.
    ///
    /// The loader must enforce its own timeout: background refreshes
    /// outlive the calling request by design.
    pub async fn load<V, L, Fut>(
        &self,
        loader: L,
        key: &str,
        expire: Expiration,
        opts: OpOptions,
    ) -> Result<V, CacheError>
    where
        V: CacheValue,
        L: Fn(Vec<String>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Option<V>>, LoaderError<V>>> + Send + 'static,
    {
        self.inner.load(loader, key, expire, &opts).await
    }

    /// Multi-key [`Self::load`]. The receiver map supplies the key set and
    /// collects the results.
    pub async fn load_many<V, L, Fut>(
        &self,
        loader: L,
        receivers: &mut HashMap<String, Option<V>>,
        expire: Expiration,
        opts: OpOptions,
    ) -> Result<(), CacheError>
    where
        V: CacheValue,
        L: Fn(Vec<String>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Option<V>>, LoaderError<V>>> + Send + 'static,
    {
        self.inner.load_many(loader, receivers, expire, &opts).await
    }

    /// [`Self::load`] with soft and hard expirations given in seconds.
    ///
    /// An empty key bypasses the cache entirely: the loader runs and its
    /// first result is returned without being stored.
    pub async fn load_with_expiration<V, L, Fut>(
        &self,
        loader: L,
        key: &str,
        soft_expiration_secs: u64,
        hard_expiration_secs: u64,
    ) -> Result<V, CacheError>
    where
        V: CacheValue,
        L: Fn(Vec<String>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Option<V>>, LoaderError<V>>> + Send + 'static,
    {
        if key.is_empty() {
            let values = loader(vec![String::new()]).await.map_err(|e| match e {
                LoaderError::Failed(message) => CacheError::DataLoader(message),
                LoaderError::Degraded { message, .. } => CacheError::DataLoader(message),
            })?;
            return values
                .into_iter()
                .next()
                .flatten()
                .ok_or(CacheError::CacheMiss);
        }

        self.load(
            loader,
            key,
            Expiration::secs(hard_expiration_secs),
            OpOptions::new().soft_expiration(Duration::from_secs(soft_expiration_secs)),
        )
        .await
    }

    /// Remove all entries.
    pub async fn flush(&self) -> Result<(), CacheError> {
        self.inner.flush().await
    }

    /// Check the backing store is reachable.
    pub async fn ping(&self) -> Result<(), CacheError> {
        self.inner.ping().await
    }

    /// Release all resources. Idempotent: the first call closes the store,
    /// later calls succeed without touching it.
    pub async fn close(&self) -> Result<(), CacheError> {
        self.inner.close().await
    }

    /// Swap in a new configuration atomically.
    ///
    /// Operations already in flight finish against the configuration they
    /// started with; every operation started after this returns observes
    /// the new one.
    pub async fn update_config(&self, config: Config) -> Result<(), CacheError> {
        self.inner.update_config(config).await
    }
}
