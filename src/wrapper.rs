//! The cache wrapper: an immutable configuration snapshot behind an atomic
//! pointer, plus the read/write operation paths shared by every cache kind.
//!
//! Readers load the snapshot once per operation and never lock; writers hold
//! the update mutex, build a new snapshot and publish it atomically.
//! In-flight operations continue against the snapshot they captured.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;

use crate::codec::CodecHandler;
use crate::config::{CacheKind, Config, InMemoryConfig, StoreConfig};
use crate::entry::{
    CacheItem, CacheValue, Expiration, ItemData, MetaHeader, StorageMode, StoredValue,
};
use crate::envelope::EncodingHandler;
use crate::error::CacheError;
use crate::options::{
    NonExistKeyStrategy, OpOptions, PooledOptions, ResolvedOptions, acquire_options,
};
use crate::singleflight::Coordinator;
use crate::stats::{RequestStats, cmd};
use crate::store::{Store, StoreWriteOptions};
use crate::stores::build_store;
use crate::utils::{fix_key, now_unix};

/// Immutable snapshot of a cache's configuration and handlers.
///
/// Never mutated after publication; any change builds a new snapshot.
pub(crate) struct Snapshot {
    pub name: String,
    pub kind: CacheKind,
    pub store: Arc<dyn Store>,
    pub store_config: StoreConfig,
    pub codec: CodecHandler,
    pub encoding: EncodingHandler,
    pub coordinator: Arc<Coordinator>,
    pub default_expiration: Duration,
    pub max_expiration: Option<Duration>,
    pub key_prefix: Option<String>,
    pub disabled: bool,
    /// Shared across snapshots so a config update cannot reopen a closed
    /// cache.
    pub closed: Arc<AtomicBool>,
}

impl Snapshot {
    fn from_config(
        name: &str,
        config: &InMemoryConfig,
        store: Arc<dyn Store>,
        coordinator: Arc<Coordinator>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Snapshot {
            name: name.to_string(),
            kind: CacheKind::InMemory,
            store,
            store_config: config.store.clone(),
            codec: CodecHandler::new(&config.codec),
            encoding: EncodingHandler::new(
                config.encoding.disable_encoding,
                &config.encoding.compression,
            ),
            coordinator,
            default_expiration: config.default_expiration(),
            max_expiration: config.max_expiration(),
            key_prefix: config.key_prefix.clone(),
            disabled: config.disabled,
            closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn fixed_key(&self, key: &str) -> String {
        fix_key(self.key_prefix.as_deref(), key)
    }

    pub fn fixed_keys(&self, keys: &[String]) -> Vec<String> {
        keys.iter().map(|k| self.fixed_key(k)).collect()
    }

    /// Resolve the expiration a caller passed into the one actually applied:
    /// `Default` becomes the configured default, and any finite value is
    /// clamped to the configured maximum.
    pub fn translate_expire(&self, expire: Expiration) -> Expiration {
        let expire = match expire {
            Expiration::Default => Expiration::After(self.default_expiration),
            other => other,
        };
        match (expire, self.max_expiration) {
            (Expiration::After(d), Some(max)) if d > max => Expiration::After(max),
            _ => expire,
        }
    }

    /// What the store sees: `Never` means no TTL at that layer.
    pub fn store_ttl(&self, expire: Expiration) -> Option<Duration> {
        match expire {
            Expiration::After(d) => Some(d),
            Expiration::Never | Expiration::Default => None,
        }
    }

    /// Assemble the expiration metadata a write carries. Absolute timestamp
    /// overrides win over durations; the forever sentinel marks entries that
    /// never hard-expire.
    pub fn build_header(
        &self,
        option: &ResolvedOptions,
        hard: Expiration,
        now: i64,
    ) -> MetaHeader {
        let soft_timeout_ts = if option.soft_timeout_ts > 0 {
            option.soft_timeout_ts
        } else {
            match option.soft_expiration {
                Some(d) => now + d.as_secs() as i64,
                None => 0,
            }
        };

        let hard_timeout_ts = if option.hard_timeout_ts > 0 {
            option.hard_timeout_ts
        } else {
            match hard {
                Expiration::After(d) => now + d.as_secs() as i64,
                Expiration::Never => crate::entry::HARD_TIMEOUT_FOREVER,
                Expiration::Default => 0,
            }
        };

        MetaHeader::new(soft_timeout_ts, hard_timeout_ts).normalized()
    }

    /// Turn a caller value into the payload half of a cache item.
    pub fn convert_value<V: CacheValue>(
        &self,
        value: &V,
        option: &ResolvedOptions,
    ) -> Result<ItemData, CacheError> {
        if option.skip_codec && self.store.storage_mode() == StorageMode::Typed {
            return Ok(ItemData::typed(value.clone()));
        }
        let bytes = self
            .codec
            .marshal(value, option.codec_type, option.custom_codec.as_ref())?;
        Ok(ItemData::Bytes(Bytes::from(bytes)))
    }

    /// Shape payload data for the store: an in-memory record for typed-mode
    /// stores, envelope bytes for encoded-mode stores.
    pub fn encode_item(
        &self,
        data: ItemData,
        option: &ResolvedOptions,
        hard: Expiration,
    ) -> Result<StoredValue, CacheError> {
        if option.skip_encoding {
            return Ok(match data {
                ItemData::Bytes(b) => StoredValue::Encoded(b),
                typed => StoredValue::Item(CacheItem::new(MetaHeader::default(), typed)),
            });
        }

        let header = self.build_header(option, hard, now_unix());
        match self.store.storage_mode() {
            StorageMode::Typed => Ok(StoredValue::Item(CacheItem::new(header, data))),
            StorageMode::Encoded => match data {
                ItemData::Bytes(b) => self
                    .encoding
                    .encode(&b, header)
                    .map(StoredValue::Encoded),
                ItemData::Typed(_) => Err(CacheError::PassNonBytesToCodec),
            },
        }
    }

    /// Shape an already-built cache item for the store, keeping its header
    /// exactly as assembled.
    pub fn encode_prepared(&self, item: &CacheItem) -> Result<StoredValue, CacheError> {
        match self.store.storage_mode() {
            StorageMode::Typed => Ok(StoredValue::Item(item.clone())),
            StorageMode::Encoded => match &item.data {
                ItemData::Bytes(b) => self
                    .encoding
                    .encode(b, item.header)
                    .map(StoredValue::Encoded),
                ItemData::Typed(_) => Err(CacheError::PassNonBytesToCodec),
            },
        }
    }

    /// Undo [`Self::encode_item`]: recover the payload and its metadata.
    pub fn decode_stored(
        &self,
        value: StoredValue,
        skip_encoding: bool,
    ) -> Result<(ItemData, MetaHeader), CacheError> {
        if skip_encoding {
            return Ok(match value {
                StoredValue::Encoded(b) => (ItemData::Bytes(b), MetaHeader::default()),
                StoredValue::Item(item) => (item.data, MetaHeader::default()),
            });
        }
        match value {
            StoredValue::Item(item) => Ok((item.data, item.header)),
            StoredValue::Encoded(b) => {
                let (payload, header) = self.encoding.decode(&b)?;
                Ok((ItemData::Bytes(payload), header))
            }
        }
    }

    /// Deliver payload data into a typed receiver.
    pub fn data_to_value<V: CacheValue>(
        &self,
        data: ItemData,
        option: &ResolvedOptions,
    ) -> Result<V, CacheError> {
        match data {
            ItemData::Typed(_) if !option.skip_codec => Err(CacheError::PassNonBytesToCodec),
            ItemData::Typed(any) => any
                .downcast_ref::<V>()
                .cloned()
                .ok_or_else(|| {
                    CacheError::Codec("stored value type does not match receiver".into())
                }),
            ItemData::Bytes(b) => {
                self.codec
                    .unmarshal(&b, option.codec_type, option.custom_codec.as_ref())
            }
        }
    }

    pub fn write_options(&self, option: &ResolvedOptions) -> StoreWriteOptions {
        StoreWriteOptions {
            no_reply: option.no_reply,
            init_non_exist_key: option.init_non_exist_key,
            wait_drain: option.wait_drain,
            expiration_map: None,
        }
    }
}

pub(crate) fn handle_missing_key<V>(
    strategy: NonExistKeyStrategy,
    receivers: &mut HashMap<String, Option<V>>,
    key: &str,
) {
    match strategy {
        NonExistKeyStrategy::FillNil => {
            receivers.insert(key.to_string(), None);
        }
        NonExistKeyStrategy::RemoveKey => {
            receivers.remove(key);
        }
    }
}

/// Wrapper holding the snapshot pointer and the operation paths.
pub(crate) struct CacheWrapper {
    inner: ArcSwap<Snapshot>,
    update_lock: tokio::sync::Mutex<()>,
}

impl CacheWrapper {
    pub fn new(name: &str, config: Config) -> Result<Self, CacheError> {
        config.validate()?;
        let mem = match config.kind {
            CacheKind::InMemory => &config.in_memory,
            _ => return Err(CacheError::ConfigTypeNotSupported),
        };

        let store = build_store(&mem.store);
        let coordinator = Arc::new(Coordinator::new(&mem.manufacturer));
        let closed = Arc::new(AtomicBool::new(false));
        let snapshot = Snapshot::from_config(name, mem, store, coordinator, closed);

        Ok(CacheWrapper {
            inner: ArcSwap::from_pointee(snapshot),
            update_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.load_full()
    }

    fn open_snapshot(&self) -> Result<Arc<Snapshot>, CacheError> {
        let snap = self.snapshot();
        if snap.is_closed() {
            return Err(CacheError::CacheClosed);
        }
        Ok(snap)
    }

    pub(crate) fn options(&self, opts: &OpOptions) -> PooledOptions {
        acquire_options(opts)
    }

    pub async fn get<V: CacheValue>(
        &self,
        key: &str,
        opts: &OpOptions,
    ) -> Result<V, CacheError> {
        let snap = self.open_snapshot()?;
        if snap.disabled {
            return Err(CacheError::CacheMiss);
        }
        let option = self.options(opts);
        let fixed = snap.fixed_key(key);

        let mut stats = RequestStats::start(&snap.name, cmd::GET, 1);
        stats.request_size = fixed.len();

        let result = async {
            let value = snap
                .store
                .get(&fixed)
                .await?
                .ok_or(CacheError::CacheMiss)?;
            stats.response_size = value.byte_len();
            let (data, _) = snap.decode_stored(value, option.skip_encoding)?;
            let value = snap.data_to_value::<V>(data, &option)?;
            stats.success_key_count = 1;
            Ok(value)
        }
        .await;

        stats.finish(result.as_ref().err());
        result
    }

    pub async fn get_many<V: CacheValue>(
        &self,
        receivers: &mut HashMap<String, Option<V>>,
        opts: &OpOptions,
    ) -> Result<(), CacheError> {
        let snap = self.open_snapshot()?;
        if receivers.is_empty() {
            return Ok(());
        }
        let option = self.options(opts);

        let keys: Vec<String> = receivers.keys().cloned().collect();
        if snap.disabled {
            for key in &keys {
                handle_missing_key(option.non_exist_key_strategy, receivers, key);
            }
            return Ok(());
        }

        let fixed = snap.fixed_keys(&keys);
        let mut stats = RequestStats::start(&snap.name, cmd::GET_MANY, keys.len());
        stats.request_size = fixed.iter().map(|k| k.len()).sum();

        let result = async {
            let values = snap.store.get_many(&fixed).await?;
            for (idx, value) in values.into_iter().enumerate() {
                let key = &keys[idx];
                match value {
                    None => handle_missing_key(option.non_exist_key_strategy, receivers, key),
                    Some(value) => {
                        stats.response_size += value.byte_len();
                        stats.success_key_count += 1;
                        let (data, _) = snap.decode_stored(value, option.skip_encoding)?;
                        let value = snap.data_to_value::<V>(data, &option)?;
                        receivers.insert(key.clone(), Some(value));
                    }
                }
            }
            Ok(())
        }
        .await;

        stats.finish(result.as_ref().err());
        result
    }

    pub async fn set<V: CacheValue>(
        &self,
        key: &str,
        value: &V,
        expire: Expiration,
        opts: &OpOptions,
    ) -> Result<(), CacheError> {
        let snap = self.open_snapshot()?;
        if snap.disabled {
            return Ok(());
        }
        let option = self.options(opts);
        let fixed = snap.fixed_key(key);

        let mut stats = RequestStats::start(&snap.name, cmd::SET, 1);

        let result = async {
            let expire = snap.translate_expire(expire);
            let data = snap.convert_value(value, &option)?;
            let encoded = snap.encode_item(data, &option, expire)?;
            stats.request_size = fixed.len() + encoded.byte_len();
            snap.store
                .set(&fixed, encoded, snap.store_ttl(expire), &snap.write_options(&option))
                .await
        }
        .await;

        stats.finish(result.as_ref().err());
        result
    }

    pub async fn set_many<V: CacheValue>(
        &self,
        values: &HashMap<String, V>,
        expire: Expiration,
        opts: &OpOptions,
    ) -> Result<(), CacheError> {
        let snap = self.open_snapshot()?;
        if snap.disabled || values.is_empty() {
            return Ok(());
        }
        let option = self.options(opts);

        let mut stats = RequestStats::start(&snap.name, cmd::SET_MANY, values.len());

        let result = async {
            let shared = snap.translate_expire(expire);
            let mut entries = Vec::with_capacity(values.len());
            let mut ttl_overrides: HashMap<String, Option<Duration>> = HashMap::new();

            for (key, value) in values {
                let fixed = snap.fixed_key(key);
                let entry_expire = match option
                    .expiration_map
                    .as_ref()
                    .and_then(|map| map.get(key))
                {
                    Some(e) => {
                        let translated = snap.translate_expire(*e);
                        ttl_overrides.insert(fixed.clone(), snap.store_ttl(translated));
                        translated
                    }
                    None => shared,
                };

                let data = snap.convert_value(value, &option)?;
                let encoded = snap.encode_item(data, &option, entry_expire)?;
                stats.request_size += fixed.len() + encoded.byte_len();
                entries.push((fixed, encoded));
            }

            let mut write_opts = snap.write_options(&option);
            if !ttl_overrides.is_empty() {
                write_opts.expiration_map = Some(ttl_overrides);
            }
            snap.store
                .set_many(entries, snap.store_ttl(shared), &write_opts)
                .await
        }
        .await;

        stats.finish(result.as_ref().err());
        result
    }

    pub async fn add<V: CacheValue>(
        &self,
        key: &str,
        value: &V,
        expire: Expiration,
        opts: &OpOptions,
    ) -> Result<(), CacheError> {
        self.add_or_replace(key, value, expire, cmd::ADD, opts).await
    }

    pub async fn replace<V: CacheValue>(
        &self,
        key: &str,
        value: &V,
        expire: Expiration,
        opts: &OpOptions,
    ) -> Result<(), CacheError> {
        self.add_or_replace(key, value, expire, cmd::REPLACE, opts)
            .await
    }

    async fn add_or_replace<V: CacheValue>(
        &self,
        key: &str,
        value: &V,
        expire: Expiration,
        command: &'static str,
        opts: &OpOptions,
    ) -> Result<(), CacheError> {
        let snap = self.open_snapshot()?;
        if snap.disabled {
            return Err(CacheError::NotStored);
        }
        let option = self.options(opts);
        let fixed = snap.fixed_key(key);

        let mut stats = RequestStats::start(&snap.name, command, 1);

        let result = async {
            let expire = snap.translate_expire(expire);
            let data = snap.convert_value(value, &option)?;
            let encoded = snap.encode_item(data, &option, expire)?;
            stats.request_size = fixed.len() + encoded.byte_len();

            let ttl = snap.store_ttl(expire);
            match command {
                cmd::ADD => snap.store.add(&fixed, encoded, ttl).await,
                _ => snap.store.replace(&fixed, encoded, ttl).await,
            }
        }
        .await;

        stats.finish(result.as_ref().err());
        result
    }

    pub async fn delete(&self, key: &str, opts: &OpOptions) -> Result<(), CacheError> {
        let snap = self.open_snapshot()?;
        if snap.disabled {
            return Ok(());
        }
        let _option = self.options(opts);
        let fixed = snap.fixed_key(key);

        let mut stats = RequestStats::start(&snap.name, cmd::DELETE, 1);
        stats.request_size = fixed.len();

        let result = snap.store.delete(&fixed).await;
        stats.finish(result.as_ref().err());
        result
    }

    pub async fn delete_many(&self, keys: &[String], opts: &OpOptions) -> Result<(), CacheError> {
        let snap = self.open_snapshot()?;
        if snap.disabled || keys.is_empty() {
            return Ok(());
        }
        let option = self.options(opts);
        let fixed = snap.fixed_keys(keys);

        let mut stats = RequestStats::start(&snap.name, cmd::DELETE_MANY, keys.len());
        stats.request_size = fixed.iter().map(|k| k.len()).sum();

        let result = snap
            .store
            .delete_many(&fixed, &snap.write_options(&option))
            .await;
        stats.finish(result.as_ref().err());
        result
    }

    pub async fn increment(
        &self,
        key: &str,
        delta: u64,
        opts: &OpOptions,
    ) -> Result<i64, CacheError> {
        self.counter(key, delta, cmd::INCREMENT, opts).await
    }

    pub async fn decrement(
        &self,
        key: &str,
        delta: u64,
        opts: &OpOptions,
    ) -> Result<i64, CacheError> {
        self.counter(key, delta, cmd::DECREMENT, opts).await
    }

    async fn counter(
        &self,
        key: &str,
        delta: u64,
        command: &'static str,
        opts: &OpOptions,
    ) -> Result<i64, CacheError> {
        let snap = self.open_snapshot()?;
        if snap.disabled {
            return Err(CacheError::CacheMiss);
        }
        let option = self.options(opts);
        let fixed = snap.fixed_key(key);

        let stats = RequestStats::start(&snap.name, command, 1);

        let result = match command {
            cmd::INCREMENT => {
                snap.store
                    .increment(&fixed, delta, option.init_non_exist_key)
                    .await
            }
            _ => {
                snap.store
                    .decrement(&fixed, delta, option.init_non_exist_key)
                    .await
            }
        };

        stats.finish(result.as_ref().err());
        result
    }

    /// Rewrite a key's hard expiration.
    ///
    /// With encoding in play, the stored envelope timestamp must not
    /// decouple from the store TTL, so the entry is read, its soft timestamp
    /// preserved, and a fresh envelope written with the new hard timestamp.
    pub async fn expire(
        &self,
        key: &str,
        expire: Expiration,
        opts: &OpOptions,
    ) -> Result<(), CacheError> {
        let snap = self.open_snapshot()?;
        if snap.disabled {
            return Err(CacheError::CacheMiss);
        }
        let mut option = self.options(opts);
        let fixed = snap.fixed_key(key);

        let mut stats = RequestStats::start(&snap.name, cmd::EXPIRE, 1);
        stats.request_size = fixed.len();

        let result = async {
            let expire = snap.translate_expire(expire);
            let ttl = snap.store_ttl(expire);

            if option.skip_encoding {
                return snap.store.expire(&fixed, ttl).await;
            }

            let value = snap
                .store
                .get(&fixed)
                .await?
                .ok_or(CacheError::CacheMiss)?;
            let (data, header) = snap.decode_stored(value, false)?;

            option.soft_timeout_ts = header.soft_timeout_ts;
            option.hard_timeout_ts = 0;
            let encoded = snap.encode_item(data, &option, expire)?;
            snap.store
                .set(&fixed, encoded, ttl, &snap.write_options(&option))
                .await
        }
        .await;

        stats.finish(result.as_ref().err());
        result
    }

    pub async fn flush(&self) -> Result<(), CacheError> {
        let snap = self.open_snapshot()?;
        if snap.disabled {
            return Ok(());
        }
        let stats = RequestStats::start(&snap.name, cmd::FLUSH, 0);
        let result = snap.store.flush().await;
        stats.finish(result.as_ref().err());
        result
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        let snap = self.open_snapshot()?;
        if snap.disabled {
            return Ok(());
        }
        let stats = RequestStats::start(&snap.name, cmd::PING, 0);
        let result = snap.store.ping().await;
        stats.finish(result.as_ref().err());
        result
    }

    /// Close the cache. The first caller closes the store; later calls (and
    /// concurrent racers) succeed without touching it again.
    pub async fn close(&self) -> Result<(), CacheError> {
        let snap = self.snapshot();
        if snap
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            snap.store.close().await;
        }
        Ok(())
    }

    /// Swap in a new configuration.
    ///
    /// Handlers are rebuilt; the store is rebuilt only when its parameters
    /// changed (the old store is closed after publication, and its entries
    /// are gone). Readers that captured the old snapshot finish against it.
    pub async fn update_config(&self, config: Config) -> Result<(), CacheError> {
        config.validate()?;
        let _guard = self.update_lock.lock().await;

        let current = self.snapshot();
        if current.is_closed() {
            return Err(CacheError::CacheClosed);
        }

        let mem = match config.kind {
            CacheKind::InMemory => &config.in_memory,
            _ => return Err(CacheError::ConfigTypeNotSupported),
        };

        let store_changed = mem.store != current.store_config;
        let store = if store_changed {
            build_store(&mem.store)
        } else {
            Arc::clone(&current.store)
        };
        let coordinator = Arc::new(Coordinator::new(&mem.manufacturer));

        let snapshot = Snapshot::from_config(
            &current.name,
            mem,
            store,
            coordinator,
            Arc::clone(&current.closed),
        );
        self.inner.store(Arc::new(snapshot));

        if store_changed {
            tracing::debug!(
                cache = %current.name,
                kind = ?current.kind,
                "store rebuilt on config update"
            );
            current.store.close().await;
        }
        Ok(())
    }
}

impl Drop for CacheWrapper {
    fn drop(&mut self) {
        let snap = self.inner.load_full();
        if snap
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let store = Arc::clone(&snap.store);
                handle.spawn(async move { store.close().await });
            }
        }
    }
}
