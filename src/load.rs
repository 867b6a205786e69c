//! The load pipeline: classify requested keys, serve what the cache has,
//! refresh soft-expired entries in the background, and fill misses through
//! the loader, with at most one loader call per key in flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;

use crate::entry::{CacheItem, CacheValue, Expiration};
use crate::error::CacheError;
use crate::options::ResolvedOptions;
use crate::singleflight::{CallOutcome, LoadFailure};
use crate::stats::{RequestStats, cmd};
use crate::utils::now_unix;
use crate::wrapper::{CacheWrapper, Snapshot, handle_missing_key};

/// Failure reported by a data loader.
///
/// `Degraded` carries a full-length result set produced despite an error:
/// those values are served and cached briefly under the on-error expiration.
/// A `Degraded` with a short vector is treated as `Failed`.
#[derive(Debug)]
pub enum LoaderError<V> {
    Failed(String),
    Degraded {
        values: Vec<Option<V>>,
        message: String,
    },
}

impl<V> LoaderError<V> {
    pub fn failed(message: impl Into<String>) -> Self {
        LoaderError::Failed(message.into())
    }
}

/// How the requested keys split after the cache read.
struct Classified {
    missing: Vec<String>,
    to_refresh: Vec<String>,
}

impl CacheWrapper {
    /// Like `get`, but a missing key invokes the loader, caches the result
    /// and returns it. A soft-expired entry is returned as-is while a
    /// background refresh replaces it.
    pub async fn load<V, L, Fut>(
        &self,
        loader: L,
        key: &str,
        expire: Expiration,
        opts: &crate::options::OpOptions,
    ) -> Result<V, CacheError>
    where
        V: CacheValue,
        L: Fn(Vec<String>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Option<V>>, LoaderError<V>>> + Send + 'static,
    {
        let mut receivers: HashMap<String, Option<V>> = HashMap::new();
        receivers.insert(key.to_string(), None);
        self.load_many(loader, &mut receivers, expire, opts).await?;
        receivers
            .remove(key)
            .flatten()
            .ok_or(CacheError::CacheMiss)
    }

    /// Multi-key [`Self::load`]. The receiver map supplies the key set and
    /// collects the results; keys the loader returned nothing for are left
    /// as `None`.
    pub async fn load_many<V, L, Fut>(
        &self,
        loader: L,
        receivers: &mut HashMap<String, Option<V>>,
        expire: Expiration,
        opts: &crate::options::OpOptions,
    ) -> Result<(), CacheError>
    where
        V: CacheValue,
        L: Fn(Vec<String>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Option<V>>, LoaderError<V>>> + Send + 'static,
    {
        let snap = self.open_snapshot_for_load()?;
        let mut option = self.options(opts);
        if option.skip_encoding {
            return Err(CacheError::InvalidConfig(
                "skip_encoding is not allowed for load operations".into(),
            ));
        }
        if receivers.is_empty() {
            return Ok(());
        }

        let expire = snap.translate_expire(expire);
        option.hard_expiration = expire;

        let mut stats = RequestStats::start(&snap.name, cmd::LOAD_MANY, receivers.len());

        let result = async {
            let classified = if snap.disabled {
                Classified {
                    missing: receivers.keys().cloned().collect(),
                    to_refresh: Vec::new(),
                }
            } else {
                classify(&snap, receivers, &option, &mut stats).await?
            };

            if !classified.to_refresh.is_empty() {
                spawn_refresh(&snap, loader.clone(), classified.to_refresh, expire, &option);
            }

            if classified.missing.is_empty() {
                return Ok(());
            }
            fill_missing(
                &snap,
                loader,
                classified.missing,
                receivers,
                expire,
                &option,
            )
            .await
        }
        .await;

        stats.finish(result.as_ref().err());
        result
    }

    fn open_snapshot_for_load(&self) -> Result<Arc<Snapshot>, CacheError> {
        let snap = self.snapshot();
        if snap.is_closed() {
            return Err(CacheError::CacheClosed);
        }
        Ok(snap)
    }
}

/// Phase 1: one `get_many`, then per key decide hit, hit-but-refresh, or
/// missing. Hard-expired entries count as missing; soft-expired entries are
/// served and queued for refresh.
async fn classify<V: CacheValue>(
    snap: &Snapshot,
    receivers: &mut HashMap<String, Option<V>>,
    option: &ResolvedOptions,
    stats: &mut RequestStats,
) -> Result<Classified, CacheError> {
    let keys: Vec<String> = receivers.keys().cloned().collect();
    let fixed = snap.fixed_keys(&keys);
    let values = snap.store.get_many(&fixed).await?;

    let now = now_unix();
    let mut classified = Classified {
        missing: Vec::new(),
        to_refresh: Vec::new(),
    };

    for (idx, value) in values.into_iter().enumerate() {
        let key = &keys[idx];
        match value {
            None => classified.missing.push(key.clone()),
            Some(value) => {
                stats.response_size += value.byte_len();
                let (data, header) = snap.decode_stored(value, false)?;
                if header.is_hard_expired(now) {
                    classified.missing.push(key.clone());
                    continue;
                }
                let value = snap.data_to_value::<V>(data, option)?;
                receivers.insert(key.clone(), Some(value));
                stats.success_key_count += 1;
                if header.is_soft_expired(now) {
                    classified.to_refresh.push(key.clone());
                }
            }
        }
    }

    Ok(classified)
}

/// Phase 2: refresh soft-expired keys in a detached task.
///
/// The coordinator reference is captured before spawning so a config swap
/// cannot strand the in-flight refresh; losers of `add` are dropped because
/// someone else is already refreshing and the caller holds a valid
/// (soft-stale) value.
fn spawn_refresh<V, L, Fut>(
    snap: &Arc<Snapshot>,
    loader: L,
    to_refresh: Vec<String>,
    expire: Expiration,
    option: &ResolvedOptions,
) where
    V: CacheValue,
    L: Fn(Vec<String>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Option<V>>, LoaderError<V>>> + Send + 'static,
{
    let coordinator = Arc::clone(&snap.coordinator);
    let (to_handle, _waiters) = coordinator.add(&to_refresh);
    if to_handle.is_empty() {
        return;
    }

    let snap = Arc::clone(snap);
    let option = option.clone();
    tokio::spawn(async move {
        let (outcomes, error) =
            run_loader_and_store(&snap, loader, to_handle, expire, &option, false).await;
        coordinator.complete(outcomes);
        if let Some(error) = error {
            tracing::warn!(cache = %snap.name, error = %error, "async cache refresh failed");
        }
    });
}

/// Phase 3: load missing keys synchronously. Winners run the loader, write
/// back and complete; waiters block on the winner's outcome. The first error
/// is reported after every key has been given its result.
async fn fill_missing<V, L, Fut>(
    snap: &Arc<Snapshot>,
    loader: L,
    missing: Vec<String>,
    receivers: &mut HashMap<String, Option<V>>,
    expire: Expiration,
    option: &ResolvedOptions,
) -> Result<(), CacheError>
where
    V: CacheValue,
    L: Fn(Vec<String>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Option<V>>, LoaderError<V>>> + Send + 'static,
{
    let coordinator = Arc::clone(&snap.coordinator);
    let (to_handle, waiters) = coordinator.add(&missing);
    let mut first_error: Option<CacheError> = None;

    if !to_handle.is_empty() {
        let (outcomes, error) =
            run_loader_and_store(snap, loader, to_handle, expire, option, snap.disabled).await;
        // unblock waiters before touching receivers
        coordinator.complete(outcomes.clone());
        if let Some(error) = error {
            first_error = Some(error);
        }
        for (key, outcome) in outcomes {
            if let Err(error) = outcome_into_receiver(snap, option, receivers, &key, outcome) {
                first_error.get_or_insert(error);
            }
        }
    }

    let waits = waiters.into_iter().map(|(key, call)| async move {
        let outcome = call.wait().await;
        (key, outcome)
    });
    for (key, outcome) in join_all(waits).await {
        if let Err(error) = outcome_into_receiver(snap, option, receivers, &key, outcome) {
            first_error.get_or_insert(error);
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Invoke the loader for `keys`, write non-nil results back through the
/// write path, and produce the per-key outcomes for `complete`.
///
/// The loader runs inside its own task so a panic is contained and every
/// winning key still gets an outcome.
async fn run_loader_and_store<V, L, Fut>(
    snap: &Snapshot,
    loader: L,
    keys: Vec<String>,
    expire: Expiration,
    option: &ResolvedOptions,
    skip_store_write: bool,
) -> (Vec<(String, CallOutcome)>, Option<CacheError>)
where
    V: CacheValue,
    L: Fn(Vec<String>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Option<V>>, LoaderError<V>>> + Send + 'static,
{
    let all_failed = |failure: LoadFailure| {
        keys.iter()
            .map(|k| (k.clone(), CallOutcome::Failed(failure.clone())))
            .collect::<Vec<_>>()
    };

    let loaded = match tokio::spawn(loader(keys.clone())).await {
        Err(join_error) => {
            tracing::warn!(cache = %snap.name, error = %join_error, "data loader panicked");
            return (
                all_failed(LoadFailure::Panic),
                Some(CacheError::DataLoaderPanic),
            );
        }
        Ok(result) => result,
    };

    let (values, effective_expire) = match loaded {
        Ok(values) => (values, expire),
        Err(LoaderError::Degraded { values, message }) if values.len() == keys.len() => {
            tracing::warn!(
                cache = %snap.name,
                error = %message,
                "data loader degraded; caching full result set briefly"
            );
            (values, Expiration::After(option.on_err_expiration))
        }
        Err(LoaderError::Degraded { message, .. }) | Err(LoaderError::Failed(message)) => {
            return (
                all_failed(LoadFailure::Error(message.clone())),
                Some(CacheError::DataLoader(message)),
            );
        }
    };

    if values.len() != keys.len() {
        return (
            all_failed(LoadFailure::ShortResult),
            Some(CacheError::DataLoaderShortResult),
        );
    }

    let now = now_unix();
    let mut outcomes = Vec::with_capacity(keys.len());

    for (idx, value) in values.into_iter().enumerate() {
        let key = &keys[idx];
        let Some(value) = value else {
            outcomes.push((key.clone(), CallOutcome::Miss));
            continue;
        };

        let per_key_expire = match option
            .expiration_map
            .as_ref()
            .and_then(|map| map.get(key))
        {
            Some(e) => snap.translate_expire(*e),
            None => effective_expire,
        };

        let data = match snap.convert_value(&value, option) {
            Ok(data) => data,
            Err(error) => {
                outcomes.push((
                    key.clone(),
                    CallOutcome::Failed(LoadFailure::Error(error.to_string())),
                ));
                continue;
            }
        };
        let header = snap.build_header(option, per_key_expire, now);
        let item = CacheItem::new(header, data);

        if !skip_store_write {
            match snap.encode_prepared(&item) {
                Ok(encoded) => {
                    let write = snap
                        .store
                        .set(
                            &snap.fixed_key(key),
                            encoded,
                            snap.store_ttl(per_key_expire),
                            &snap.write_options(option),
                        )
                        .await;
                    if let Err(error) = write {
                        tracing::warn!(
                            cache = %snap.name,
                            key = %key,
                            error = %error,
                            "failed to cache loaded value"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        cache = %snap.name,
                        key = %key,
                        error = %error,
                        "failed to encode loaded value"
                    );
                }
            }
        }

        outcomes.push((key.clone(), CallOutcome::Ready(item)));
    }

    (outcomes, None)
}

/// Deliver a singleflight outcome into a receiver slot.
fn outcome_into_receiver<V: CacheValue>(
    snap: &Snapshot,
    option: &ResolvedOptions,
    receivers: &mut HashMap<String, Option<V>>,
    key: &str,
    outcome: CallOutcome,
) -> Result<(), CacheError> {
    match outcome {
        CallOutcome::Ready(item) => {
            let value = snap.data_to_value::<V>(item.data, option)?;
            receivers.insert(key.to_string(), Some(value));
            Ok(())
        }
        CallOutcome::Miss => {
            handle_missing_key(option.non_exist_key_strategy, receivers, key);
            Ok(())
        }
        CallOutcome::Failed(LoadFailure::Panic) => Err(CacheError::DataLoaderPanic),
        CallOutcome::Failed(LoadFailure::ShortResult) => Err(CacheError::DataLoaderShortResult),
        CallOutcome::Failed(LoadFailure::Error(message)) => Err(CacheError::DataLoader(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, InMemoryConfig, ManufacturerConfig, StampedeMitigationStrategy};
    use crate::options::OpOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn in_process_wrapper() -> CacheWrapper {
        CacheWrapper::new(
            "load-test",
            Config::in_memory(InMemoryConfig {
                manufacturer: ManufacturerConfig {
                    stampede_mitigation: StampedeMitigationStrategy::InProcessSignal,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_load_miss_invokes_loader_and_caches() {
        let wrapper = in_process_wrapper();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let loader = move |keys: Vec<String>| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(keys.iter().map(|k| Some(format!("v:{}", k))).collect())
            }
        };

        let got: String = wrapper
            .load(loader.clone(), "k1", Expiration::secs(60), &OpOptions::new())
            .await
            .unwrap();
        assert_eq!(got, "v:k1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // second load is a pure hit
        let got: String = wrapper
            .load(loader, "k1", Expiration::secs(60), &OpOptions::new())
            .await
            .unwrap();
        assert_eq!(got, "v:k1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_nil_result_not_cached() {
        let wrapper = in_process_wrapper();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let loader = move |keys: Vec<String>| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, LoaderError<String>>(keys.iter().map(|_| None).collect())
            }
        };

        let err = wrapper
            .load::<String, _, _>(loader.clone(), "k1", Expiration::secs(60), &OpOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err, CacheError::CacheMiss);

        // nothing cached: the loader runs again
        let _ = wrapper
            .load::<String, _, _>(loader, "k1", Expiration::secs(60), &OpOptions::new())
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_load_short_result_errors() {
        let wrapper = in_process_wrapper();

        let loader = move |_keys: Vec<String>| async move {
            Ok::<_, LoaderError<String>>(vec![Some("only-one".to_string())])
        };

        let mut receivers: HashMap<String, Option<String>> = HashMap::new();
        receivers.insert("a".to_string(), None);
        receivers.insert("b".to_string(), None);

        let err = wrapper
            .load_many(loader, &mut receivers, Expiration::secs(60), &OpOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err, CacheError::DataLoaderShortResult);
    }

    #[tokio::test]
    async fn test_load_loader_panic_converted() {
        let wrapper = in_process_wrapper();

        let loader = move |_keys: Vec<String>| async move {
            panic!("loader exploded");
            #[allow(unreachable_code)]
            Ok::<Vec<Option<String>>, LoaderError<String>>(vec![])
        };

        let err = wrapper
            .load::<String, _, _>(loader, "k1", Expiration::secs(60), &OpOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err, CacheError::DataLoaderPanic);
    }

    #[tokio::test]
    async fn test_load_degraded_full_result_served() {
        let wrapper = in_process_wrapper();

        let loader = move |keys: Vec<String>| async move {
            Err(LoaderError::Degraded {
                values: keys.iter().map(|k| Some(format!("stale:{}", k))).collect(),
                message: "backend flapping".to_string(),
            })
        };

        let got: String = wrapper
            .load(loader, "k1", Expiration::secs(60), &OpOptions::new())
            .await
            .unwrap();
        assert_eq!(got, "stale:k1");

        // cached under the short on-error expiration
        let got: String = wrapper.get("k1", &OpOptions::new()).await.unwrap();
        assert_eq!(got, "stale:k1");
    }

    #[tokio::test]
    async fn test_skip_encoding_rejected_for_load() {
        let wrapper = in_process_wrapper();
        let loader =
            move |_keys: Vec<String>| async move { Ok::<_, LoaderError<String>>(vec![None]) };
        let err = wrapper
            .load::<String, _, _>(
                loader,
                "k1",
                Expiration::secs(60),
                &OpOptions::new().skip_encoding(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_soft_expired_entry_served_then_refreshed() {
        let wrapper = in_process_wrapper();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let loader = move |keys: Vec<String>| {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, LoaderError<String>>(
                    keys.iter().map(|_| Some(format!("v{}", n))).collect(),
                )
            }
        };

        let opts = OpOptions::new().soft_expiration(Duration::from_secs(1));
        let got: String = wrapper
            .load(loader.clone(), "k1", Expiration::secs(60), &opts)
            .await
            .unwrap();
        assert_eq!(got, "v0");

        // cross the soft deadline (second granularity)
        tokio::time::sleep(Duration::from_millis(2100)).await;

        // stale value served synchronously, refresh scheduled
        let got: String = wrapper
            .load(loader.clone(), "k1", Expiration::secs(60), &opts)
            .await
            .unwrap();
        assert_eq!(got, "v0");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // the refreshed value is what the next load sees
        let got: String = wrapper
            .load(loader, "k1", Expiration::secs(60), &opts)
            .await
            .unwrap();
        assert_eq!(got, "v1");
    }

    #[tokio::test]
    async fn test_concurrent_loads_collapse_to_one_loader_call() {
        let wrapper = Arc::new(in_process_wrapper());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let wrapper = wrapper.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let loader = move |keys: Vec<String>| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, LoaderError<String>>(
                            keys.iter().map(|_| Some("shared".to_string())).collect(),
                        )
                    }
                };
                wrapper
                    .load::<String, _, _>(loader, "hot", Expiration::secs(60), &OpOptions::new())
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiters_observe_winner_failure() {
        let wrapper = Arc::new(in_process_wrapper());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let wrapper = wrapper.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let loader = move |_keys: Vec<String>| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<Vec<Option<String>>, _>(LoaderError::failed("origin down"))
                    }
                };
                wrapper
                    .load::<String, _, _>(loader, "down", Expiration::secs(60), &OpOptions::new())
                    .await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err, CacheError::DataLoader("origin down".to_string()));
        }
        // all ten observed the single loader invocation's failure
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
