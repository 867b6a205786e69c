use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use tokio::runtime::Runtime;
use unicache::{
    CompressionAlgo, Expiration, InMemoryConfig, LoaderError, ManufacturerConfig, MetaHeader,
    OpOptions, StampedeMitigationStrategy, StoreBackend, StoreConfig, UnifiedCache,
    envelope_decode, envelope_encode,
};

mod common;
use common::{BenchConfig, BenchUser, FakeDatabase, KeyGenerator};

fn cache_with(backend: StoreBackend) -> UnifiedCache {
    UnifiedCache::in_memory(
        "bench",
        InMemoryConfig {
            store: StoreConfig {
                backend,
                ..Default::default()
            },
            manufacturer: ManufacturerConfig {
                stampede_mitigation: StampedeMitigationStrategy::InProcessSignal,
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .expect("bench cache config is valid")
}

/// Benchmark 1: Hot cache (all hits, pure read performance per backend)
fn bench_hot_cache(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("hot_cache");
    group.sample_size(config.sample_size);

    let keys = KeyGenerator::new(1000).sequential();

    for backend in [StoreBackend::Moka, StoreBackend::HashMap] {
        let cache = cache_with(backend);
        rt.block_on(async {
            for (i, key) in keys.iter().enumerate() {
                cache
                    .set(key, &BenchUser::new(i as u64), Expiration::secs(600), OpOptions::new())
                    .await
                    .unwrap();
            }
        });

        group.throughput(Throughput::Elements(keys.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", backend)),
            &cache,
            |b, cache| {
                b.to_async(&rt).iter(|| async {
                    for key in &keys {
                        let user: BenchUser = cache.get(key, OpOptions::new()).await.unwrap();
                        black_box(user);
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark 2: Load fan-out on a cold key (singleflight collapse)
fn bench_load_singleflight(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("load_singleflight");
    group.sample_size(config.sample_size.min(20));

    let db = FakeDatabase::new(1000, config.db_latency_ms);

    for concurrency in [8u64, 64] {
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter(|| {
                    let db = db.clone();
                    async move {
                        let cache = Arc::new(cache_with(StoreBackend::Moka));
                        let mut handles = Vec::new();
                        for _ in 0..concurrency {
                            let cache = cache.clone();
                            let db = db.clone();
                            handles.push(tokio::spawn(async move {
                                let loader = move |keys: Vec<String>| {
                                    let db = db.clone();
                                    async move {
                                        Ok::<_, LoaderError<BenchUser>>(db.get_many(&keys).await)
                                    }
                                };
                                cache
                                    .load::<BenchUser, _, _>(
                                        loader,
                                        "user:1",
                                        Expiration::secs(600),
                                        OpOptions::new(),
                                    )
                                    .await
                                    .unwrap()
                            }));
                        }
                        for handle in handles {
                            black_box(handle.await.unwrap());
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark 3: Envelope codec throughput
fn bench_envelope(c: &mut Criterion, config: &BenchConfig) {
    let mut group = c.benchmark_group("envelope");
    group.sample_size(config.sample_size);

    let payload: Vec<u8> = (0..16_384u32).map(|i| (i % 251) as u8).collect();
    let header = MetaHeader::new(1_700_000_000, 1_700_003_600);

    for algo in [CompressionAlgo::None, CompressionAlgo::Snappy, CompressionAlgo::Gzip] {
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("encode_decode", format!("{:?}", algo)),
            &algo,
            |b, &algo| {
                b.iter(|| {
                    let encoded = envelope_encode(&payload, algo, header).unwrap();
                    let (decoded, _) = envelope_decode(&encoded).unwrap();
                    black_box(decoded);
                });
            },
        );
    }

    group.finish();
}

fn benchmarks(c: &mut Criterion) {
    let config = BenchConfig::new();
    bench_hot_cache(c, &config);
    bench_load_singleflight(c, &config);
    bench_envelope(c, &config);
}

criterion_group!(benches, benchmarks);
criterion_main!(benches);
