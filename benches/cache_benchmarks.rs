//! Benchmarks for the weighted LRU cache and the text decode cache.
//!
//! Measures hit and miss paths, eviction pressure and contention between
//! threads sharing one cache.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;

use handlegrip::native::HeapNativeApi;
use handlegrip::text::TextDecodeCache;
use handlegrip::WeightedLruCache;

fn by_len(key: &Vec<u8>, value: &usize) -> usize {
    key.len() + value
}

/// Realistic short field values with a few repeats
fn generate_keys(count: usize, distinct: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|_| {
            let id = fastrand::usize(..distinct);
            format!("field-{id:05}").into_bytes()
        })
        .collect()
}

fn bench_get_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_lru");

    for distinct in [64, 1024, 16_384].iter() {
        let keys = generate_keys(4096, *distinct);
        group.throughput(Throughput::Elements(keys.len() as u64));

        group.bench_with_input(BenchmarkId::new("get_or_put", distinct), &keys, |b, keys| {
            let cache = WeightedLruCache::new(64 * 1024, by_len as fn(&Vec<u8>, &usize) -> usize);
            b.iter(|| {
                for key in keys {
                    if cache.get(key.as_slice()).is_none() {
                        cache.insert(key.clone(), key.len());
                    }
                }
            });
        });
    }

    group.finish();
}

fn bench_eviction_pressure(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction_pressure");

    for capacity in [256, 4096, 65_536].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, &capacity| {
            let cache = WeightedLruCache::new(capacity, |_: &u64, v: &usize| *v);
            let mut next = 0u64;
            b.iter(|| {
                for _ in 0..256 {
                    next += 1;
                    cache.insert(next, 1 + fastrand::usize(..64));
                }
                black_box(cache.current_weight())
            });
        });
    }

    group.finish();
}

fn bench_text_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("text_decode");
    let keys = generate_keys(1024, 128);

    group.bench_function("memoized", |b| {
        let decoder = TextDecodeCache::with_limits(Arc::new(HeapNativeApi::default()), 1_000_000, 1_000);
        b.iter(|| {
            for key in &keys {
                black_box(decoder.decode(key).ok());
            }
        });
    });

    group.bench_function("bypassed", |b| {
        let decoder = TextDecodeCache::with_limits(Arc::new(HeapNativeApi::default()), 1_000_000, 0);
        b.iter(|| {
            for key in &keys {
                black_box(decoder.decode(key).ok());
            }
        });
    });

    group.finish();
}

fn bench_contended_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_cache");

    for threads in [1, 2, 4, 8].iter() {
        group.bench_with_input(BenchmarkId::new("threads", threads), threads, |b, &threads| {
            let cache = Arc::new(WeightedLruCache::new(4096, |_: &u32, v: &u32| *v as usize));
            b.iter(|| {
                std::thread::scope(|scope| {
                    for _ in 0..threads {
                        let cache = Arc::clone(&cache);
                        scope.spawn(move || {
                            for _ in 0..500 {
                                let key = fastrand::u32(..512);
                                if cache.get(&key).is_none() {
                                    cache.insert(key, 1 + key % 16);
                                }
                            }
                        });
                    }
                });
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_get_put,
    bench_eviction_pressure,
    bench_text_decode,
    bench_contended_cache
);

criterion_main!(benches);
