//! Micro-benchmarks for the find and insert hot paths.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use hoard_cache::{BinaryKeyHasher, Cache, CacheType, Manager, ManagerConfig, WeylPrng};
use std::sync::Arc;

const RESIDENT_KEYS: u64 = 256;

fn resident_cache() -> (Arc<Manager>, Arc<Cache>) {
    let manager = Manager::new(
        Arc::new(WeylPrng::new(1)),
        None,
        ManagerConfig::new(256 * 1024 * 1024),
    );
    let cache = manager
        .create_cache(CacheType::Plain, Arc::new(BinaryKeyHasher::new()))
        .unwrap();
    for i in 0..RESIDENT_KEYS {
        cache.store(&i.to_le_bytes(), &[0u8; 20]).unwrap();
    }
    (manager, cache)
}

fn bench_find_hit(c: &mut Criterion) {
    let (_manager, cache) = resident_cache();
    let mut i = 0u64;
    c.bench_function("find_hit", |b| {
        b.iter(|| {
            let finding = cache.find(&(i % RESIDENT_KEYS).to_le_bytes());
            black_box(finding.found());
            i += 1;
        })
    });
}

fn bench_find_miss(c: &mut Criterion) {
    let (_manager, cache) = resident_cache();
    let mut i = 1_000_000u64;
    c.bench_function("find_miss", |b| {
        b.iter(|| {
            let finding = cache.find(&i.to_le_bytes());
            black_box(finding.found());
            i += 1;
        })
    });
}

fn bench_insert_replace(c: &mut Criterion) {
    let (_manager, cache) = resident_cache();
    let mut i = 0u64;
    c.bench_function("insert_replace", |b| {
        b.iter(|| {
            black_box(cache.store(&(i % RESIDENT_KEYS).to_le_bytes(), &[1u8; 20])).ok();
            i += 1;
        })
    });
}

criterion_group!(benches, bench_find_hit, bench_find_miss, bench_insert_replace);
criterion_main!(benches);
