//! Cache operation tests: fill and verify, eviction under overflow, and
//! mixed multi-threaded load.

use hoard_cache::{
    BinaryKeyHasher, CacheType, Manager, ManagerConfig, PostFn, SharedPrng, TRIES_GUARANTEE,
    WeylPrng,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn prng() -> Arc<WeylPrng> {
    Arc::new(WeylPrng::new(0xFEED))
}

fn hasher() -> Arc<BinaryKeyHasher> {
    Arc::new(BinaryKeyHasher::new())
}

fn spawning_executor() -> PostFn {
    Box::new(|task| {
        std::thread::Builder::new()
            .name("cache-maintenance".into())
            .spawn(move || task())
            .is_ok()
    })
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// =============================================================================
// Single-threaded semantics
// =============================================================================

#[test]
fn test_insert_find_remove_deterministic() {
    let manager = Manager::new(prng(), None, ManagerConfig::new(16 * 1024 * 1024));
    let cache = manager.create_cache(CacheType::Plain, hasher()).unwrap();

    cache.store(b"key", b"first").unwrap();
    assert_eq!(cache.find(b"key").value().unwrap().value(), b"first");

    cache.store(b"key", b"second").unwrap();
    assert_eq!(cache.find(b"key").value().unwrap().value(), b"second");

    cache.remove(b"key").unwrap();
    assert!(!cache.find(b"key").found());
    assert!(cache.remove(b"key").is_err());

    manager.destroy_cache(&cache);
}

#[test]
fn test_finding_outlives_removal() {
    let manager = Manager::new(prng(), None, ManagerConfig::new(16 * 1024 * 1024));
    let cache = manager.create_cache(CacheType::Plain, hasher()).unwrap();

    cache.store(b"pinned", b"payload").unwrap();
    let finding = cache.find(b"pinned");
    assert!(finding.found());

    cache.remove(b"pinned").unwrap();
    assert!(!cache.find(b"pinned").found());

    // the held reference keeps the record alive past removal
    assert_eq!(finding.value().unwrap().value(), b"payload");
    let copied = finding.copy();
    drop(finding);
    assert_eq!(copied.value().unwrap().key(), b"pinned");
    drop(copied);

    manager.destroy_cache(&cache);
}

// =============================================================================
// Fill, verify, overflow
// =============================================================================

#[test]
fn test_fill_verify_then_overflow_evicts() {
    let manager = Manager::new(
        prng(),
        Some(spawning_executor()),
        ManagerConfig::new(64 * 1024 * 1024),
    );
    let cache = manager.create_cache(CacheType::Plain, hasher()).unwrap();
    let initial_size = cache.size();

    // preallocate for the incoming load and wait for the migration
    cache.size_hint(1000);
    assert!(
        wait_until(Duration::from_secs(10), || {
            !cache.is_migrating_flag_set() && cache.size() > initial_size
        }),
        "size hint migration did not complete"
    );

    for i in 0u64..1000 {
        cache.store(&i.to_le_bytes(), &i.to_le_bytes()).unwrap();
    }
    for i in 0u64..1000 {
        let finding = cache.find(&i.to_le_bytes());
        assert!(finding.found(), "key {i} missing after fill");
        assert_eq!(finding.value().unwrap().value(), i.to_le_bytes());
    }

    // ten times the data budget in unique keys forces eviction
    for i in 1000u64..14_000 {
        let _ = cache.store(&i.to_le_bytes(), &i.to_le_bytes());
    }
    let misses = (0u64..1000)
        .filter(|i| !cache.find(&i.to_le_bytes()).found())
        .count();
    assert!(misses > 0, "overflow did not evict anything");

    let (lifetime, windowed) = cache.hit_rates();
    assert!(lifetime > 0.0 && lifetime < 1.0);
    assert!(!windowed.is_nan());

    manager.destroy_cache(&cache);
}

// =============================================================================
// Mixed multi-threaded load
// =============================================================================

#[test]
fn test_mixed_cache_types_under_mixed_load() {
    let manager = Manager::new(
        prng(),
        Some(spawning_executor()),
        ManagerConfig::new(1 << 30),
    );
    let cache_count = 4usize;
    let caches: Vec<_> = (0..cache_count)
        .map(|i| {
            let cache_type = if i % 2 == 0 {
                CacheType::Plain
            } else {
                CacheType::Transactional
            };
            manager.create_cache(cache_type, hasher()).unwrap()
        })
        .collect();
    let caches = Arc::new(caches);

    let chunk_size = 1u64 << 16;
    let initial_inserts = 1u64 << 14;
    let operation_count = 1u64 << 17;
    let hit_count = Arc::new(AtomicU64::new(0));
    let miss_count = Arc::new(AtomicU64::new(0));
    let find_count = Arc::new(AtomicU64::new(0));

    let threads: Vec<_> = (0..4u64)
        .map(|thread_id| {
            let caches = caches.clone();
            let hit_count = hit_count.clone();
            let miss_count = miss_count.clone();
            let find_count = find_count.clone();
            std::thread::spawn(move || {
                let lower = thread_id * chunk_size;
                let upper = (thread_id + 1) * chunk_size - 1;
                let prng = WeylPrng::new(0xACE + thread_id);

                // fill with some initial data
                for i in 0..initial_inserts {
                    let item = lower + i;
                    let cache = &caches[(item % cache_count as u64) as usize];
                    let _ = cache.store(&item.to_le_bytes(), &item.to_le_bytes());
                }

                // valid range for keys that *might* be in cache
                let mut valid_lower = lower;
                let mut valid_upper = lower + initial_inserts - 1;

                for _ in 0..operation_count {
                    let r = prng.uniform32() % 100;
                    if r >= 99 {
                        // remove something
                        if valid_lower == valid_upper {
                            continue;
                        }
                        let item = valid_lower;
                        valid_lower += 1;
                        let cache = &caches[(item % cache_count as u64) as usize];
                        let _ = cache.remove(&item.to_le_bytes());
                    } else if r >= 95 {
                        // insert something
                        if valid_upper == upper {
                            continue;
                        }
                        valid_upper += 1;
                        let item = valid_upper;
                        let cache = &caches[(item % cache_count as u64) as usize];
                        let _ = cache.store(&item.to_le_bytes(), &item.to_le_bytes());
                    } else {
                        // look something up
                        let span = valid_upper - valid_lower + 1;
                        let item = valid_lower + prng.uniform64() % span;
                        let key = item.to_le_bytes();
                        let cache = &caches[(item % cache_count as u64) as usize];
                        find_count.fetch_add(1, Ordering::Relaxed);
                        let finding = cache.find(&key);
                        if finding.found() {
                            hit_count.fetch_add(1, Ordering::Relaxed);
                            assert_eq!(finding.value().unwrap().key(), key);
                        } else {
                            miss_count.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(
        hit_count.load(Ordering::Relaxed) + miss_count.load(Ordering::Relaxed),
        find_count.load(Ordering::Relaxed)
    );

    for cache in caches.iter() {
        manager.destroy_cache(cache);
    }
    let stats = manager.memory_stats(TRIES_GUARANTEE).unwrap();
    assert_eq!(stats.active_tables, 0);
}
