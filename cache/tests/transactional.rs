//! Banishment semantics of the transactional cache flavor.

use hoard_cache::{
    BinaryKeyHasher, CacheError, CacheType, Manager, ManagerConfig, PostFn, WeylPrng,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn prng() -> Arc<WeylPrng> {
    Arc::new(WeylPrng::new(0xBEEF))
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

#[test]
fn test_banish_sequence() {
    let manager = Manager::new(prng(), None, ManagerConfig::new(16 * 1024 * 1024));
    let cache = manager
        .create_cache(CacheType::Transactional, hasher())
        .unwrap();
    let key = 42u64.to_le_bytes();

    cache.store(&key, &1u64.to_le_bytes()).unwrap();
    cache.banish(&key).unwrap();
    assert!(!cache.find(&key).found());
    assert_eq!(
        cache.store(&key, &2u64.to_le_bytes()),
        Err(CacheError::Banished)
    );
    // the banished entry was dropped, so there is nothing to remove
    assert_eq!(cache.remove(&key), Err(CacheError::NotFound));

    manager.destroy_cache(&cache);
}

#[test]
fn test_banish_absent_key_is_allowed() {
    let manager = Manager::new(prng(), None, ManagerConfig::new(16 * 1024 * 1024));
    let cache = manager
        .create_cache(CacheType::Transactional, hasher())
        .unwrap();

    cache.banish(b"never-stored").unwrap();
    assert_eq!(
        cache.store(b"never-stored", b"value"),
        Err(CacheError::Banished)
    );

    manager.destroy_cache(&cache);
}

#[test]
fn test_banishment_cleared_by_migration() {
    let manager = Manager::new(
        prng(),
        Some(spawning_executor()),
        ManagerConfig::new(64 * 1024 * 1024),
    );
    let cache = manager
        .create_cache(CacheType::Transactional, hasher())
        .unwrap();
    let initial_size = cache.size();

    cache.store(b"poisoned", b"v1").unwrap();
    cache.banish(b"poisoned").unwrap();
    assert_eq!(cache.store(b"poisoned", b"v2"), Err(CacheError::Banished));

    // migrate to a larger table; fresh buckets carry no banishment
    cache.size_hint(5000);
    assert!(
        wait_until(Duration::from_secs(10), || {
            !cache.is_migrating_flag_set() && cache.size() > initial_size
        }),
        "migration did not complete"
    );

    cache.store(b"poisoned", b"v2").unwrap();
    assert_eq!(cache.find(b"poisoned").value().unwrap().value(), b"v2");

    manager.destroy_cache(&cache);
}

#[test]
fn test_plain_cache_refuses_banish() {
    let manager = Manager::new(prng(), None, ManagerConfig::new(16 * 1024 * 1024));
    let cache = manager.create_cache(CacheType::Plain, hasher()).unwrap();
    assert_eq!(cache.banish(b"key"), Err(CacheError::NotSupported));
    manager.destroy_cache(&cache);
}

#[test]
fn test_windowed_stats_disabled_reports_nan() {
    let manager = Manager::new(
        prng(),
        None,
        ManagerConfig::new(16 * 1024 * 1024).with_windowed_stats(false),
    );
    let cache = manager
        .create_cache(CacheType::Transactional, hasher())
        .unwrap();
    cache.store(b"key", b"value").unwrap();
    assert!(cache.find(b"key").found());

    let (lifetime, windowed) = cache.hit_rates();
    assert_eq!(lifetime, 1.0);
    assert!(windowed.is_nan());

    manager.destroy_cache(&cache);
}
