//! The cache sum type and convenience insertion helpers.

use crate::core::CacheCore;
use crate::error::CacheResult;
use crate::finding::Finding;
use crate::plain::PlainCache;
use crate::transactional::TransactionalCache;
use crate::value::CachedValue;

/// Which flavor of cache to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    /// No banishment support.
    Plain,
    /// Per-bucket banishment for transactional visibility.
    Transactional,
}

/// A cache instance managed by a [`Manager`](crate::Manager).
///
/// The two flavors share all machinery except the banishment rules; this
/// sum type is what the manager registers and hands out.
pub enum Cache {
    /// See [`PlainCache`].
    Plain(PlainCache),
    /// See [`TransactionalCache`].
    Transactional(TransactionalCache),
}

impl Cache {
    pub(crate) fn new(cache_type: CacheType, core: CacheCore) -> Self {
        match cache_type {
            CacheType::Plain => Cache::Plain(PlainCache::new(core)),
            CacheType::Transactional => Cache::Transactional(TransactionalCache::new(core)),
        }
    }

    pub(crate) fn core(&self) -> &CacheCore {
        match self {
            Cache::Plain(cache) => &cache.core,
            Cache::Transactional(cache) => &cache.core,
        }
    }

    /// This cache's flavor.
    pub fn cache_type(&self) -> CacheType {
        match self {
            Cache::Plain(_) => CacheType::Plain,
            Cache::Transactional(_) => CacheType::Transactional,
        }
    }

    /// The manager-assigned id of this cache.
    pub fn id(&self) -> u64 {
        self.core().id()
    }

    /// Look up a key, leasing the record on a hit.
    pub fn find(&self, key: &[u8]) -> Finding {
        match self {
            Cache::Plain(cache) => cache.find(key),
            Cache::Transactional(cache) => cache.find(key),
        }
    }

    /// Insert a constructed record, taking ownership of it.
    pub fn insert(&self, record: CachedValue) -> CacheResult<()> {
        match self {
            Cache::Plain(cache) => cache.insert(record),
            Cache::Transactional(cache) => cache.insert(record),
        }
    }

    /// Remove a key. `Err(NotFound)` when no such entry exists.
    pub fn remove(&self, key: &[u8]) -> CacheResult<()> {
        match self {
            Cache::Plain(cache) => cache.remove(key),
            Cache::Transactional(cache) => cache.remove(key),
        }
    }

    /// Banish a key at its bucket. `Err(NotSupported)` on plain caches.
    pub fn banish(&self, key: &[u8]) -> CacheResult<()> {
        match self {
            Cache::Plain(cache) => cache.banish(key),
            Cache::Transactional(cache) => cache.banish(key),
        }
    }

    /// Construct a record from raw bytes and insert it, freeing the
    /// record again if the insert is refused.
    pub fn store(&self, key: &[u8], value: &[u8]) -> CacheResult<()> {
        let record = CachedValue::construct(key, value)?;
        self.insert(record)
    }

    /// Total memory this cache accounts for, in bytes.
    pub fn size(&self) -> u64 {
        self.core().allocated_size()
    }

    /// Current data memory usage in bytes.
    pub fn usage(&self) -> u64 {
        self.core().usage()
    }

    /// Limit on data memory usage in bytes.
    pub fn usage_limit(&self) -> u64 {
        self.core().usage_limit()
    }

    /// Allocated size and usage, consistent with each other.
    pub fn size_and_usage(&self) -> (u64, u64) {
        self.core().size_and_usage()
    }

    /// Hint that roughly `num_elements` entries are about to be
    /// inserted, allowing migration to an appropriately sized table.
    pub fn size_hint(&self, num_elements: u64) {
        self.core().size_hint(num_elements);
    }

    /// Lifetime and windowed hit rates. The windowed rate is `NaN` when
    /// windowed statistics are disabled.
    pub fn hit_rates(&self) -> (f64, f64) {
        self.core().hit_rates()
    }

    /// Whether the cache is shrinking or shutting down.
    pub fn is_resizing(&self) -> bool {
        self.core().is_resizing_flag_set() || self.is_shutdown()
    }

    /// Whether the resizing flag specifically is set.
    pub fn is_resizing_flag_set(&self) -> bool {
        self.core().is_resizing_flag_set()
    }

    /// Whether the cache is migrating or shutting down.
    pub fn is_migrating(&self) -> bool {
        self.core().is_migrating_flag_set() || self.is_shutdown()
    }

    /// Whether the migrating flag specifically is set.
    pub fn is_migrating_flag_set(&self) -> bool {
        self.core().is_migrating_flag_set()
    }

    /// Whether either maintenance flag is set.
    pub fn is_resizing_or_migrating_flag_set(&self) -> bool {
        self.core().is_resizing_or_migrating_flag_set()
    }

    /// Whether the cache has begun shutting down.
    pub fn is_shutdown(&self) -> bool {
        self.core().is_shutdown()
    }
}
