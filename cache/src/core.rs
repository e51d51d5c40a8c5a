//! Shared machinery behind both cache flavors.
//!
//! `CacheCore` owns the table pointer, the metadata, and the statistics,
//! and implements the operations the flavors delegate to. The flavor
//! decides only whether inserts consult the banish list and whether
//! `banish` is available at all.

use crate::error::{CacheError, CacheResult};
use crate::finding::Finding;
use crate::frequency::{FrequencyBuffer, StatEvent};
use crate::hasher::Hasher;
use crate::manager::Manager;
use crate::metadata::Metadata;
use crate::prng::SharedPrng;
use crate::sync::{AtomicBool, AtomicU64, Ordering, ReadWriteSpinLock, TRIES_FAST, TRIES_GUARANTEE, TRIES_SLOW};
use crate::table::{LockFailure, Table};
use crate::value::CachedValue;

use hoard_metrics::CounterGroup;
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

/// Minimum data usage limit granted to any cache, in bytes.
pub const MIN_SIZE: u64 = 16384;

/// Base-2 log of the minimum table allocation in bytes
/// (`2^MIN_LOG_SIZE == MIN_SIZE`).
pub const MIN_LOG_SIZE: u32 = 14;

/// Capacity of the windowed find-statistics buffer.
pub const FIND_STATS_CAPACITY: usize = 16384;

/// Eviction-rate feedback: check once per `EVICTION_MASK + 1` inserts.
const EVICTION_MASK: u64 = 4095;

/// Eviction-rate feedback: request growth above this rate.
const EVICTION_RATE_THRESHOLD: f64 = 0.01;

/// Minimum delay between grow/migrate requests from one cache.
const REQUEST_COOLDOWN_NS: u64 = 100_000_000;

/// Counter slots within the per-cache group.
mod slots {
    pub const FIND_HITS: usize = 0;
    pub const FIND_MISSES: usize = 1;
    pub const INSERTS_TOTAL: usize = 2;
    pub const INSERT_EVICTIONS: usize = 3;
}

/// Monotonic nanoseconds for request cooldowns.
fn now_ns() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

pub(crate) struct CacheCore {
    id: u64,
    manager: Weak<Manager>,
    hasher: Arc<dyn Hasher>,
    prng: Arc<dyn SharedPrng>,
    // `None` once the table has been handed back to the manager at
    // destruction; every operation checks the shutdown flag first.
    table: RwLock<Option<Arc<Table>>>,
    metadata: ReadWriteSpinLock<Metadata>,
    shutdown: AtomicBool,
    find_stats: Option<FrequencyBuffer<StatEvent>>,
    counters: CounterGroup,
    inserts_since_check: AtomicU64,
    window_inserts: AtomicU64,
    window_evictions: AtomicU64,
    migrate_request_time: AtomicU64,
    resize_request_time: AtomicU64,
}

impl CacheCore {
    pub fn new(
        id: u64,
        manager: Weak<Manager>,
        hasher: Arc<dyn Hasher>,
        prng: Arc<dyn SharedPrng>,
        table: Arc<Table>,
        metadata: Metadata,
        enable_windowed_stats: bool,
    ) -> Self {
        let find_stats = enable_windowed_stats
            .then(|| FrequencyBuffer::new(prng.clone(), FIND_STATS_CAPACITY));
        Self {
            id,
            manager,
            hasher,
            prng,
            table: RwLock::new(Some(table)),
            metadata: ReadWriteSpinLock::new(metadata),
            shutdown: AtomicBool::new(false),
            find_stats,
            counters: CounterGroup::new(),
            inserts_since_check: AtomicU64::new(0),
            window_inserts: AtomicU64::new(0),
            window_evictions: AtomicU64::new(0),
            migrate_request_time: AtomicU64::new(0),
            resize_request_time: AtomicU64::new(0),
        }
    }

    /// Bytes of fixed per-cache overhead, excluding table and data
    /// budget. Used by the manager when planning an allocation.
    pub fn fixed_overhead(enable_windowed_stats: bool) -> u64 {
        let stats = if enable_windowed_stats {
            FIND_STATS_CAPACITY as u64
        } else {
            0
        };
        std::mem::size_of::<crate::cache::Cache>() as u64 + stats
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn table(&self) -> Option<Arc<Table>> {
        self.table.read().clone()
    }

    /// Log size of the current table, if one is attached.
    pub fn table_log_size(&self) -> Option<u32> {
        self.table().map(|table| table.log_size())
    }

    // ------------------------------------------------------------------
    // primary operations
    // ------------------------------------------------------------------

    pub fn find(&self, key: &[u8]) -> Finding {
        if self.shutdown.load(Ordering::Acquire) {
            return Finding::fail(CacheError::Shutdown);
        }
        let Some(mut table) = self.table() else {
            return Finding::fail(CacheError::Shutdown);
        };

        let hash = self.hasher.hash_key(key);
        let finding = loop {
            let next = {
                let bucket = table.primary(hash);
                match bucket.lock_shared(TRIES_FAST) {
                    Ok(guard) => match guard.find_slot(hash, key, &*self.hasher) {
                        Some(index) => {
                            let leased = guard.record(index).lease();
                            if index > 0 {
                                // best-effort MRU promotion; skipped when
                                // other readers hold the bucket
                                if let Ok(mut write) = guard.try_upgrade() {
                                    write.promote(index);
                                }
                            }
                            break Finding::hit(leased);
                        }
                        None => break Finding::miss(),
                    },
                    Err(LockFailure::Busy) => break Finding::fail(CacheError::Busy),
                    Err(LockFailure::Migrated) => table.successor(),
                }
            };
            match next {
                Some(successor) => table = successor,
                None => break Finding::fail(CacheError::Busy),
            }
        };

        if finding.found() {
            self.record_stat(StatEvent::FindHit);
        } else if finding.error().is_none() {
            self.record_stat(StatEvent::FindMiss);
        }
        finding
    }

    pub fn insert(&self, record: CachedValue, check_banish: bool) -> CacheResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(CacheError::Shutdown);
        }
        let Some(mut table) = self.table() else {
            return Err(CacheError::Shutdown);
        };

        let hash = self.hasher.hash_key(record.key());
        let record_size = record.size() as i64;
        let mut had_eviction = false;

        let result = loop {
            let next = {
                let bucket = table.primary(hash);
                match bucket.lock_exclusive(TRIES_FAST) {
                    Ok(mut guard) => {
                        if check_banish && guard.is_banished(hash) {
                            break Err(CacheError::Banished);
                        }
                        match guard.find_slot(hash, record.key(), &*self.hasher) {
                            Some(index) => {
                                let delta = record_size - guard.record(index).size() as i64;
                                if !self.adjust_usage_if_allowed(delta) {
                                    break Err(CacheError::ResourceLimit);
                                }
                                let old = guard.replace_at(index, hash, record);
                                guard.promote(index);
                                drop(old);
                                break Ok(());
                            }
                            None => {
                                if guard.is_full() {
                                    // slot eviction: the bucket-LRU entry
                                    let (_, victim) =
                                        guard.evict_last().expect("bucket is full");
                                    self.adjust_usage_if_allowed(-(victim.size() as i64));
                                    table.slot_emptied();
                                    had_eviction = true;
                                }
                                if !self.adjust_usage_if_allowed(record_size) {
                                    // budget eviction: free one more entry
                                    // and retry the admission once
                                    if !had_eviction
                                        && let Some((_, victim)) = guard.evict_last()
                                    {
                                        self.adjust_usage_if_allowed(-(victim.size() as i64));
                                        table.slot_emptied();
                                        had_eviction = true;
                                    }
                                    if !self.adjust_usage_if_allowed(record_size) {
                                        break Err(CacheError::ResourceLimit);
                                    }
                                }
                                guard.insert_front(hash, record);
                                table.slot_filled();
                                break Ok(());
                            }
                        }
                    }
                    Err(LockFailure::Busy) => break Err(CacheError::Busy),
                    Err(LockFailure::Migrated) => table.successor(),
                }
            };
            match next {
                Some(successor) => table = successor,
                None => break Err(CacheError::Busy),
            }
        };

        match result {
            Ok(()) => self.report_insert(had_eviction, &table),
            Err(CacheError::ResourceLimit) => self.request_grow(),
            Err(_) => {}
        }
        result
    }

    pub fn remove(&self, key: &[u8]) -> CacheResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(CacheError::Shutdown);
        }
        let Some(mut table) = self.table() else {
            return Err(CacheError::Shutdown);
        };

        let hash = self.hasher.hash_key(key);
        loop {
            let next = {
                let bucket = table.primary(hash);
                match bucket.lock_exclusive(TRIES_SLOW) {
                    Ok(mut guard) => match guard.find_slot(hash, key, &*self.hasher) {
                        Some(index) => {
                            let victim = guard.remove_at(index);
                            self.adjust_usage_if_allowed(-(victim.size() as i64));
                            table.slot_emptied();
                            break Ok(());
                        }
                        None => break Err(CacheError::NotFound),
                    },
                    Err(LockFailure::Busy) => break Err(CacheError::Busy),
                    Err(LockFailure::Migrated) => table.successor(),
                }
            };
            match next {
                Some(successor) => table = successor,
                None => break Err(CacheError::Busy),
            }
        }
    }

    pub fn banish(&self, key: &[u8]) -> CacheResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(CacheError::Shutdown);
        }
        let Some(mut table) = self.table() else {
            return Err(CacheError::Shutdown);
        };

        let hash = self.hasher.hash_key(key);
        loop {
            let next = {
                let bucket = table.primary(hash);
                match bucket.lock_exclusive(TRIES_SLOW) {
                    Ok(mut guard) => {
                        if let Some(index) = guard.find_slot(hash, key, &*self.hasher) {
                            let victim = guard.remove_at(index);
                            self.adjust_usage_if_allowed(-(victim.size() as i64));
                            table.slot_emptied();
                        }
                        guard.banish_hash(hash);
                        break Ok(());
                    }
                    Err(LockFailure::Busy) => break Err(CacheError::Busy),
                    Err(LockFailure::Migrated) => table.successor(),
                }
            };
            match next {
                Some(successor) => table = successor,
                None => break Err(CacheError::Busy),
            }
        }
    }

    // ------------------------------------------------------------------
    // statistics
    // ------------------------------------------------------------------

    fn record_stat(&self, event: StatEvent) {
        match event {
            StatEvent::FindHit => self.counters.increment(slots::FIND_HITS),
            StatEvent::FindMiss => self.counters.increment(slots::FIND_MISSES),
        }
        if let Some(stats) = &self.find_stats {
            stats.insert(event);
        }
        // sample one in eight accesses into the manager's global ranking
        if self.prng.uniform32() & 7 == 0
            && let Some(manager) = self.manager.upgrade()
        {
            manager.report_access(self.id);
        }
    }

    fn report_insert(&self, had_eviction: bool, table: &Table) {
        self.counters.increment(slots::INSERTS_TOTAL);
        if had_eviction {
            self.counters.increment(slots::INSERT_EVICTIONS);
        }
        let count = self.inserts_since_check.fetch_add(1, Ordering::Relaxed);
        if count & EVICTION_MASK == EVICTION_MASK {
            self.evaluate_growth(table);
        }
    }

    /// Periodic feedback: compare the eviction rate over the most recent
    /// window of inserts against the threshold, and the fill ratio
    /// against the table's growth policy.
    fn evaluate_growth(&self, table: &Table) {
        let inserts = self.counters.load(slots::INSERTS_TOTAL);
        let evictions = self.counters.load(slots::INSERT_EVICTIONS);
        let window_inserts = inserts - self.window_inserts.swap(inserts, Ordering::Relaxed);
        let window_evictions = evictions - self.window_evictions.swap(evictions, Ordering::Relaxed);
        let rate = window_evictions as f64 / window_inserts.max(1) as f64;

        if rate > EVICTION_RATE_THRESHOLD {
            self.request_migrate(table.log_size() + 1);
            return;
        }
        let ideal = table.ideal_log_size();
        if ideal != table.log_size() {
            self.request_migrate(ideal);
        }
    }

    /// Lifetime and windowed hit rates. The windowed rate is `NaN` when
    /// windowed statistics are disabled.
    pub fn hit_rates(&self) -> (f64, f64) {
        let hits = self.counters.load(slots::FIND_HITS) as f64;
        let misses = self.counters.load(slots::FIND_MISSES) as f64;
        let lifetime = if hits + misses > 0.0 {
            hits / (hits + misses)
        } else {
            0.0
        };

        let windowed = match &self.find_stats {
            Some(stats) => {
                let mut hits = 0u64;
                let mut misses = 0u64;
                for (event, count) in stats.frequencies() {
                    match event {
                        StatEvent::FindHit => hits = count,
                        StatEvent::FindMiss => misses = count,
                    }
                }
                if hits + misses > 0 {
                    hits as f64 / (hits + misses) as f64
                } else {
                    0.0
                }
            }
            None => f64::NAN,
        };
        (lifetime, windowed)
    }

    #[cfg(test)]
    pub fn insert_evictions(&self) -> u64 {
        self.counters.load(slots::INSERT_EVICTIONS)
    }

    // ------------------------------------------------------------------
    // accounting
    // ------------------------------------------------------------------

    fn adjust_usage_if_allowed(&self, delta: i64) -> bool {
        self.metadata.write().adjust_usage_if_allowed(delta)
    }

    pub fn usage(&self) -> u64 {
        self.metadata.read().usage()
    }

    pub fn usage_limit(&self) -> u64 {
        self.metadata.read().usage_limit()
    }

    pub fn soft_usage_limit(&self) -> u64 {
        self.metadata.read().soft_usage_limit()
    }

    pub fn allocated_size(&self) -> u64 {
        self.metadata.read().allocated_size()
    }

    /// Allocated size and usage read under one lock acquisition, so the
    /// two values are mutually consistent.
    pub fn size_and_usage(&self) -> (u64, u64) {
        let meta = self.metadata.read();
        (meta.allocated_size(), meta.usage())
    }

    pub fn is_migrating_flag_set(&self) -> bool {
        self.metadata.read().is_migrating()
    }

    pub fn is_resizing_flag_set(&self) -> bool {
        self.metadata.read().is_resizing()
    }

    pub fn is_resizing_or_migrating_flag_set(&self) -> bool {
        self.metadata.read().is_resizing_or_migrating()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Access the metadata under its write lock.
    pub fn with_metadata<R>(&self, body: impl FnOnce(&mut Metadata) -> R) -> R {
        body(&mut self.metadata.write())
    }

    // ------------------------------------------------------------------
    // growth requests
    // ------------------------------------------------------------------

    /// Hint that roughly `num_elements` entries are about to arrive.
    /// Requests migration to a table sized for them at the target fill.
    pub fn size_hint(&self, num_elements: u64) {
        let Some(table) = self.table() else {
            return;
        };
        let desired = (num_elements.max(1).next_power_of_two().trailing_zeros() + 1)
            .clamp(crate::table::MIN_LOG_SIZE, crate::table::MAX_LOG_SIZE);
        if desired > table.log_size() {
            self.request_migrate(desired);
        }
    }

    fn cooldown_elapsed(&self, stamp: &AtomicU64) -> bool {
        // zero means "never requested"
        let now = now_ns().max(1);
        let last = stamp.load(Ordering::Relaxed);
        if last != 0 && now < last.saturating_add(REQUEST_COOLDOWN_NS) {
            return false;
        }
        // one requester wins the window; losers wait out the next one
        stamp
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    fn request_migrate(&self, log_size: u32) {
        if self.shutdown.load(Ordering::Acquire)
            || !self.cooldown_elapsed(&self.migrate_request_time)
        {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.request_migrate(self.id, log_size);
        }
    }

    fn request_grow(&self) {
        if self.shutdown.load(Ordering::Acquire)
            || !self.cooldown_elapsed(&self.resize_request_time)
        {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.request_grow(self.id);
        }
    }

    // ------------------------------------------------------------------
    // background-task entry points
    // ------------------------------------------------------------------

    /// Evict entries, oldest-first within each bucket, visiting buckets
    /// in a randomized order, while `keep_going` returns true (it
    /// receives the size of each reclaimed record).
    ///
    /// Returns true if the sweep ended with the predicate still asking
    /// for more, i.e. work remains.
    pub fn free_memory_while(&self, keep_going: impl Fn(u64) -> bool) -> bool {
        let Some(table) = self.table() else {
            return false;
        };
        let count = table.bucket_count();
        let mask = count - 1;
        let mut index = self.prng.uniform64() as usize & mask;
        // any odd stride is coprime with a power-of-two bucket count
        let stride = (self.prng.uniform64() as usize | 1) & mask;

        for _ in 0..count {
            if let Ok(mut guard) = table.bucket(index).lock_exclusive(TRIES_SLOW) {
                while let Some((_, victim)) = guard.evict_last() {
                    let size = victim.size();
                    self.adjust_usage_if_allowed(-(size as i64));
                    table.slot_emptied();
                    if !keep_going(size) {
                        return false;
                    }
                }
            }
            index = (index + stride) & mask;
        }
        true
    }

    /// Move every entry into `new_table` and swap the table pointer.
    ///
    /// Precondition: the migrating flag is set. The flag stays set; the
    /// migrate task clears it once the manager has taken the drained
    /// table back, so that anyone waiting on the flag observes settled
    /// accounting. Returns the old table, or `None` if the cache had
    /// already been torn down.
    pub fn migrate(&self, new_table: Arc<Table>) -> Option<Arc<Table>> {
        debug_assert!(self.is_migrating_flag_set());
        let Some(old_table) = self.table() else {
            return None;
        };

        old_table.set_successor(new_table.clone());
        old_table.disable();

        for index in 0..old_table.bucket_count() {
            let Ok(mut guard) = old_table.bucket(index).lock_exclusive(TRIES_GUARANTEE) else {
                continue;
            };
            // draining oldest-first preserves recency order in the target
            while let Some((hash, record)) = guard.evict_last() {
                old_table.slot_emptied();
                let target = new_table.primary(hash);
                let Ok(mut target_guard) = target.lock_exclusive(TRIES_GUARANTEE) else {
                    // target bucket cannot be migrated; drop the record
                    self.adjust_usage_if_allowed(-(record.size() as i64));
                    continue;
                };
                if target_guard.is_full() {
                    if let Some((_, victim)) = target_guard.evict_last() {
                        self.adjust_usage_if_allowed(-(victim.size() as i64));
                        new_table.slot_emptied();
                    }
                }
                target_guard.insert_front(hash, record);
                new_table.slot_filled();
            }
            guard.set_migrated();
        }

        *self.table.write() = Some(new_table.clone());
        self.with_metadata(|meta| {
            meta.change_table(new_table.memory_usage());
        });
        Some(old_table)
    }

    // ------------------------------------------------------------------
    // teardown
    // ------------------------------------------------------------------

    /// Enter the terminal state. Returns false if already shut down.
    pub fn begin_shutdown(&self) -> bool {
        let first = self.with_metadata(|meta| meta.begin_shutdown());
        self.shutdown.store(true, Ordering::Release);
        first
    }

    /// Wait for any in-flight migrate/free-memory task to finish.
    /// Must be called without holding any lock.
    pub fn wait_for_background_tasks(&self) {
        loop {
            if !self.is_resizing_or_migrating_flag_set() {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Release every stored record. Requires shutdown to be set and no
    /// background task in flight.
    pub fn drain(&self) {
        debug_assert!(self.is_shutdown());
        let Some(table) = self.table() else {
            return;
        };
        for index in 0..table.bucket_count() {
            let Ok(mut guard) = table.bucket(index).lock_exclusive(TRIES_GUARANTEE) else {
                continue;
            };
            while let Some((_, victim)) = guard.evict_last() {
                self.adjust_usage_if_allowed(-(victim.size() as i64));
                table.slot_emptied();
            }
        }
    }

    /// Detach and return the table for recycling.
    pub fn detach_table(&self) -> Option<Arc<Table>> {
        self.table.write().take()
    }
}
