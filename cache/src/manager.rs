//! The manager: global memory pool, cache registry, and task dispatch.
//!
//! All caches created through one manager share its global memory
//! budget. The manager serializes admission decisions under one lock,
//! retains detached tables for fast reuse, ranks caches by recent access
//! frequency to pick reclamation victims, and posts maintenance work to
//! the host's executor.
//!
//! Lock order is manager state, then cache metadata, then table buckets;
//! nothing acquires in the reverse direction.

use crate::cache::{Cache, CacheType};
use crate::config::ManagerConfig;
use crate::core::{CacheCore, MIN_SIZE};
use crate::error::{CacheError, CacheResult};
use crate::frequency::{CacheAccess, FrequencyBuffer};
use crate::hasher::Hasher;
use crate::prng::SharedPrng;
use crate::stats::{self, CacheMemoryRow, MemoryStats};
use crate::sync::{AtomicU64, Ordering, spin_loop};
use crate::table::Table;
use crate::tasks::{FreeMemoryTask, MigrateTask, ResizeTask};

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// A unit of background work handed to the executor.
pub type Task = Box<dyn FnOnce() + Send>;

/// The executor callback: returns true if the task was scheduled.
pub type PostFn = Box<dyn Fn(Task) -> bool + Send + Sync>;

/// Table log size granted to new caches (512 buckets, 64 KiB).
const INITIAL_LOG_SIZE: u32 = 9;

/// Data budget granted to new caches.
const INITIAL_USAGE_LIMIT: u64 = 2 * MIN_SIZE;

/// Maximum number of detached tables retained for reuse.
const SPARE_TABLES_CAPACITY: usize = 16;

/// How many reclamation victims one denied request may shrink.
const RECLAIM_VICTIMS: usize = 2;

struct ManagerState {
    global_allocation: u64,
    caches: HashMap<u64, Arc<Cache>, ahash::RandomState>,
    // detached tables kept for reuse, ordered largest-first; reclaimed
    // from the back under pressure
    spare_tables: Vec<Arc<Table>>,
    active_tables: u64,
}

/// Central coordinator for a set of caches sharing one memory budget.
pub struct Manager {
    config: ManagerConfig,
    prng: Arc<dyn SharedPrng>,
    post: Option<PostFn>,
    access_stats: FrequencyBuffer<CacheAccess>,
    next_cache_id: AtomicU64,
    fixed_overhead: u64,
    state: Mutex<ManagerState>,
}

impl Manager {
    /// Create a manager with the given PRNG, executor callback, and
    /// configuration. Passing `None` for the executor disables
    /// background tasks; migration and resize then degrade to refusals
    /// that roll back cleanly.
    pub fn new(
        prng: Arc<dyn SharedPrng>,
        post: Option<PostFn>,
        config: ManagerConfig,
    ) -> Arc<Manager> {
        // the access ranking buffer scales with the budget it arbitrates
        let access_capacity = (config.global_limit / 1024).clamp(1024, 1 << 22) as usize;
        let access_stats = FrequencyBuffer::new(prng.clone(), access_capacity);
        let fixed_overhead =
            std::mem::size_of::<Manager>() as u64 + access_stats.memory_usage();

        let manager = Arc::new(Manager {
            config,
            prng,
            post,
            access_stats,
            next_cache_id: AtomicU64::new(0),
            fixed_overhead,
            state: Mutex::new(ManagerState {
                global_allocation: fixed_overhead,
                caches: HashMap::with_hasher(ahash::RandomState::new()),
                spare_tables: Vec::new(),
                active_tables: 0,
            }),
        });
        manager.publish_locked(&manager.state.lock());
        manager
    }

    /// The configured global memory limit in bytes.
    pub fn global_limit(&self) -> u64 {
        self.config.global_limit
    }

    /// Bytes currently accounted against the global limit.
    pub fn global_allocation(&self) -> u64 {
        self.state.lock().global_allocation
    }

    // ------------------------------------------------------------------
    // cache lifecycle
    // ------------------------------------------------------------------

    /// Create and register a cache of the given flavor.
    ///
    /// Fails with `ResourceLimit` when the global budget cannot cover a
    /// new cache even after reclaiming spare tables.
    pub fn create_cache(
        self: &Arc<Self>,
        cache_type: CacheType,
        hasher: Arc<dyn Hasher>,
    ) -> CacheResult<Arc<Cache>> {
        let fixed = CacheCore::fixed_overhead(self.config.enable_windowed_stats);
        let table_size = Table::allocation_size(INITIAL_LOG_SIZE);
        let usage_limit = INITIAL_USAGE_LIMIT;
        let max_size = self.config.high_water().max(usage_limit);

        let mut state = self.state.lock();
        let spare_index = state
            .spare_tables
            .iter()
            .position(|table| table.log_size() == INITIAL_LOG_SIZE);
        let recycled = spare_index.map(|index| state.spare_tables.remove(index));

        // a recycled table is already part of the global allocation
        let charge = fixed + usage_limit + if recycled.is_some() { 0 } else { table_size };
        Self::reclaim_spares(&mut state, self.config.global_limit, charge);
        if state.global_allocation + charge > self.config.global_limit {
            if let Some(table) = recycled {
                state.global_allocation -= table.memory_usage();
            }
            tracing::debug!("cache creation denied by global limit");
            return Err(CacheError::ResourceLimit);
        }

        let table = match recycled {
            Some(table) => table,
            None => Arc::new(Table::new(INITIAL_LOG_SIZE)?),
        };
        let id = self.next_cache_id.fetch_add(1, Ordering::Relaxed) + 1;
        let metadata =
            crate::metadata::Metadata::new(fixed, table.memory_usage(), usage_limit, max_size);
        let core = CacheCore::new(
            id,
            Arc::downgrade(self),
            hasher,
            self.prng.clone(),
            table,
            metadata,
            self.config.enable_windowed_stats,
        );
        let cache = Arc::new(Cache::new(cache_type, core));

        state.caches.insert(id, cache.clone());
        state.global_allocation += charge;
        state.active_tables += 1;
        self.publish_locked(&state);
        tracing::debug!(cache = id, "cache created");
        Ok(cache)
    }

    /// Shut a cache down, release its records, and return its memory to
    /// the global pool. The table is retained as a spare when the
    /// retention heuristic allows.
    pub fn destroy_cache(&self, cache: &Arc<Cache>) {
        let core = cache.core();
        if !core.begin_shutdown() {
            return;
        }
        // let any in-flight migrate/free-memory task finish first; we
        // hold no locks here
        core.wait_for_background_tasks();
        core.drain();
        let table = core.detach_table();
        let allocated = core.allocated_size();

        let mut state = self.state.lock();
        if state.caches.remove(&core.id()).is_none() {
            // not one of ours; nothing was ever accounted here
            return;
        }
        state.global_allocation -= allocated;
        state.active_tables -= 1;
        if let Some(table) = table {
            self.reclaim_table(&mut state, table);
        }
        self.publish_locked(&state);
        tracing::debug!(cache = core.id(), "cache destroyed");
    }

    // ------------------------------------------------------------------
    // requests from caches
    // ------------------------------------------------------------------

    /// Record an access for the reclamation ranking.
    pub(crate) fn report_access(&self, id: u64) {
        self.access_stats.insert(CacheAccess(id));
    }

    /// Try to double a cache's usage limit. On denial, posts free-memory
    /// tasks against the coldest caches to release pressure for a later
    /// attempt.
    pub(crate) fn request_grow(self: &Arc<Self>, id: u64) -> bool {
        let victims;
        {
            let mut state = self.state.lock();
            let Some(cache) = state.caches.get(&id).cloned() else {
                return false;
            };
            let core = cache.core();
            let (current, max) = core.with_metadata(|meta| (meta.usage_limit(), meta.max_size()));
            let new_limit = current.saturating_mul(2).min(max);
            if new_limit <= current {
                return false;
            }
            let delta = new_limit - current;
            Self::reclaim_spares(&mut state, self.config.global_limit, delta);
            if state.global_allocation + delta <= self.config.global_limit {
                state.global_allocation += delta;
                core.with_metadata(|meta| meta.grow_limits(new_limit));
                self.publish_locked(&state);
                tracing::debug!(cache = id, new_limit, "usage limit grown");
                return true;
            }
            victims = Self::rank_reclaim_victims(&state, &self.access_stats, id);
        }
        tracing::debug!(cache = id, "growth denied; shrinking cold caches");
        for victim in victims {
            self.shrink_cache(victim);
        }
        false
    }

    /// Try to migrate a cache to a table of `requested_log` buckets.
    /// Returns true if a migrate task was scheduled.
    pub(crate) fn request_migrate(self: &Arc<Self>, id: u64, requested_log: u32) -> bool {
        let requested =
            requested_log.clamp(crate::table::MIN_LOG_SIZE, crate::table::MAX_LOG_SIZE);

        let (cache, new_table) = {
            let mut state = self.state.lock();
            let Some(cache) = state.caches.get(&id).cloned() else {
                return false;
            };
            let core = cache.core();
            if core.table_log_size() == Some(requested) {
                return false;
            }
            if !core.with_metadata(|meta| meta.begin_migrating()) {
                return false;
            }

            let table_size = Table::allocation_size(requested);
            let spare_index = state
                .spare_tables
                .iter()
                .position(|table| table.log_size() == requested);
            let recycled = spare_index.map(|index| state.spare_tables.remove(index));
            let charge = if recycled.is_some() { 0 } else { table_size };
            Self::reclaim_spares(&mut state, self.config.global_limit, charge);
            if state.global_allocation + charge > self.config.global_limit {
                if let Some(table) = recycled {
                    state.spare_tables.push(table);
                    Self::sort_spares(&mut state);
                }
                core.with_metadata(|meta| meta.end_migrating());
                tracing::debug!(cache = id, requested, "migration denied by global limit");
                return false;
            }

            let new_table = match recycled {
                Some(table) => table,
                None => match Table::new(requested) {
                    Ok(table) => Arc::new(table),
                    Err(_) => {
                        core.with_metadata(|meta| meta.end_migrating());
                        tracing::warn!(cache = id, requested, "table allocation failed");
                        return false;
                    }
                },
            };
            state.global_allocation += charge;
            state.active_tables += 1;
            self.publish_locked(&state);
            (cache, new_table)
        };

        let task = MigrateTask {
            cache: cache.clone(),
            manager: Arc::downgrade(self),
            new_table: new_table.clone(),
        };
        if self.post_task(Box::new(move || task.run())) {
            tracing::debug!(cache = id, requested, "migration scheduled");
            return true;
        }

        // executor refused: roll the reservation back
        {
            let mut state = self.state.lock();
            state.active_tables -= 1;
            state.global_allocation -= new_table.memory_usage();
            self.reclaim_table(&mut state, new_table);
            self.publish_locked(&state);
        }
        cache.core().with_metadata(|meta| meta.end_migrating());
        tracing::debug!(cache = id, "executor refused migration task");
        false
    }

    // ------------------------------------------------------------------
    // task completion callbacks
    // ------------------------------------------------------------------

    /// A migration finished: the drained table leaves the accounting and
    /// may be retained as a spare.
    pub(crate) fn migrate_completed(&self, old_table: Arc<Table>) {
        let mut state = self.state.lock();
        state.global_allocation -= old_table.memory_usage();
        state.active_tables -= 1;
        self.reclaim_table(&mut state, old_table);
        self.publish_locked(&state);
    }

    /// A migration found its cache already torn down; take the unused
    /// table back.
    pub(crate) fn migration_aborted(&self, new_table: Arc<Table>) {
        let mut state = self.state.lock();
        state.global_allocation -= new_table.memory_usage();
        state.active_tables -= 1;
        self.reclaim_table(&mut state, new_table);
        self.publish_locked(&state);
    }

    /// A shrink committed: `released` reserved bytes return to the pool.
    pub(crate) fn resize_committed(&self, released: u64) {
        let mut state = self.state.lock();
        state.global_allocation -= released;
        self.publish_locked(&state);
    }

    // ------------------------------------------------------------------
    // rebalancing
    // ------------------------------------------------------------------

    /// Re-target cold, oversized caches toward the low-water mark.
    /// Returns true if any shrink was initiated.
    pub fn rebalance(self: &Arc<Self>) -> bool {
        let mut planned = Vec::new();
        {
            let state = self.state.lock();
            let tallies: HashMap<u64, u64> = self
                .access_stats
                .frequencies()
                .into_iter()
                .map(|(access, count)| (access.0, count))
                .collect();
            for (id, cache) in &state.caches {
                let core = cache.core();
                if core.is_shutdown() || core.is_resizing_flag_set() {
                    continue;
                }
                let (limit, usage) =
                    core.with_metadata(|meta| (meta.usage_limit(), meta.usage()));
                let cold = tallies.get(id).copied().unwrap_or(0) == 0;
                if cold && limit > MIN_SIZE && usage < limit / 2 {
                    planned.push((cache.clone(), (limit / 2).max(MIN_SIZE)));
                }
            }
        }
        let mut started = false;
        for (cache, new_limit) in planned {
            let task = ResizeTask {
                cache,
                manager: Arc::downgrade(self),
                new_limit,
            };
            started |= self.post_task(Box::new(move || task.run()));
        }
        started
    }

    /// Start shrinking one victim's usage limit toward half.
    fn shrink_cache(self: &Arc<Self>, cache: Arc<Cache>) {
        let core = cache.core();
        let started = core.with_metadata(|meta| {
            let target = (meta.usage_limit() / 2).max(MIN_SIZE);
            target < meta.usage_limit() && meta.begin_resize_to(target)
        });
        if !started {
            return;
        }
        let task = FreeMemoryTask {
            cache: cache.clone(),
            manager: Arc::downgrade(self),
        };
        if !self.post_task(Box::new(move || task.run())) {
            cache.core().with_metadata(|meta| meta.abandon_resize());
            tracing::debug!(cache = cache.id(), "executor refused free-memory task");
        }
    }

    /// Rank caches for reclamation: least recently accessed first,
    /// larger usage breaking ties.
    fn rank_reclaim_victims(
        state: &ManagerState,
        access_stats: &FrequencyBuffer<CacheAccess>,
        requester: u64,
    ) -> Vec<Arc<Cache>> {
        let tallies: HashMap<u64, u64> = access_stats
            .frequencies()
            .into_iter()
            .map(|(access, count)| (access.0, count))
            .collect();
        let mut rows: Vec<(u64, u64, Arc<Cache>)> = state
            .caches
            .iter()
            .filter(|(id, cache)| {
                **id != requester
                    && !cache.core().is_shutdown()
                    && !cache.core().is_resizing_flag_set()
            })
            .map(|(id, cache)| {
                let count = tallies.get(id).copied().unwrap_or(0);
                (count, cache.usage(), cache.clone())
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        rows.into_iter()
            .take(RECLAIM_VICTIMS)
            .map(|(_, _, cache)| cache)
            .collect()
    }

    // ------------------------------------------------------------------
    // snapshots
    // ------------------------------------------------------------------

    /// Snapshot the memory accounting. `tries` bounds the spin on the
    /// manager lock; `TRIES_GUARANTEE` blocks until acquired.
    pub fn memory_stats(&self, tries: u64) -> Option<MemoryStats> {
        let state = self.lock_state(tries)?;
        let spare_allocation = state
            .spare_tables
            .iter()
            .map(|table| table.memory_usage())
            .sum();
        let mut caches: Vec<CacheMemoryRow> = state
            .caches
            .values()
            .map(|cache| {
                let (size, usage) = cache.size_and_usage();
                CacheMemoryRow {
                    id: cache.id(),
                    size,
                    usage,
                }
            })
            .collect();
        caches.sort_by_key(|row| row.id);
        Some(MemoryStats {
            global_limit: self.config.global_limit,
            global_allocation: state.global_allocation,
            spare_allocation,
            active_tables: state.active_tables,
            spare_tables: state.spare_tables.len() as u64,
            caches,
        })
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    pub(crate) fn post_task(&self, task: Task) -> bool {
        match &self.post {
            Some(post) => post(task),
            None => false,
        }
    }

    fn lock_state(&self, tries: u64) -> Option<MutexGuard<'_, ManagerState>> {
        let mut attempt = 0u64;
        loop {
            if let Some(guard) = self.state.try_lock() {
                return Some(guard);
            }
            if attempt >= tries {
                return None;
            }
            spin_loop();
            attempt += 1;
        }
    }

    /// Free spare tables, smallest first, until `charge` more bytes fit
    /// under the limit or no spares remain.
    fn reclaim_spares(state: &mut ManagerState, limit: u64, charge: u64) {
        while state.global_allocation + charge > limit {
            let Some(table) = state.spare_tables.pop() else {
                return;
            };
            state.global_allocation -= table.memory_usage();
        }
    }

    /// Retain a detached table as a spare when the heuristic allows,
    /// otherwise free it.
    ///
    /// Precondition: the caller has already deducted `table`'s bytes
    /// from `global_allocation`, so the retention test below compares
    /// `global_allocation + table_size` (the allocation if the table is
    /// kept) against `ideal_upper_ratio * global_limit`.
    fn reclaim_table(&self, state: &mut ManagerState, mut table: Arc<Table>) {
        let size = table.memory_usage();
        debug_assert!(state.global_allocation >= self.fixed_overhead);
        let sole_owner = Arc::get_mut(&mut table)
            .map(|inner| inner.reset())
            .is_some();
        if sole_owner
            && state.spare_tables.len() < SPARE_TABLES_CAPACITY
            && state.global_allocation + size <= self.config.high_water()
        {
            state.global_allocation += size;
            state.spare_tables.push(table);
            Self::sort_spares(state);
        }
    }

    fn sort_spares(state: &mut ManagerState) {
        state
            .spare_tables
            .sort_by(|a, b| b.log_size().cmp(&a.log_size()));
    }

    fn publish_locked(&self, state: &ManagerState) {
        let spare_allocation = state
            .spare_tables
            .iter()
            .map(|table| table.memory_usage())
            .sum();
        stats::publish(
            self.config.global_limit,
            state.global_allocation,
            spare_allocation,
            state.active_tables,
            state.spare_tables.len() as u64,
        );
    }

    #[cfg(test)]
    pub(crate) fn fixed_overhead_for_tests(&self) -> u64 {
        self.fixed_overhead
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::hasher::BinaryKeyHasher;
    use crate::prng::WeylPrng;
    use crate::sync::TRIES_GUARANTEE;

    fn manager(limit: u64) -> Arc<Manager> {
        Manager::new(
            Arc::new(WeylPrng::new(0x5EED)),
            None,
            ManagerConfig::new(limit),
        )
    }

    fn hasher() -> Arc<dyn Hasher> {
        Arc::new(BinaryKeyHasher::with_fixed_seeds())
    }

    #[test]
    fn test_idle_allocation_is_nonzero_and_bounded() {
        let manager = manager(1024 * 1024);
        assert!(manager.global_allocation() > 0);
        assert!(manager.global_allocation() < manager.global_limit());
        assert_eq!(manager.global_allocation(), manager.fixed_overhead_for_tests());
    }

    #[test]
    fn test_idle_allocation_scales_with_limit() {
        let big = manager(4u64 * 1024 * 1024 * 1024);
        assert!(big.global_allocation() > 1024 * 1024);
        assert!(big.global_allocation() < big.global_limit());
    }

    #[test]
    fn test_create_accounts_exactly() {
        let manager = manager(1024 * 1024);
        let before = manager.global_allocation();
        let cache = manager
            .create_cache(CacheType::Plain, hasher())
            .unwrap();
        assert_eq!(manager.global_allocation(), before + cache.size());
        let stats = manager.memory_stats(TRIES_GUARANTEE).unwrap();
        assert_eq!(stats.active_tables, 1);
        assert_eq!(stats.spare_tables, 0);
        assert_eq!(stats.caches.len(), 1);
    }

    #[test]
    fn test_destroy_returns_memory() {
        let manager = manager(1024 * 1024);
        let idle = manager.global_allocation();
        let cache = manager
            .create_cache(CacheType::Transactional, hasher())
            .unwrap();
        cache.store(b"key", b"value").unwrap();
        manager.destroy_cache(&cache);

        let stats = manager.memory_stats(TRIES_GUARANTEE).unwrap();
        assert_eq!(stats.active_tables, 0);
        assert!(cache.is_shutdown());
        // either freed outright or retained as a spare, accounted either way
        assert_eq!(
            stats.global_allocation - stats.spare_allocation,
            idle
        );
    }

    #[test]
    fn test_spare_table_is_recycled() {
        let manager = manager(1024 * 1024);
        let cache = manager.create_cache(CacheType::Plain, hasher()).unwrap();
        manager.destroy_cache(&cache);
        drop(cache);
        let stats = manager.memory_stats(TRIES_GUARANTEE).unwrap();
        assert_eq!(stats.spare_tables, 1);

        let again = manager.create_cache(CacheType::Plain, hasher()).unwrap();
        let stats = manager.memory_stats(TRIES_GUARANTEE).unwrap();
        assert_eq!(stats.spare_tables, 0);
        assert_eq!(stats.active_tables, 1);
        again.store(b"key", b"value").unwrap();
        assert!(again.find(b"key").found());
    }

    #[test]
    fn test_admission_denied_when_full() {
        let manager = manager(200 * 1024);
        let mut caches = Vec::new();
        loop {
            match manager.create_cache(CacheType::Plain, hasher()) {
                Ok(cache) => caches.push(cache),
                Err(error) => {
                    assert_eq!(error, CacheError::ResourceLimit);
                    break;
                }
            }
            assert!(caches.len() < 16, "limit never enforced");
        }
        assert!(!caches.is_empty());
    }

    #[test]
    fn test_request_grow_doubles_limit() {
        let manager = manager(8 * 1024 * 1024);
        let cache = manager.create_cache(CacheType::Plain, hasher()).unwrap();
        let before = cache.usage_limit();
        let before_allocation = manager.global_allocation();
        assert!(manager.request_grow(cache.id()));
        assert_eq!(cache.usage_limit(), before * 2);
        assert_eq!(
            manager.global_allocation(),
            before_allocation + before
        );
    }

    #[test]
    fn test_request_migrate_without_executor_rolls_back() {
        let manager = manager(8 * 1024 * 1024);
        let cache = manager.create_cache(CacheType::Plain, hasher()).unwrap();
        let before = manager.memory_stats(TRIES_GUARANTEE).unwrap();
        assert!(!manager.request_migrate(cache.id(), INITIAL_LOG_SIZE + 1));
        assert!(!cache.is_migrating_flag_set());
        let after = manager.memory_stats(TRIES_GUARANTEE).unwrap();
        assert_eq!(before.active_tables, after.active_tables);
        // the reserved table was rolled back into the spare pool or freed
        assert_eq!(
            before.global_allocation,
            after.global_allocation - after.spare_allocation
        );
    }

    #[test]
    fn test_rebalance_shrinks_cold_cache() {
        // an executor that runs tasks inline
        let manager = Manager::new(
            Arc::new(WeylPrng::new(0x5EED)),
            Some(Box::new(|task| {
                task();
                true
            })),
            ManagerConfig::new(8 * 1024 * 1024),
        );
        let cache = manager.create_cache(CacheType::Plain, hasher()).unwrap();
        assert!(manager.request_grow(cache.id()));
        let grown = cache.usage_limit();
        let allocation = manager.global_allocation();

        // the cache is cold and mostly empty, so rebalance shrinks it
        assert!(manager.rebalance());
        assert!(cache.usage_limit() < grown);
        assert!(!cache.is_resizing_flag_set());
        assert!(manager.global_allocation() < allocation);
    }

    #[test]
    fn test_memory_stats_busy_with_zero_tries() {
        let manager = manager(1024 * 1024);
        let guard = manager.state.lock();
        assert!(manager.memory_stats(0).is_none());
        drop(guard);
        assert!(manager.memory_stats(TRIES_GUARANTEE).is_some());
    }
}
