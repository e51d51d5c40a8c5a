//! Power-of-two bucket table with per-bucket spinlocks.
//!
//! A [`Table`] is an array of `2^log_size` fixed-capacity [`Bucket`]s.
//! Each bucket carries its own lock word supporting shared and exclusive
//! acquisition with a bounded retry budget, plus a sticky *migrated* bit
//! that permanently redirects callers to the table's successor once the
//! bucket has been drained by a migration.
//!
//! Bucket layout (128 bytes, cache-line aligned):
//! ```text
//! [0..4]     lock word: [write (1)][migrated (1)][reader count (30)]
//! [8..128]   guarded data:
//!            banish_term: u32
//!            banish_count, banish_next: u8
//!            hashes:   [u32; 8]      slot hash tags, front = most recent
//!            banished: [u32; 4]      FIFO of banished hashes
//!            values:   [Option<CachedValue>; 8]
//! ```
//!
//! Slots form a recency-ordered prefix: occupied entries are contiguous
//! from index 0 (most recently used) and the last occupied slot is the
//! eviction candidate. Both cache flavors share this layout; the plain
//! flavor simply never consults the banish fields, which keeps detached
//! tables reusable by either flavor.

use crate::error::{CacheError, CacheResult};
use crate::sync::{AtomicBool, AtomicU32, AtomicU64, Ordering, spin_loop};
use crate::value::CachedValue;

use parking_lot::RwLock;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Slots per bucket.
pub(crate) const SLOTS_PER_BUCKET: usize = 8;

/// Banish entries per bucket.
pub(crate) const BANISH_CAPACITY: usize = 4;

/// Bytes per bucket, including the lock word.
pub(crate) const BUCKET_BYTES: usize = 128;

/// Minimum table log size: 2^7 buckets at 128 bytes each is the 16 KiB
/// minimum table allocation.
pub(crate) const MIN_LOG_SIZE: u32 = 7;

/// Maximum table log size.
pub(crate) const MAX_LOG_SIZE: u32 = 24;

/// Fill ratio above which a table wants to grow.
pub(crate) const GROW_FILL_RATIO: f64 = 0.5;

/// Fill ratio below which a table wants to shrink (after two consecutive
/// observations).
pub(crate) const SHRINK_FILL_RATIO: f64 = 0.125;

const WRITE: u32 = 1 << 31;
const MIGRATED: u32 = 1 << 30;

/// Why a bucket lock acquisition did not produce a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockFailure {
    /// The retry budget ran out.
    Busy,
    /// The bucket was drained by a migration; retry against the
    /// successor table.
    Migrated,
}

/// The data guarded by a bucket's lock word.
pub(crate) struct BucketData {
    banish_term: u32,
    banish_count: u8,
    banish_next: u8,
    hashes: [u32; SLOTS_PER_BUCKET],
    banished: [u32; BANISH_CAPACITY],
    values: [Option<CachedValue>; SLOTS_PER_BUCKET],
}

impl BucketData {
    fn new() -> Self {
        Self {
            banish_term: 0,
            banish_count: 0,
            banish_next: 0,
            hashes: [0; SLOTS_PER_BUCKET],
            banished: [0; BANISH_CAPACITY],
            values: [const { None }; SLOTS_PER_BUCKET],
        }
    }

    /// Number of occupied slots; occupied slots are a prefix.
    pub fn occupied(&self) -> usize {
        self.values.iter().take_while(|slot| slot.is_some()).count()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.values[SLOTS_PER_BUCKET - 1].is_some()
    }

    /// Locate the slot holding `key`, if any.
    pub fn find_slot(
        &self,
        hash: u32,
        key: &[u8],
        hasher: &dyn crate::hasher::Hasher,
    ) -> Option<usize> {
        for (index, slot) in self.values.iter().enumerate() {
            let Some(record) = slot else {
                break;
            };
            if self.hashes[index] == hash && hasher.same_key(record.key(), key) {
                return Some(index);
            }
        }
        None
    }

    /// Reference the record in `index`.
    pub fn record(&self, index: usize) -> &CachedValue {
        self.values[index].as_ref().expect("slot is occupied")
    }

    /// Move the slot at `index` to the front (most recently used).
    pub fn promote(&mut self, index: usize) {
        if index > 0 {
            self.values[..=index].rotate_right(1);
            self.hashes[..=index].rotate_right(1);
        }
    }

    /// Install a record at the front. The bucket must not be full.
    pub fn insert_front(&mut self, hash: u32, record: CachedValue) {
        let occupied = self.occupied();
        debug_assert!(occupied < SLOTS_PER_BUCKET);
        self.values[..=occupied].rotate_right(1);
        self.hashes[..=occupied].rotate_right(1);
        self.values[0] = Some(record);
        self.hashes[0] = hash;
    }

    /// Replace the record at `index`, returning the old one.
    pub fn replace_at(&mut self, index: usize, hash: u32, record: CachedValue) -> CachedValue {
        let old = self.values[index].replace(record).expect("slot is occupied");
        self.hashes[index] = hash;
        old
    }

    /// Remove the record at `index`, compacting the prefix.
    pub fn remove_at(&mut self, index: usize) -> CachedValue {
        let occupied = self.occupied();
        debug_assert!(index < occupied);
        let record = self.values[index].take().expect("slot is occupied");
        self.values[index..occupied].rotate_left(1);
        self.hashes[index..occupied].rotate_left(1);
        record
    }

    /// Remove the least recently used record, if any.
    pub fn evict_last(&mut self) -> Option<(u32, CachedValue)> {
        let occupied = self.occupied();
        if occupied == 0 {
            return None;
        }
        let hash = self.hashes[occupied - 1];
        self.values[occupied - 1].take().map(|record| (hash, record))
    }

    /// Whether `hash` is currently banished at this bucket.
    pub fn is_banished(&self, hash: u32) -> bool {
        self.banished[..self.banish_count as usize].contains(&hash)
    }

    /// Add `hash` to the banish list, overwriting the oldest entry when
    /// the list is full, and bump the banish term.
    pub fn banish_hash(&mut self, hash: u32) {
        if !self.is_banished(hash) {
            if (self.banish_count as usize) < BANISH_CAPACITY {
                self.banished[self.banish_count as usize] = hash;
                self.banish_count += 1;
            } else {
                self.banished[self.banish_next as usize] = hash;
                self.banish_next = (self.banish_next + 1) % BANISH_CAPACITY as u8;
            }
        }
        self.banish_term = self.banish_term.wrapping_add(1);
    }

    #[cfg(test)]
    pub fn banish_term(&self) -> u32 {
        self.banish_term
    }

    fn reset(&mut self) {
        self.banish_term = 0;
        self.banish_count = 0;
        self.banish_next = 0;
        self.hashes = [0; SLOTS_PER_BUCKET];
        self.banished = [0; BANISH_CAPACITY];
        for slot in &mut self.values {
            debug_assert!(slot.is_none());
            *slot = None;
        }
    }
}

/// One bucket: a lock word plus guarded slot data.
#[repr(align(128))]
pub(crate) struct Bucket {
    state: AtomicU32,
    data: UnsafeCell<BucketData>,
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(std::mem::size_of::<Bucket>() == BUCKET_BYTES);

// SAFETY: `data` is only reached through the guards below, which enforce
// the reader/writer protocol on `state`.
unsafe impl Send for Bucket {}
unsafe impl Sync for Bucket {}

impl Bucket {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(BucketData::new()),
        }
    }

    /// Acquire the bucket in shared mode within `tries` attempts.
    pub fn lock_shared(&self, tries: u64) -> Result<BucketReadGuard<'_>, LockFailure> {
        let mut attempt = 0u64;
        while attempt < tries {
            let state = self.state.load(Ordering::Relaxed);
            if state & MIGRATED != 0 {
                return Err(LockFailure::Migrated);
            }
            if state & WRITE == 0
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return Ok(BucketReadGuard { bucket: self });
            }
            spin_loop();
            attempt += 1;
        }
        Err(LockFailure::Busy)
    }

    /// Acquire the bucket exclusively within `tries` attempts.
    pub fn lock_exclusive(&self, tries: u64) -> Result<BucketWriteGuard<'_>, LockFailure> {
        let mut attempt = 0u64;
        while attempt < tries {
            let state = self.state.load(Ordering::Relaxed);
            if state & MIGRATED != 0 {
                return Err(LockFailure::Migrated);
            }
            if state == 0
                && self
                    .state
                    .compare_exchange_weak(0, WRITE, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return Ok(BucketWriteGuard { bucket: self });
            }
            spin_loop();
            attempt += 1;
        }
        Err(LockFailure::Busy)
    }
}

/// Shared access to a bucket's data.
pub(crate) struct BucketReadGuard<'a> {
    bucket: &'a Bucket,
}

impl std::fmt::Debug for BucketReadGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketReadGuard").finish()
    }
}

impl<'a> BucketReadGuard<'a> {
    /// Try to upgrade to exclusive access. Succeeds only when this is the
    /// sole reader; on failure the shared lock is kept.
    pub fn try_upgrade(self) -> Result<BucketWriteGuard<'a>, BucketReadGuard<'a>> {
        if self
            .bucket
            .state
            .compare_exchange(1, WRITE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let bucket = self.bucket;
            std::mem::forget(self);
            Ok(BucketWriteGuard { bucket })
        } else {
            Err(self)
        }
    }
}

impl Drop for BucketReadGuard<'_> {
    fn drop(&mut self) {
        self.bucket.state.fetch_sub(1, Ordering::Release);
    }
}

impl Deref for BucketReadGuard<'_> {
    type Target = BucketData;
    fn deref(&self) -> &BucketData {
        // SAFETY: shared lock held; no writer can exist.
        unsafe { &*self.bucket.data.get() }
    }
}

/// Exclusive access to a bucket's data.
pub(crate) struct BucketWriteGuard<'a> {
    bucket: &'a Bucket,
}

impl BucketWriteGuard<'_> {
    /// Permanently mark this bucket as drained by a migration. The bit
    /// survives the guard; later lock attempts report
    /// [`LockFailure::Migrated`].
    pub fn set_migrated(&mut self) {
        self.bucket.state.fetch_or(MIGRATED, Ordering::Release);
    }
}

impl Drop for BucketWriteGuard<'_> {
    fn drop(&mut self) {
        // clear the write bit, preserving a migrated mark
        self.bucket.state.fetch_and(!WRITE, Ordering::Release);
    }
}

impl Deref for BucketWriteGuard<'_> {
    type Target = BucketData;
    fn deref(&self) -> &BucketData {
        // SAFETY: exclusive lock held.
        unsafe { &*self.bucket.data.get() }
    }
}

impl DerefMut for BucketWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut BucketData {
        // SAFETY: exclusive lock held.
        unsafe { &mut *self.bucket.data.get() }
    }
}

/// Array of `2^log_size` buckets plus migration bookkeeping.
pub(crate) struct Table {
    log_size: u32,
    mask: u32,
    buckets: Box<[Bucket]>,
    disabled: AtomicBool,
    successor: RwLock<Option<Arc<Table>>>,
    slots_used: AtomicU64,
    low_fill_checks: AtomicU32,
}

impl Table {
    /// Allocate a table of `2^log_size` buckets.
    pub fn new(log_size: u32) -> CacheResult<Table> {
        debug_assert!((MIN_LOG_SIZE..=MAX_LOG_SIZE).contains(&log_size));
        let count = 1usize << log_size;
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(count)
            .map_err(|_| CacheError::OutOfMemory)?;
        buckets.extend((0..count).map(|_| Bucket::new()));
        Ok(Table {
            log_size,
            mask: (count - 1) as u32,
            buckets: buckets.into_boxed_slice(),
            disabled: AtomicBool::new(false),
            successor: RwLock::new(None),
            slots_used: AtomicU64::new(0),
            low_fill_checks: AtomicU32::new(0),
        })
    }

    /// Bytes a table of `2^log_size` buckets occupies.
    pub fn allocation_size(log_size: u32) -> u64 {
        (1u64 << log_size) * BUCKET_BYTES as u64 + std::mem::size_of::<Table>() as u64
    }

    #[inline]
    pub fn log_size(&self) -> u32 {
        self.log_size
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn memory_usage(&self) -> u64 {
        Self::allocation_size(self.log_size)
    }

    /// The bucket a hash maps to in this table.
    #[inline]
    pub fn primary(&self, hash: u32) -> &Bucket {
        &self.buckets[(hash & self.mask) as usize]
    }

    /// Bucket by index, for ordered or randomized sweeps.
    #[inline]
    pub fn bucket(&self, index: usize) -> &Bucket {
        &self.buckets[index]
    }

    #[inline]
    pub fn slot_filled(&self) {
        self.slots_used.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn slot_emptied(&self) {
        self.slots_used.fetch_sub(1, Ordering::Relaxed);
    }

    /// Fraction of slots occupied.
    pub fn fullness(&self) -> f64 {
        let used = self.slots_used.load(Ordering::Relaxed) as f64;
        used / (self.buckets.len() * SLOTS_PER_BUCKET) as f64
    }

    /// The log size this table would prefer, given its current fill.
    ///
    /// Growth triggers immediately above [`GROW_FILL_RATIO`]; shrinking
    /// requires two consecutive observations below [`SHRINK_FILL_RATIO`].
    pub fn ideal_log_size(&self) -> u32 {
        let fullness = self.fullness();
        if fullness > GROW_FILL_RATIO {
            self.low_fill_checks.store(0, Ordering::Relaxed);
            (self.log_size + 1).min(MAX_LOG_SIZE)
        } else if fullness < SHRINK_FILL_RATIO {
            let checks = self.low_fill_checks.fetch_add(1, Ordering::Relaxed) + 1;
            if checks >= 2 && self.log_size > MIN_LOG_SIZE {
                self.log_size - 1
            } else {
                self.log_size
            }
        } else {
            self.low_fill_checks.store(0, Ordering::Relaxed);
            self.log_size
        }
    }

    /// Refuse new operations; used while this table is being drained.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn enable(&self) {
        self.disabled.store(false, Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Install the successor table that migrated buckets redirect to.
    pub fn set_successor(&self, table: Arc<Table>) {
        *self.successor.write() = Some(table);
    }

    pub fn successor(&self) -> Option<Arc<Table>> {
        self.successor.read().clone()
    }

    /// Return an emptied table to a reusable state. Requires sole
    /// ownership; any leftover records would indicate a drain bug.
    pub fn reset(&mut self) {
        for bucket in &mut self.buckets {
            bucket.state.store(0, Ordering::Relaxed);
            bucket.data.get_mut().reset();
        }
        self.enable();
        *self.successor.write() = None;
        self.slots_used.store(0, Ordering::Relaxed);
        self.low_fill_checks.store(0, Ordering::Relaxed);
    }
}
