//! Per-cache memory bookkeeping and lifecycle flags.
//!
//! `Metadata` is plain data guarded externally by the cache's
//! [`ReadWriteSpinLock`](crate::sync::ReadWriteSpinLock); the methods here
//! encode the accounting rules and the legal flag transitions.
//!
//! # Flag semantics
//!
//! - **MIGRATING**: a table swap is in flight. Set by the manager when it
//!   approves a migration, cleared by the migrate task on completion.
//! - **RESIZING**: the usage limit is being lowered. Set by the manager,
//!   cleared by the free-memory task once usage has drained below the new
//!   limit (or the shrink is abandoned).
//! - **SHUTDOWN**: terminal. No further admissions, no new tasks.
//!
//! MIGRATING and RESIZING may be set simultaneously. Reads and removals
//! stay serviceable in every state; insertions are refused under RESIZING
//! once usage has reached the lowered soft limit, and always under
//! SHUTDOWN.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CacheFlags: u32 {
        const MIGRATING = 0b001;
        const RESIZING  = 0b010;
        const SHUTDOWN  = 0b100;
    }
}

/// Invariants: `usage <= soft_usage_limit <= usage_limit <= max_size`
/// outside of a shrink, and `soft_usage_limit <= usage_limit` always.
pub(crate) struct Metadata {
    fixed_size: u64,
    table_size: u64,
    max_size: u64,
    usage: u64,
    soft_usage_limit: u64,
    usage_limit: u64,
    flags: CacheFlags,
}

impl Metadata {
    pub fn new(fixed_size: u64, table_size: u64, usage_limit: u64, max_size: u64) -> Self {
        debug_assert!(usage_limit <= max_size);
        Self {
            fixed_size,
            table_size,
            max_size,
            usage: 0,
            soft_usage_limit: usage_limit,
            usage_limit,
            flags: CacheFlags::empty(),
        }
    }

    #[inline]
    pub fn usage(&self) -> u64 {
        self.usage
    }

    #[inline]
    pub fn usage_limit(&self) -> u64 {
        self.usage_limit
    }

    #[inline]
    pub fn soft_usage_limit(&self) -> u64 {
        self.soft_usage_limit
    }

    #[inline]
    pub fn table_size(&self) -> u64 {
        self.table_size
    }

    #[inline]
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes this cache accounts for against the global budget: fixed
    /// overhead, the current table, and the reserved data budget.
    #[inline]
    pub fn allocated_size(&self) -> u64 {
        self.fixed_size + self.table_size + self.usage_limit
    }

    /// Apply a usage change if the limits allow it.
    ///
    /// Negative changes always succeed. Positive changes are admitted up
    /// to the soft limit, or up to the hard limit when no shrink is in
    /// progress.
    pub fn adjust_usage_if_allowed(&mut self, delta: i64) -> bool {
        if delta <= 0 {
            let decrease = delta.unsigned_abs();
            debug_assert!(self.usage >= decrease);
            self.usage = self.usage.saturating_sub(decrease);
            return true;
        }

        let new_usage = self.usage.saturating_add(delta as u64);
        if new_usage <= self.soft_usage_limit
            || (!self.flags.contains(CacheFlags::RESIZING) && new_usage <= self.usage_limit)
        {
            self.usage = new_usage;
            return true;
        }
        false
    }

    /// Raise the usage limit. The caller has already reserved the delta
    /// against the global budget.
    pub fn grow_limits(&mut self, new_limit: u64) {
        debug_assert!(new_limit >= self.usage_limit);
        debug_assert!(new_limit <= self.max_size);
        self.usage_limit = new_limit;
        self.soft_usage_limit = new_limit;
    }

    /// Start lowering the usage limit to `new_limit`.
    ///
    /// Returns false if the cache is shutting down, already shrinking, or
    /// `new_limit` is not actually lower.
    pub fn begin_resize_to(&mut self, new_limit: u64) -> bool {
        if self
            .flags
            .intersects(CacheFlags::SHUTDOWN | CacheFlags::RESIZING)
            || new_limit >= self.usage_limit
        {
            return false;
        }
        self.soft_usage_limit = new_limit;
        self.flags.insert(CacheFlags::RESIZING);
        true
    }

    /// Commit a finished shrink: the soft limit becomes the hard limit.
    /// Returns the number of reserved bytes released. The resizing flag
    /// stays set until [`Metadata::end_resizing`], so that a waiter
    /// observing the clear also observes settled global accounting.
    pub fn commit_resize(&mut self) -> u64 {
        debug_assert!(self.flags.contains(CacheFlags::RESIZING));
        debug_assert!(self.usage <= self.soft_usage_limit);
        let released = self.usage_limit - self.soft_usage_limit;
        self.usage_limit = self.soft_usage_limit;
        released
    }

    pub fn end_resizing(&mut self) {
        self.flags.remove(CacheFlags::RESIZING);
    }

    /// Abandon a shrink that could not make progress.
    pub fn abandon_resize(&mut self) {
        self.soft_usage_limit = self.usage_limit;
        self.flags.remove(CacheFlags::RESIZING);
    }

    pub fn begin_migrating(&mut self) -> bool {
        if self
            .flags
            .intersects(CacheFlags::SHUTDOWN | CacheFlags::MIGRATING)
        {
            return false;
        }
        self.flags.insert(CacheFlags::MIGRATING);
        true
    }

    pub fn end_migrating(&mut self) {
        self.flags.remove(CacheFlags::MIGRATING);
    }

    /// Record the swap to a table of `new_size` bytes. Returns the old
    /// table size for accounting.
    pub fn change_table(&mut self, new_size: u64) -> u64 {
        std::mem::replace(&mut self.table_size, new_size)
    }

    /// Enter the terminal state. Returns false if already shut down.
    pub fn begin_shutdown(&mut self) -> bool {
        if self.flags.contains(CacheFlags::SHUTDOWN) {
            return false;
        }
        self.flags.insert(CacheFlags::SHUTDOWN);
        true
    }

    #[inline]
    pub fn is_migrating(&self) -> bool {
        self.flags.contains(CacheFlags::MIGRATING)
    }

    #[inline]
    pub fn is_resizing(&self) -> bool {
        self.flags.contains(CacheFlags::RESIZING)
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.flags.contains(CacheFlags::SHUTDOWN)
    }

    #[inline]
    pub fn is_resizing_or_migrating(&self) -> bool {
        self.flags
            .intersects(CacheFlags::RESIZING | CacheFlags::MIGRATING)
    }
}
