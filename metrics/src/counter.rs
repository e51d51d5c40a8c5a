//! Sharded counter storage and the metriken-compatible counter handle.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Number of shards per group. Must be a power of two.
const SHARDS: usize = 64;

/// Number of counter slots per shard.
pub const SLOTS: usize = 16;

/// Monotonic source for thread shard assignment.
static NEXT_THREAD: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    /// Shard index for the current thread, assigned on first use.
    static THREAD_SHARD: usize = NEXT_THREAD.fetch_add(1, Ordering::Relaxed) & (SHARDS - 1);
}

/// One cache line of counter slots, padded to avoid false sharing with
/// neighboring shards.
#[repr(align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

impl Shard {
    const fn new() -> Self {
        Self {
            slots: [const { AtomicU64::new(0) }; SLOTS],
        }
    }
}

/// Sharded storage for up to [`SLOTS`] counters.
///
/// Each writing thread picks a shard by thread ID, so concurrent updates
/// to the same logical counter land on different cache lines. Reads sum
/// across all shards and are therefore slower; they are intended for
/// exposition and snapshots, not hot paths.
pub struct CounterGroup {
    shards: [Shard; SHARDS],
}

impl CounterGroup {
    /// Create a new group with all slots at zero. Usable in `static` context.
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            shards: [const { Shard::new() }; SHARDS],
        }
    }

    /// Add `value` to the counter in `slot`.
    ///
    /// # Panics
    /// Panics in debug builds if `slot >= SLOTS`.
    #[inline]
    pub fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS);
        THREAD_SHARD.with(|&shard| {
            self.shards[shard].slots[slot].fetch_add(value, Ordering::Relaxed);
        });
    }

    /// Increment the counter in `slot` by one.
    #[inline]
    pub fn increment(&self, slot: usize) {
        self.add(slot, 1);
    }

    /// Sum the counter in `slot` across all shards.
    pub fn load(&self, slot: usize) -> u64 {
        debug_assert!(slot < SLOTS);
        self.shards
            .iter()
            .map(|shard| shard.slots[slot].load(Ordering::Relaxed))
            .sum()
    }

    /// Reset the counter in `slot` to zero on all shards.
    ///
    /// Not atomic with respect to concurrent writers; intended for tests
    /// and windowed sampling where small races are acceptable.
    pub fn reset(&self, slot: usize) {
        debug_assert!(slot < SLOTS);
        for shard in &self.shards {
            shard.slots[slot].store(0, Ordering::Relaxed);
        }
    }
}

/// A named handle to one slot of a static [`CounterGroup`].
///
/// Implements [`metriken::Metric`] so it can be registered with the
/// `#[metric]` attribute and picked up by a metrics exposition endpoint.
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    /// Create a counter referencing `slot` of `group`.
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        assert!(slot < SLOTS);
        Self { group, slot }
    }

    /// Increment by one.
    #[inline]
    pub fn increment(&self) {
        self.group.increment(self.slot);
    }

    /// Add `value`.
    #[inline]
    pub fn add(&self, value: u64) {
        self.group.add(self.slot, value);
    }

    /// Current value, summed across shards.
    pub fn value(&self) -> u64 {
        self.group.load(self.slot)
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value> {
        Some(metriken::Value::Counter(Counter::value(self)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static GROUP: CounterGroup = CounterGroup::new();
    static FIRST: Counter = Counter::new(&GROUP, 0);

    #[test]
    fn test_add_and_load() {
        let group = CounterGroup::new();
        group.add(3, 5);
        group.increment(3);
        assert_eq!(group.load(3), 6);
        assert_eq!(group.load(4), 0);
    }

    #[test]
    fn test_reset() {
        let group = CounterGroup::new();
        group.add(1, 100);
        group.reset(1);
        assert_eq!(group.load(1), 0);
    }

    #[test]
    fn test_static_counter() {
        FIRST.increment();
        FIRST.add(9);
        assert_eq!(FIRST.value(), 10);
    }

    #[test]
    fn test_concurrent_adds() {
        let group = std::sync::Arc::new(CounterGroup::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let group = group.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        group.increment(7);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(group.load(7), 80_000);
    }
}
