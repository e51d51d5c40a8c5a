//! Bounded approximate frequency estimation.
//!
//! [`FrequencyBuffer`] is a fixed-size ring of recent events. Writers
//! overwrite a slot chosen at random from the shared PRNG, so an insert
//! is a single relaxed atomic store and older events decay as they are
//! overwritten. Readers tally the surviving entries to get approximate
//! frequencies of recent events.
//!
//! Two event types use this: per-cache find outcomes (for the windowed
//! hit rate) and manager-level cache accesses (for ranking reclamation
//! victims).

use crate::prng::SharedPrng;
use crate::sync::{AtomicU8, AtomicU64, Ordering};

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// An event that can live in a [`FrequencyBuffer`] slot.
///
/// Implementors pick their own atomic slot representation; a zeroed slot
/// means "empty".
pub(crate) trait FrequencyRecord: Copy + Eq + std::hash::Hash {
    /// Atomic slot storage for this event type.
    type Slot: Default + Send + Sync;

    fn store(slot: &Self::Slot, value: Self);
    fn load(slot: &Self::Slot) -> Option<Self>;
    fn clear(slot: &Self::Slot);
}

/// Outcome of one find operation, recorded for windowed statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum StatEvent {
    FindHit,
    FindMiss,
}

impl FrequencyRecord for StatEvent {
    type Slot = AtomicU8;

    #[inline]
    fn store(slot: &Self::Slot, value: Self) {
        let raw = match value {
            StatEvent::FindHit => 1,
            StatEvent::FindMiss => 2,
        };
        slot.store(raw, Ordering::Relaxed);
    }

    #[inline]
    fn load(slot: &Self::Slot) -> Option<Self> {
        match slot.load(Ordering::Relaxed) {
            1 => Some(StatEvent::FindHit),
            2 => Some(StatEvent::FindMiss),
            _ => None,
        }
    }

    fn clear(slot: &Self::Slot) {
        slot.store(0, Ordering::Relaxed);
    }
}

/// An access to a cache, identified by cache id, recorded for the
/// manager's reclamation ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CacheAccess(pub u64);

impl FrequencyRecord for CacheAccess {
    type Slot = AtomicU64;

    #[inline]
    fn store(slot: &Self::Slot, value: Self) {
        // shift by one so a zeroed slot stays distinguishable
        slot.store(value.0 + 1, Ordering::Relaxed);
    }

    #[inline]
    fn load(slot: &Self::Slot) -> Option<Self> {
        match slot.load(Ordering::Relaxed) {
            0 => None,
            raw => Some(CacheAccess(raw - 1)),
        }
    }

    fn clear(slot: &Self::Slot) {
        slot.store(0, Ordering::Relaxed);
    }
}

/// Fixed-capacity lossy ring of recent events.
pub(crate) struct FrequencyBuffer<T: FrequencyRecord> {
    slots: Box<[T::Slot]>,
    mask: u64,
    prng: Arc<dyn SharedPrng>,
    _marker: PhantomData<T>,
}

impl<T: FrequencyRecord> FrequencyBuffer<T> {
    /// Create a buffer with at least `capacity` slots (rounded up to a
    /// power of two, floored at 8).
    pub fn new(prng: Arc<dyn SharedPrng>, capacity: usize) -> Self {
        let size = capacity.next_power_of_two().max(8);
        let slots = (0..size).map(|_| T::Slot::default()).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            mask: (size - 1) as u64,
            prng,
            _marker: PhantomData,
        }
    }

    /// Record an event, overwriting a randomly chosen slot.
    #[inline]
    pub fn insert(&self, event: T) {
        let index = (self.prng.uniform64() & self.mask) as usize;
        T::store(&self.slots[index], event);
    }

    /// Tally surviving events, least frequent first.
    pub fn frequencies(&self) -> Vec<(T, u64)> {
        let mut counts: HashMap<T, u64, ahash::RandomState> =
            HashMap::with_hasher(ahash::RandomState::new());
        for slot in &self.slots {
            if let Some(event) = T::load(slot) {
                *counts.entry(event).or_insert(0) += 1;
            }
        }
        let mut tallies: Vec<(T, u64)> = counts.into_iter().collect();
        tallies.sort_by_key(|&(_, count)| count);
        tallies
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        for slot in &self.slots {
            T::clear(slot);
        }
    }

    /// Bytes held by this buffer, for accounting.
    pub fn memory_usage(&self) -> u64 {
        (self.slots.len() * std::mem::size_of::<T::Slot>() + std::mem::size_of::<Self>()) as u64
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::prng::WeylPrng;

    fn prng() -> Arc<dyn SharedPrng> {
        Arc::new(WeylPrng::new(0x5EED))
    }

    #[test]
    fn test_rounds_capacity_up() {
        let buffer: FrequencyBuffer<StatEvent> = FrequencyBuffer::new(prng(), 1000);
        assert_eq!(buffer.slots.len(), 1024);
        let buffer: FrequencyBuffer<StatEvent> = FrequencyBuffer::new(prng(), 1);
        assert_eq!(buffer.slots.len(), 8);
    }

    #[test]
    fn test_dominant_event_dominates_tally() {
        let buffer: FrequencyBuffer<StatEvent> = FrequencyBuffer::new(prng(), 1024);
        for _ in 0..4096 {
            buffer.insert(StatEvent::FindHit);
        }
        for _ in 0..64 {
            buffer.insert(StatEvent::FindMiss);
        }
        let tallies = buffer.frequencies();
        let hits = tallies
            .iter()
            .find(|(event, _)| *event == StatEvent::FindHit)
            .map(|&(_, count)| count)
            .unwrap_or(0);
        let misses = tallies
            .iter()
            .find(|(event, _)| *event == StatEvent::FindMiss)
            .map(|&(_, count)| count)
            .unwrap_or(0);
        assert!(hits > misses);
    }

    #[test]
    fn test_ranking_is_ascending() {
        let buffer: FrequencyBuffer<CacheAccess> = FrequencyBuffer::new(prng(), 4096);
        for _ in 0..2048 {
            buffer.insert(CacheAccess(1));
        }
        for _ in 0..32 {
            buffer.insert(CacheAccess(2));
        }
        let tallies = buffer.frequencies();
        assert!(tallies.windows(2).all(|pair| pair[0].1 <= pair[1].1));
        // the heavy cache must rank last (most frequent)
        assert_eq!(tallies.last().unwrap().0, CacheAccess(1));
    }

    #[test]
    fn test_clear() {
        let buffer: FrequencyBuffer<CacheAccess> = FrequencyBuffer::new(prng(), 64);
        for id in 0..64 {
            buffer.insert(CacheAccess(id));
        }
        buffer.clear();
        assert!(buffer.frequencies().is_empty());
    }
}
