//! High-performance sharded metrics with metriken integration.
//!
//! This crate provides [`Counter`] and [`CounterGroup`] for high-throughput
//! metrics that avoid cache-line contention by using per-thread shards.
//!
//! # Overview
//!
//! A [`CounterGroup`] provides sharded storage for up to 16 counters.
//! Each thread writes to its own shard (selected by thread ID), so
//! counters in the same group don't cause false sharing.
//!
//! A [`Counter`] references a slot in a group and implements [`metriken::Metric`],
//! allowing it to be registered with the `#[metric]` attribute for Prometheus
//! exposition.
//!
//! # Example
//!
//! ```
//! use hoard_metrics::{Counter, CounterGroup};
//!
//! // Define named slot constants for clarity
//! mod slots {
//!     pub const HITS: usize = 0;
//!     pub const MISSES: usize = 1;
//! }
//!
//! // Create counter groups (just storage)
//! static LOOKUP: CounterGroup = CounterGroup::new();
//!
//! // Create counters referencing group slots
//! static LOOKUP_HITS: Counter = Counter::new(&LOOKUP, slots::HITS);
//! static LOOKUP_MISSES: Counter = Counter::new(&LOOKUP, slots::MISSES);
//!
//! // Use in hot path
//! LOOKUP_HITS.increment();
//! LOOKUP_MISSES.add(1);
//! ```
//!
//! Groups can also be allocated per-object rather than as statics when a
//! component needs its own statistics (for example, one group per cache
//! instance), using the slot-addressed [`CounterGroup::add`] and
//! [`CounterGroup::load`] methods directly.
//!
//! # Memory Layout
//!
//! Each `CounterGroup` uses 8KB (64 shards × 128 bytes per shard). Each shard
//! holds 16 counter slots. This means:
//!
//! - One counter effectively uses ~512 bytes (8KB / 16)
//! - 5 groups with 16 counters each = 40KB total
//!
//! Compare to a naive sharded counter that uses 8KB per counter.

mod counter;

pub use counter::{Counter, CounterGroup};

// Re-export metriken for convenience
pub use metriken;
