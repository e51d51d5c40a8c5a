//! Memory statistics snapshots and process-wide metric exposition.

use metriken::{Gauge, LazyGauge, metric};

/// Per-cache row in a [`MemoryStats`] snapshot.
#[derive(Debug, Clone)]
pub struct CacheMemoryRow {
    /// Manager-assigned cache id.
    pub id: u64,
    /// Total allocated bytes for this cache.
    pub size: u64,
    /// Current data usage in bytes.
    pub usage: u64,
}

/// A consistent snapshot of the manager's memory accounting.
#[derive(Debug, Clone)]
pub struct MemoryStats {
    /// Configured global memory limit.
    pub global_limit: u64,
    /// Bytes currently accounted against the limit.
    pub global_allocation: u64,
    /// Bytes held by spare tables.
    pub spare_allocation: u64,
    /// Number of tables attached to live caches (including migration
    /// targets in flight).
    pub active_tables: u64,
    /// Number of detached tables retained for reuse.
    pub spare_tables: u64,
    /// One row per registered cache.
    pub caches: Vec<CacheMemoryRow>,
}

#[metric(
    name = "cache_global_limit",
    description = "configured global memory limit in bytes"
)]
pub static GLOBAL_LIMIT: LazyGauge = LazyGauge::new(Gauge::default);

#[metric(
    name = "cache_global_allocation",
    description = "bytes currently accounted against the global limit"
)]
pub static GLOBAL_ALLOCATION: LazyGauge = LazyGauge::new(Gauge::default);

#[metric(
    name = "cache_active_tables",
    description = "tables attached to live caches"
)]
pub static ACTIVE_TABLES: LazyGauge = LazyGauge::new(Gauge::default);

#[metric(
    name = "cache_spare_tables",
    description = "detached tables retained for reuse"
)]
pub static SPARE_TABLES: LazyGauge = LazyGauge::new(Gauge::default);

#[metric(
    name = "cache_spare_allocation",
    description = "bytes held by spare tables"
)]
pub static SPARE_ALLOCATION: LazyGauge = LazyGauge::new(Gauge::default);

/// Publish manager-level gauges from current accounting values.
pub(crate) fn publish(
    global_limit: u64,
    global_allocation: u64,
    spare_allocation: u64,
    active_tables: u64,
    spare_tables: u64,
) {
    GLOBAL_LIMIT.set(global_limit as i64);
    GLOBAL_ALLOCATION.set(global_allocation as i64);
    SPARE_ALLOCATION.set(spare_allocation as i64);
    ACTIVE_TABLES.set(active_tables as i64);
    SPARE_TABLES.set(spare_tables as i64);
}
