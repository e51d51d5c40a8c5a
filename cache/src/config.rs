//! Manager configuration.

/// Configuration for a [`Manager`](crate::Manager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub(crate) global_limit: u64,
    pub(crate) enable_windowed_stats: bool,
    pub(crate) ideal_lower_ratio: f64,
    pub(crate) ideal_upper_ratio: f64,
}

impl ManagerConfig {
    /// Create a configuration with the given global memory limit in
    /// bytes and default tuning.
    ///
    /// Defaults: windowed stats enabled, per-cache low-water at 4% of the
    /// global limit, high-water at 25%.
    pub fn new(global_limit: u64) -> Self {
        Self {
            global_limit,
            enable_windowed_stats: true,
            ideal_lower_ratio: 0.04,
            ideal_upper_ratio: 0.25,
        }
    }

    /// Enable or disable windowed hit-rate statistics on new caches.
    pub fn with_windowed_stats(mut self, enabled: bool) -> Self {
        self.enable_windowed_stats = enabled;
        self
    }

    /// Set the per-cache low- and high-water ratios used during
    /// rebalancing. Both must lie in `(0, 1]` and `lower <= upper`.
    pub fn with_ideal_ratios(mut self, lower: f64, upper: f64) -> Self {
        assert!(lower > 0.0 && upper <= 1.0 && lower <= upper);
        self.ideal_lower_ratio = lower;
        self.ideal_upper_ratio = upper;
        self
    }

    /// The configured global memory limit in bytes.
    pub fn global_limit(&self) -> u64 {
        self.global_limit
    }

    /// Per-cache low-water mark in bytes.
    pub(crate) fn low_water(&self) -> u64 {
        (self.ideal_lower_ratio * self.global_limit as f64) as u64
    }

    /// Per-cache high-water mark in bytes.
    pub(crate) fn high_water(&self) -> u64 {
        (self.ideal_upper_ratio * self.global_limit as f64) as u64
    }
}
