/// Number of sketch buckets.
pub const NUM_BUCKETS: usize = 128;

/// Smallest value tracked with relative precision. Bucket 0 holds everything at or below it.
pub const MIN_TRACKED: f64 = 1e-4;

/// Ratio between consecutive bucket bounds.
pub const GAMMA: f64 = 1.25;

/// Worst-case relative error of a percentile estimate inside the tracked range.
pub const RELATIVE_ERROR: f64 = (GAMMA - 1.0) / (GAMMA + 1.0);

/// Fixed-size log-bucketed histogram for percentile estimation.
///
/// Bucket 0 holds values `<= MIN_TRACKED`; bucket `i >= 1` holds
/// `(MIN_TRACKED * GAMMA^(i-1), MIN_TRACKED * GAMMA^i]`. The top bucket also
/// absorbs everything above its upper bound (about 1.6e8). Reporting
/// `2 * upper / (GAMMA + 1)` for a bucket keeps the relative error within
/// `RELATIVE_ERROR` (about 11%).
///
/// Buckets are `u32`, 512 bytes per sketch. A bucket saturates at
/// `u32::MAX` samples while the metric's own `count` is `u64`, so past about
/// 4.29 billion samples in one bucket of one window the percentiles drift
/// toward the other buckets and `total()` falls short of `count`.
#[derive(Clone, PartialEq, Eq)]
pub struct QuantileSketch {
    buckets: [u32; NUM_BUCKETS],
}

impl QuantileSketch {
    pub fn new() -> Self {
        Self {
            buckets: [0; NUM_BUCKETS],
        }
    }

    /// Rebuilds a sketch from raw bucket counts.
    pub fn from_buckets(buckets: [u32; NUM_BUCKETS]) -> Self {
        Self { buckets }
    }

    pub fn record(&mut self, value: f64) {
        let idx = bucket_index(value);
        if let Some(bucket) = self.buckets.get_mut(idx) {
            *bucket = bucket.saturating_add(1);
        }
    }

    pub fn buckets(&self) -> &[u32; NUM_BUCKETS] {
        &self.buckets
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|&b| u64::from(b)).sum()
    }

    /// Estimated value at quantile `p` in `[0, 1]`, or `None` when empty.
    pub fn quantile(&self, p: f64) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            return None;
        }

        let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
        let rank = ((p * total as f64).ceil() as u64).clamp(1, total);

        let mut seen = 0u64;
        for (i, &count) in self.buckets.iter().enumerate() {
            seen += u64::from(count);
            if seen >= rank {
                return Some(bucket_value(i));
            }
        }
        Some(bucket_value(NUM_BUCKETS - 1))
    }
}

impl Default for QuantileSketch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QuantileSketch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let non_empty: Vec<(usize, u32)> = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > 0)
            .map(|(i, c)| (i, *c))
            .collect();
        f.debug_struct("QuantileSketch")
            .field("buckets", &non_empty)
            .finish()
    }
}

/// Returns the bucket index for a sample.
pub fn bucket_index(value: f64) -> usize {
    // Also catches NaN.
    if !(value > MIN_TRACKED) {
        return 0;
    }
    let idx = ((value / MIN_TRACKED).ln() / GAMMA.ln()).ceil();
    if idx >= (NUM_BUCKETS - 1) as f64 {
        NUM_BUCKETS - 1
    } else {
        (idx as usize).max(1)
    }
}

/// Representative value reported for a bucket.
pub fn bucket_value(idx: usize) -> f64 {
    if idx == 0 {
        return 0.0;
    }
    2.0 * MIN_TRACKED * GAMMA.powi(idx as i32) / (GAMMA + 1.0)
}
