use super::histogram::QuantileSketch;

/// Running statistics for one metric key within one window.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub sketch: QuantileSketch,
}

impl MetricStats {
    /// Stats holding a single sample.
    pub fn from_sample(value: f64) -> Self {
        let mut sketch = QuantileSketch::new();
        sketch.record(value);
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
            sketch,
        }
    }

    /// Rebuilds stats from decoded fields.
    pub fn from_parts(count: u64, sum: f64, min: f64, max: f64, sketch: QuantileSketch) -> Self {
        Self {
            count,
            sum,
            min,
            max,
            sketch,
        }
    }

    pub fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.sketch.record(value);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Estimated value at quantile `p`, clamped to the observed `[min, max]`.
    pub fn percentile(&self, p: f64) -> f64 {
        match self.sketch.quantile(p) {
            Some(v) => v.clamp(self.min, self.max),
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_tracks_min_max_sum() {
        let mut stats = MetricStats::from_sample(5.0);
        stats.record(2.0);
        stats.record(9.0);

        assert_eq!(stats.count, 3);
        assert_eq!(stats.sum, 16.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
        assert!((stats.mean() - 16.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_constant_samples_are_exact() {
        let mut stats = MetricStats::from_sample(16.6);
        for _ in 1..1_000 {
            stats.record(16.6);
        }
        assert_eq!(stats.count, 1_000);
        assert_eq!(stats.min, 16.6);
        assert_eq!(stats.max, 16.6);
        assert!((stats.mean() - 16.6).abs() < 1e-9);
        assert_eq!(stats.percentile(0.5), 16.6);
        assert_eq!(stats.percentile(0.99), 16.6);
    }

    #[test]
    fn test_negative_samples_clamp_percentile() {
        let mut stats = MetricStats::from_sample(-3.0);
        stats.record(-1.0);
        let p50 = stats.percentile(0.5);
        assert!((-3.0..=-1.0).contains(&p50));
    }

    #[test]
    fn test_sketch_total_matches_count() {
        let mut stats = MetricStats::from_sample(1.0);
        for i in 0..99 {
            stats.record(i as f64);
        }
        assert_eq!(stats.sketch.total(), stats.count);
    }
}
