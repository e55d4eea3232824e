use std::collections::HashMap;
use std::sync::Arc;

use super::snapshot::{MetricKey, WindowSnapshot};
use super::stats::MetricStats;

/// Mutable statistics for one open window.
///
/// Owned by the aggregator task, so plain maps are enough.
#[derive(Clone)]
pub struct WindowAccumulator {
    start_ns: u64,
    metrics: HashMap<MetricKey, MetricStats>,
    named: usize,
    max_metrics: usize,
}

/// Where a recorded sample ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Named,
    Overflow,
}

impl WindowAccumulator {
    pub fn new(start_ns: u64, max_metrics: usize) -> Self {
        Self {
            start_ns,
            metrics: HashMap::with_capacity(max_metrics.min(256)),
            named: 0,
            max_metrics,
        }
    }

    pub fn start_ns(&self) -> u64 {
        self.start_ns
    }

    /// Distinct keys tracked, not counting the overflow metric.
    pub fn named_metrics(&self) -> usize {
        self.named
    }

    /// Adds one sample. Keys beyond the ceiling fold into `overflow_key`.
    pub fn record(
        &mut self,
        name: &Arc<str>,
        category: &Arc<str>,
        value: f64,
        overflow_key: &MetricKey,
    ) -> Recorded {
        let key = MetricKey {
            name: Arc::clone(name),
            category: Arc::clone(category),
        };

        if let Some(stats) = self.metrics.get_mut(&key) {
            stats.record(value);
            return if key == *overflow_key {
                Recorded::Overflow
            } else {
                Recorded::Named
            };
        }

        if self.named < self.max_metrics && key != *overflow_key {
            self.metrics.insert(key, MetricStats::from_sample(value));
            self.named += 1;
            return Recorded::Named;
        }

        match self.metrics.get_mut(overflow_key) {
            Some(stats) => stats.record(value),
            None => {
                self.metrics
                    .insert(overflow_key.clone(), MetricStats::from_sample(value));
            }
        }
        Recorded::Overflow
    }

    /// Freezes the window into an ordered snapshot.
    pub fn seal(self, window_duration_ns: u64) -> WindowSnapshot {
        WindowSnapshot {
            window_start_ns: self.start_ns,
            window_duration_ns,
            metrics: self.metrics.into_iter().collect(),
        }
    }
}
