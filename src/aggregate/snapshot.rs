use std::collections::BTreeMap;
use std::sync::Arc;

use super::stats::MetricStats;
use crate::source::filter::EventFilter;

/// Name of the catch-all metric used once a window hits its cardinality ceiling.
pub const OVERFLOW_NAME: &str = "__overflow__";
/// Category of the catch-all metric.
pub const OVERFLOW_CATEGORY: &str = "overflow";

/// Identity of a metric within a window. Ordered by name, then category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: Arc<str>,
    pub category: Arc<str>,
}

impl MetricKey {
    pub fn new(name: impl Into<Arc<str>>, category: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    /// The catch-all key.
    pub fn overflow() -> Self {
        Self::new(OVERFLOW_NAME, OVERFLOW_CATEGORY)
    }

    pub fn is_overflow(&self) -> bool {
        &*self.name == OVERFLOW_NAME && &*self.category == OVERFLOW_CATEGORY
    }
}

impl std::fmt::Display for MetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}

/// Immutable statistics for one sealed window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSnapshot {
    pub window_start_ns: u64,
    pub window_duration_ns: u64,
    pub metrics: BTreeMap<MetricKey, MetricStats>,
}

impl WindowSnapshot {
    pub fn new(window_start_ns: u64, window_duration_ns: u64) -> Self {
        Self {
            window_start_ns,
            window_duration_ns,
            metrics: BTreeMap::new(),
        }
    }

    pub fn window_end_ns(&self) -> u64 {
        self.window_start_ns.saturating_add(self.window_duration_ns)
    }

    pub fn get(&self, name: &str, category: &str) -> Option<&MetricStats> {
        self.metrics.get(&MetricKey::new(name, category))
    }

    pub fn overflow(&self) -> Option<&MetricStats> {
        self.metrics
            .iter()
            .find(|(k, _)| k.is_overflow())
            .map(|(_, v)| v)
    }

    /// Sum of event counts across all metrics, overflow included.
    pub fn total_count(&self) -> u64 {
        self.metrics.values().map(|m| m.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// A copy holding only the metrics accepted by `filter`, or `None` when
    /// nothing matches.
    pub fn filtered(&self, filter: &EventFilter) -> Option<WindowSnapshot> {
        let metrics: BTreeMap<MetricKey, MetricStats> = self
            .metrics
            .iter()
            .filter(|(k, _)| filter.matches_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if metrics.is_empty() {
            return None;
        }

        Some(WindowSnapshot {
            window_start_ns: self.window_start_ns,
            window_duration_ns: self.window_duration_ns,
            metrics,
        })
    }
}
