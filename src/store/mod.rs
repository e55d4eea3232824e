pub mod budget;
pub mod spill;

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::aggregate::snapshot::WindowSnapshot;
use crate::source::filter::EventFilter;

/// Bounded in-memory history of sealed windows, ordered by window start.
///
/// One writer (the fan-out task) appends; any number of readers query.
/// Readers only ever see whole snapshots behind `Arc`s.
pub struct SnapshotStore {
    capacity: usize,
    windows: RwLock<VecDeque<Arc<WindowSnapshot>>>,
}

impl SnapshotStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            windows: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.windows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.read().is_empty()
    }

    /// Stores a sealed window, evicting the oldest when full.
    ///
    /// Returns the number of windows held afterwards.
    pub fn record(&self, snapshot: Arc<WindowSnapshot>) -> usize {
        let mut windows = self.windows.write();

        let in_order = windows
            .back()
            .map_or(true, |last| last.window_start_ns < snapshot.window_start_ns);

        if in_order {
            windows.push_back(snapshot);
        } else {
            let start = snapshot.window_start_ns;
            match windows.binary_search_by_key(&start, |w| w.window_start_ns) {
                Ok(pos) => windows[pos] = snapshot,
                Err(pos) => windows.insert(pos, snapshot),
            }
        }

        while windows.len() > self.capacity {
            windows.pop_front();
        }
        windows.len()
    }

    /// Most recently sealed window.
    pub fn latest(&self) -> Option<Arc<WindowSnapshot>> {
        self.windows.read().back().cloned()
    }

    /// Windows whose start falls in `range`, optionally narrowed by `filter`.
    ///
    /// The read lock is held only while the matching `Arc`s are collected;
    /// filtering happens lazily on iteration.
    pub fn query(&self, range: Range<u64>, filter: Option<EventFilter>) -> QueryResult {
        let windows = self.windows.read();
        let lo = windows.partition_point(|w| w.window_start_ns < range.start);
        let hi = windows.partition_point(|w| w.window_start_ns < range.end);
        let selected = if lo < hi {
            windows.range(lo..hi).cloned().collect()
        } else {
            Vec::new()
        };

        QueryResult {
            windows: selected,
            filter: filter.filter(|f| !f.is_accept_all()),
        }
    }
}

/// Outcome of a store query. Iterate it as many times as needed.
pub struct QueryResult {
    windows: Vec<Arc<WindowSnapshot>>,
    filter: Option<EventFilter>,
}

impl QueryResult {
    /// Matching windows in ascending start order.
    ///
    /// Unfiltered results share the stored snapshots; filtered ones are
    /// rebuilt per call and skip windows with no matching metric.
    pub fn iter(&self) -> impl Iterator<Item = Arc<WindowSnapshot>> + '_ {
        self.windows.iter().filter_map(move |w| match &self.filter {
            None => Some(Arc::clone(w)),
            Some(filter) => w.filtered(filter).map(Arc::new),
        })
    }

    /// Windows in range before filtering.
    pub fn candidates(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::snapshot::MetricKey;
    use crate::aggregate::stats::MetricStats;
    use crate::source::filter::NameFilter;

    fn window(start: u64, names: &[&str]) -> Arc<WindowSnapshot> {
        let mut snap = WindowSnapshot::new(start, 10);
        for name in names {
            snap.metrics
                .insert(MetricKey::new(*name, "render"), MetricStats::from_sample(1.0));
        }
        Arc::new(snap)
    }

    fn starts(result: &QueryResult) -> Vec<u64> {
        result.iter().map(|w| w.window_start_ns).collect()
    }

    #[test]
    fn test_record_and_latest() {
        let store = SnapshotStore::new(4);
        assert!(store.latest().is_none());
        store.record(window(0, &["a"]));
        store.record(window(10, &["a"]));
        assert_eq!(store.len(), 2);
        assert_eq!(store.latest().map(|w| w.window_start_ns), Some(10));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = SnapshotStore::new(3);
        for i in 0..5 {
            store.record(window(i * 10, &["a"]));
        }
        assert_eq!(store.len(), 3);
        assert_eq!(starts(&store.query(0..u64::MAX, None)), vec![20, 30, 40]);
    }

    #[test]
    fn test_out_of_order_insert() {
        let store = SnapshotStore::new(8);
        store.record(window(0, &["a"]));
        store.record(window(30, &["a"]));
        store.record(window(10, &["a"]));
        store.record(window(20, &["a"]));
        assert_eq!(starts(&store.query(0..u64::MAX, None)), vec![0, 10, 20, 30]);
        assert_eq!(store.latest().map(|w| w.window_start_ns), Some(30));
    }

    #[test]
    fn test_duplicate_start_replaces() {
        let store = SnapshotStore::new(8);
        store.record(window(0, &["a"]));
        store.record(window(10, &["a"]));
        store.record(window(0, &["b"]));
        let result = store.query(0..u64::MAX, None);
        let first = result.iter().next().expect("window");
        assert!(first.get("b", "render").is_some());
        assert_eq!(result.candidates(), 2);
    }

    #[test]
    fn test_query_range_is_half_open() {
        let store = SnapshotStore::new(8);
        for i in 0..5 {
            store.record(window(i * 10, &["a"]));
        }
        assert_eq!(starts(&store.query(10..30, None)), vec![10, 20]);
        assert!(store.query(30..10, None).iter().next().is_none());
        assert!(store.query(100..200, None).iter().next().is_none());
    }

    #[test]
    fn test_query_filter_skips_non_matching_windows() {
        let store = SnapshotStore::new(8);
        store.record(window(0, &["frame_time", "gc"]));
        store.record(window(10, &["gc"]));
        store.record(window(20, &["frame_time"]));

        let filter = EventFilter::new(NameFilter::Equal("frame_time".into()), None);
        let result = store.query(0..u64::MAX, Some(filter));
        assert_eq!(starts(&result), vec![0, 20]);
        assert!(result.iter().all(|w| w.metrics.len() == 1));
    }

    #[test]
    fn test_query_result_is_restartable_and_isolated() {
        let store = SnapshotStore::new(2);
        store.record(window(0, &["a"]));
        store.record(window(10, &["a"]));

        let result = store.query(0..u64::MAX, None);
        // Later writes never change an existing result.
        store.record(window(20, &["a"]));
        store.record(window(30, &["a"]));

        assert_eq!(starts(&result), vec![0, 10]);
        assert_eq!(starts(&result), vec![0, 10]);
    }

    #[test]
    fn test_concurrent_readers_see_whole_windows() {
        let store = Arc::new(SnapshotStore::new(16));
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..200 {
                    store.record(window(i * 10, &["a", "b", "c"]));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        for w in store.query(0..u64::MAX, None).iter() {
                            assert_eq!(w.metrics.len(), 3);
                        }
                    }
                })
            })
            .collect();

        writer.join().expect("writer");
        for r in readers {
            r.join().expect("reader");
        }
        assert_eq!(store.len(), 16);
    }
}
