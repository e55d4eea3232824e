pub mod histogram;
pub mod snapshot;
pub mod stats;
pub mod synthetic;
pub mod window;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::WindowConfig;
use crate::export::health::PipelineMetrics;
use crate::source::event::RawEvent;

use self::snapshot::{MetricKey, WindowSnapshot};
use self::synthetic::SyntheticSet;
use self::window::{Recorded, WindowAccumulator};

/// Open windows kept before the oldest is sealed regardless of event time.
const MAX_OPEN_WINDOWS: usize = 64;

/// Groups events into fixed windows aligned to multiples of the window length.
///
/// Windows are `[floor(t / W) * W, +W)`. Several may be open at once while
/// late events trickle in. Sealing follows event time: the largest timestamp
/// fed so far is the watermark, and a window is due once its end plus the
/// allowed lateness is at or before it. Sealing is monotonic, so once a
/// window is sealed any event for it or an earlier window is counted as late
/// and dropped.
pub struct Aggregator {
    window_ns: u64,
    allowed_lateness_ns: u64,
    max_metrics: usize,
    open: BTreeMap<u64, WindowAccumulator>,
    /// Largest timestamp accepted so far.
    watermark_ns: Option<u64>,
    /// End of the newest sealed window.
    sealed_until: Option<u64>,
    /// Windows force-sealed by `feed` and not yet collected.
    ready: Vec<WindowSnapshot>,
    overflow_key: MetricKey,
    synthetic: SyntheticSet,
    metrics: Arc<PipelineMetrics>,
}

impl Aggregator {
    pub fn new(
        window_ns: u64,
        allowed_lateness_ns: u64,
        max_metrics: usize,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            window_ns: window_ns.max(1),
            allowed_lateness_ns,
            max_metrics: max_metrics.max(1),
            open: BTreeMap::new(),
            watermark_ns: None,
            sealed_until: None,
            ready: Vec::new(),
            overflow_key: MetricKey::overflow(),
            synthetic: SyntheticSet::default(),
            metrics,
        }
    }

    pub fn from_config(cfg: &WindowConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self::new(
            u64::try_from(cfg.duration.as_nanos()).unwrap_or(u64::MAX),
            u64::try_from(cfg.allowed_lateness.as_nanos()).unwrap_or(u64::MAX),
            cfg.max_metrics,
            metrics,
        )
    }

    /// Adds derived metrics computed for every sealed window.
    pub fn with_synthetic(mut self, synthetic: SyntheticSet) -> Self {
        self.synthetic = synthetic;
        self
    }

    pub fn window_ns(&self) -> u64 {
        self.window_ns
    }

    /// Start of the window containing `timestamp_ns`.
    pub fn window_start(&self, timestamp_ns: u64) -> u64 {
        timestamp_ns - timestamp_ns % self.window_ns
    }

    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    /// Largest event timestamp accepted so far.
    pub fn watermark_ns(&self) -> Option<u64> {
        self.watermark_ns
    }

    /// Folds one event into its window.
    pub fn feed(&mut self, event: &RawEvent) {
        let start = self.window_start(event.timestamp_ns);

        if self.sealed_until.is_some_and(|until| start < until) {
            self.metrics.late_drops.inc();
            return;
        }

        self.watermark_ns = Some(
            self.watermark_ns
                .map_or(event.timestamp_ns, |w| w.max(event.timestamp_ns)),
        );

        let max_metrics = self.max_metrics;
        let acc = self
            .open
            .entry(start)
            .or_insert_with(|| WindowAccumulator::new(start, max_metrics));

        let recorded = acc.record(
            &event.name,
            &event.category,
            event.sample_value(),
            &self.overflow_key,
        );
        if recorded == Recorded::Overflow {
            self.metrics.overflow_count.inc();
        }
        self.synthetic.observe(start, event);

        if self.open.len() > MAX_OPEN_WINDOWS {
            if let Some(snapshot) = self.seal_oldest() {
                self.ready.push(snapshot);
            }
        }
    }

    /// Seals the oldest open window, which is the current one when only one is open.
    pub fn seal_current_window(&mut self) -> Option<WindowSnapshot> {
        if !self.ready.is_empty() {
            return Some(self.ready.remove(0));
        }
        self.seal_oldest()
    }

    /// Seals every window whose end plus allowed lateness is at or before
    /// `event_time_ns`.
    pub fn seal_due(&mut self, event_time_ns: u64) -> Vec<WindowSnapshot> {
        let mut sealed = std::mem::take(&mut self.ready);
        while let Some(&start) = self.open.keys().next() {
            let due = start
                .saturating_add(self.window_ns)
                .saturating_add(self.allowed_lateness_ns);
            if due > event_time_ns {
                break;
            }
            if let Some(snapshot) = self.seal_oldest() {
                sealed.push(snapshot);
            }
        }
        sealed
    }

    /// Seals every window that is due at the current watermark.
    pub fn seal_ready(&mut self) -> Vec<WindowSnapshot> {
        match self.watermark_ns {
            Some(watermark) => self.seal_due(watermark),
            None => std::mem::take(&mut self.ready),
        }
    }

    /// Like `seal_ready`, for a source that has sent nothing for `idle_ns` of
    /// wall time. Once that silence reaches a full window plus the allowed
    /// lateness, event time is taken to have advanced by `idle_ns` past the
    /// watermark, so a quiet source still gets its last windows sealed.
    pub fn seal_idle(&mut self, idle_ns: u64) -> Vec<WindowSnapshot> {
        let Some(watermark) = self.watermark_ns else {
            return std::mem::take(&mut self.ready);
        };
        let quiet_after = self.window_ns.saturating_add(self.allowed_lateness_ns);
        let horizon = if idle_ns >= quiet_after {
            watermark.saturating_add(idle_ns)
        } else {
            watermark
        };
        self.seal_due(horizon)
    }

    /// Seals everything that is open, oldest first.
    pub fn seal_all(&mut self) -> Vec<WindowSnapshot> {
        let mut sealed = std::mem::take(&mut self.ready);
        while let Some(snapshot) = self.seal_oldest() {
            sealed.push(snapshot);
        }
        sealed
    }

    /// Copies of the open windows as they stand, oldest first. Nothing is
    /// sealed and later events still land in these windows.
    pub fn open_snapshots(&self) -> Vec<WindowSnapshot> {
        self.open
            .iter()
            .map(|(&start, acc)| {
                let mut acc = acc.clone();
                for (key, value) in self.synthetic.preview(start) {
                    acc.record(&key.name, &key.category, value, &self.overflow_key);
                }
                acc.seal(self.window_ns)
            })
            .collect()
    }

    fn seal_oldest(&mut self) -> Option<WindowSnapshot> {
        let (start, mut acc) = self.open.pop_first()?;
        let end = start.saturating_add(self.window_ns);
        self.sealed_until = Some(self.sealed_until.map_or(end, |until| until.max(end)));

        for (key, value) in self.synthetic.finish(start) {
            if acc.record(&key.name, &key.category, value, &self.overflow_key)
                == Recorded::Overflow
            {
                self.metrics.overflow_count.inc();
            }
        }

        let snapshot = acc.seal(self.window_ns);
        self.metrics.windows_sealed.inc();
        debug!(
            window_start_ns = start,
            metrics = snapshot.metrics.len(),
            events = snapshot.total_count(),
            "window sealed"
        );
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u64 = 1_000_000_000;

    fn aggregator(max_metrics: usize, lateness: u64) -> (Aggregator, Arc<PipelineMetrics>) {
        let metrics = Arc::new(PipelineMetrics::new().expect("metrics"));
        (
            Aggregator::new(W, lateness, max_metrics, Arc::clone(&metrics)),
            metrics,
        )
    }

    #[test]
    fn test_window_start_alignment() {
        let (agg, _) = aggregator(8, 0);
        assert_eq!(agg.window_start(0), 0);
        assert_eq!(agg.window_start(W - 1), 0);
        assert_eq!(agg.window_start(W), W);
        assert_eq!(agg.window_start(5 * W + 123), 5 * W);
    }

    #[test]
    fn test_feed_and_seal_current_window() {
        let (mut agg, _) = aggregator(8, 0);
        for _ in 0..1_000 {
            agg.feed(&RawEvent::numeric("frame_time", "render", 3 * W + 10, 16.6));
        }

        let snap = agg.seal_current_window().expect("window sealed");
        assert_eq!(snap.window_start_ns, 3 * W);
        let stats = snap.get("frame_time", "render").expect("metric");
        assert_eq!(stats.count, 1_000);
        assert_eq!(stats.min, 16.6);
        assert_eq!(stats.max, 16.6);
        assert!((stats.mean() - 16.6).abs() < 1e-9);

        assert!(agg.seal_current_window().is_none());
    }

    #[test]
    fn test_events_split_across_windows() {
        let (mut agg, _) = aggregator(8, 0);
        agg.feed(&RawEvent::numeric("x", "c", W - 1, 1.0));
        agg.feed(&RawEvent::numeric("x", "c", W, 2.0));
        agg.feed(&RawEvent::numeric("x", "c", 2 * W - 1, 3.0));

        let sealed = agg.seal_all();
        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[0].window_start_ns, 0);
        assert_eq!(sealed[0].total_count(), 1);
        assert_eq!(sealed[1].window_start_ns, W);
        assert_eq!(sealed[1].total_count(), 2);
    }

    #[test]
    fn test_seal_due_respects_lateness() {
        let lateness = W / 4;
        let (mut agg, _) = aggregator(8, lateness);
        agg.feed(&RawEvent::numeric("x", "c", 10, 1.0));
        agg.feed(&RawEvent::numeric("x", "c", W + 10, 1.0));

        assert!(agg.seal_due(W).is_empty());
        assert!(agg.seal_due(W + lateness - 1).is_empty());

        let sealed = agg.seal_due(W + lateness);
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].window_start_ns, 0);
        assert_eq!(agg.open_windows(), 1);
    }

    #[test]
    fn test_host_relative_timestamps_seal_by_event_time() {
        // Timestamps far behind the wall clock, arriving slower than they advance.
        let (mut agg, metrics) = aggregator(8, W / 4);
        let step = W / 20;
        for i in 0..10 {
            agg.feed(&RawEvent::numeric("x", "c", 5 * W + i * step, 1.0));
            assert!(agg.seal_ready().is_empty());
        }
        assert_eq!(agg.watermark_ns(), Some(5 * W + 9 * step));
        assert_eq!(metrics.late_drops.get(), 0);

        agg.feed(&RawEvent::numeric("x", "c", 6 * W + W / 4, 1.0));
        let sealed = agg.seal_ready();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].window_start_ns, 5 * W);
        assert_eq!(sealed[0].total_count(), 10);
    }

    #[test]
    fn test_seal_idle_waits_for_a_quiet_window() {
        let lateness = W / 4;
        let (mut agg, _) = aggregator(8, lateness);
        assert!(agg.seal_idle(10 * W).is_empty());

        agg.feed(&RawEvent::numeric("x", "c", 7 * W + 10, 1.0));
        assert!(agg.seal_idle(W).is_empty());

        let sealed = agg.seal_idle(W + lateness);
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].window_start_ns, 7 * W);
    }

    #[test]
    fn test_open_snapshots_do_not_seal() {
        let (mut agg, metrics) = aggregator(8, 0);
        agg.feed(&RawEvent::numeric("x", "c", 10, 1.0));

        let copies = agg.open_snapshots();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].total_count(), 1);
        assert_eq!(agg.open_windows(), 1);
        assert_eq!(metrics.windows_sealed.get(), 0);

        agg.feed(&RawEvent::numeric("x", "c", 20, 1.0));
        assert_eq!(metrics.late_drops.get(), 0);
        let sealed = agg.seal_all();
        assert_eq!(sealed[0].total_count(), 2);
    }

    #[test]
    fn test_synthetic_metrics_land_in_sealed_window() {
        use crate::config::{FilterConfig, NameRule, SyntheticConfig, SyntheticKind};

        let (agg, _) = aggregator(8, 0);
        let synthetic = SyntheticSet::from_config(&[SyntheticConfig {
            name: "live".to_string(),
            category: "synthetic".to_string(),
            kind: SyntheticKind::Accumulation {
                increment: Some(FilterConfig {
                    names: vec![NameRule::Equal("spawn".to_string())],
                    categories: Vec::new(),
                }),
                decrement: Some(FilterConfig {
                    names: vec![NameRule::Equal("despawn".to_string())],
                    categories: Vec::new(),
                }),
            },
        }])
        .expect("synthetic");
        let mut agg = agg.with_synthetic(synthetic);

        agg.feed(&RawEvent::numeric("spawn", "game", 1, 4.0));
        agg.feed(&RawEvent::numeric("despawn", "game", 2, 1.0));
        agg.feed(&RawEvent::numeric("spawn", "game", W + 1, 2.0));

        assert_eq!(
            agg.open_snapshots()[0].get("live", "synthetic").map(|m| m.sum),
            Some(3.0)
        );

        let sealed = agg.seal_all();
        assert_eq!(sealed[0].get("live", "synthetic").map(|m| m.sum), Some(3.0));
        assert_eq!(sealed[0].get("spawn", "game").map(|m| m.count), Some(1));
        assert_eq!(sealed[1].get("live", "synthetic").map(|m| m.sum), Some(2.0));
    }

    #[test]
    fn test_late_event_after_seal_is_dropped() {
        let (mut agg, metrics) = aggregator(8, 0);
        agg.feed(&RawEvent::numeric("x", "c", 10, 1.0));
        let sealed = agg.seal_due(W);
        assert_eq!(sealed.len(), 1);

        agg.feed(&RawEvent::numeric("x", "c", 20, 1.0));
        assert_eq!(metrics.late_drops.get(), 1);
        assert_eq!(agg.open_windows(), 0);

        // The next window is still open for business.
        agg.feed(&RawEvent::numeric("x", "c", W + 1, 1.0));
        assert_eq!(agg.open_windows(), 1);
    }

    #[test]
    fn test_cardinality_ceiling() {
        let (mut agg, metrics) = aggregator(2, 0);
        for _ in 0..3 {
            agg.feed(&RawEvent::numeric("a", "c", 1, 1.0));
            agg.feed(&RawEvent::numeric("b", "c", 1, 1.0));
        }
        for _ in 0..7 {
            agg.feed(&RawEvent::numeric("third", "c", 1, 1.0));
        }

        let snap = agg.seal_current_window().expect("sealed");
        assert_eq!(snap.metrics.len(), 3);
        assert!(snap.get("third", "c").is_none());
        assert_eq!(snap.overflow().map(|m| m.count), Some(7));
        assert_eq!(metrics.overflow_count.get(), 7);
        assert_eq!(snap.total_count(), 13);
    }

    #[test]
    fn test_ceiling_resets_per_window() {
        let (mut agg, _) = aggregator(1, 0);
        agg.feed(&RawEvent::numeric("a", "c", 1, 1.0));
        agg.feed(&RawEvent::numeric("b", "c", W + 1, 1.0));

        let sealed = agg.seal_all();
        assert!(sealed[0].get("a", "c").is_some());
        assert!(sealed[1].get("b", "c").is_some());
        assert!(sealed[1].overflow().is_none());
    }

    #[test]
    fn test_too_many_open_windows_force_seals_oldest() {
        let (mut agg, _) = aggregator(8, 0);
        for i in 0..=MAX_OPEN_WINDOWS as u64 {
            agg.feed(&RawEvent::numeric("x", "c", i * W, 1.0));
        }
        assert_eq!(agg.open_windows(), MAX_OPEN_WINDOWS);

        let first = agg.seal_current_window().expect("forced window");
        assert_eq!(first.window_start_ns, 0);
    }

    #[test]
    fn test_attribution_independent_of_thread_and_arrival_order() {
        let (mut agg, _) = aggregator(8, W);
        let timestamps = [W + 5, 7, 2 * W - 1, W - 1, 3];
        for (i, ts) in timestamps.iter().enumerate() {
            agg.feed(&RawEvent::numeric("x", "c", *ts, 1.0).with_thread(i as u32));
        }
        let sealed = agg.seal_all();
        let counts: Vec<(u64, u64)> = sealed
            .iter()
            .map(|s| (s.window_start_ns, s.total_count()))
            .collect();
        assert_eq!(counts, vec![(0, 3), (W, 2)]);
    }
}
