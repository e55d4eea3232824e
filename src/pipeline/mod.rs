use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::snapshot::WindowSnapshot;
use crate::aggregate::synthetic::SyntheticSet;
use crate::aggregate::Aggregator;
use crate::clock::WindowClock;
use crate::config::Config;
use crate::encode::binary::encode_binary;
use crate::encode::{EncodedBatch, Encoder, EncodingKind, SequenceGenerator};
use crate::export::health::{DropCounters, PipelineMetrics};
use crate::source::event::RawEvent;
use crate::source::filter::EventFilter;
use crate::source::scope::{NameInterner, ScopeTracker};
use crate::source::EventSource;
use crate::store::budget::BudgetTable;
use crate::store::spill::SpillWriter;
use crate::store::{QueryResult, SnapshotStore};
use crate::upload::http::HttpTransport;
use crate::upload::transport::Transport;
use crate::upload::{UploadSummary, Uploader};

/// Events moved from the queue per aggregator wake-up.
const DRAIN_CHUNK: usize = 256;

/// Requests from the pipeline handle and the clock to the aggregator task.
enum Control {
    /// A window boundary passed; seal whatever is due.
    Tick,
    /// Seal what is due, publish copies of the open windows and acknowledge
    /// once both are stored.
    Flush(oneshot::Sender<()>),
}

/// Messages from the aggregator to the fan-out task.
enum Sealed {
    Window(WindowSnapshot),
    /// Copy of a still-open window. Stored for queries only; the sealed
    /// version replaces it later.
    Provisional(WindowSnapshot),
    Barrier(oneshot::Sender<()>),
}

/// A running collection pipeline.
///
/// Owns the event source, the aggregator, fan-out and uploader tasks, the
/// snapshot store and the counters. Dropping it stops the clock and the tasks
/// wind down once their inputs close; call `stop` to wait for the final flush.
pub struct Pipeline {
    source: Arc<EventSource>,
    scopes: Arc<ScopeTracker>,
    store: Arc<SnapshotStore>,
    budgets: Arc<BudgetTable>,
    metrics: Arc<PipelineMetrics>,
    clock: WindowClock,
    control: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
    aggregator: JoinHandle<()>,
    fanout: JoinHandle<()>,
    uploader: Option<JoinHandle<UploadSummary>>,
}

impl Pipeline {
    /// Starts a pipeline that uploads over HTTP when `upload.enabled` is set.
    pub async fn start(cfg: Config) -> Result<Self> {
        let transport = if cfg.upload.enabled {
            Some(HttpTransport::new(&cfg.upload, &cfg.producer_id)?)
        } else {
            None
        };
        Self::start_with_transport(cfg, transport).await
    }

    /// Starts a pipeline delivering through `transport`, or keeping windows
    /// local only when it is `None`.
    pub async fn start_with_transport<T: Transport>(
        cfg: Config,
        transport: Option<T>,
    ) -> Result<Self> {
        cfg.validate()?;

        let metrics = Arc::new(PipelineMetrics::new().context("registering metrics")?);
        let interner = Arc::new(NameInterner::new());
        let filter = EventFilter::from_config(&cfg.source.filter)?;

        let (source, events) = EventSource::new(
            cfg.source.queue_capacity,
            filter,
            Arc::clone(&interner),
            Arc::clone(&metrics),
        );
        let source = Arc::new(source);
        let scopes = Arc::new(ScopeTracker::new(
            interner,
            cfg.source.max_scope_depth,
            Arc::clone(&metrics),
        ));

        let store = Arc::new(SnapshotStore::new(cfg.store.capacity));
        let budgets = Arc::new(BudgetTable::new(cfg.budgets.clone()));

        let spill = match &cfg.store.spill_dir {
            Some(dir) => {
                let writer = SpillWriter::new(dir, cfg.store.spill_max_files)?;
                if cfg.store.restore_on_start {
                    let restored = writer.load_recent(store.capacity())?;
                    for snapshot in restored.iter() {
                        store.record(Arc::new(snapshot.clone()));
                    }
                    info!(
                        windows = restored.len(),
                        dir = %dir.display(),
                        "restored spilled windows",
                    );
                }
                Some(Arc::new(writer))
            }
            None => None,
        };
        metrics.store_windows.set(store.len() as i64);

        let (upload_tx, uploader) = match transport {
            Some(transport) => {
                let (tx, handle) =
                    Uploader::new(&cfg.upload, transport, Arc::clone(&metrics)).spawn();
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        let (sealed_tx, sealed_rx) = mpsc::unbounded_channel();
        let fanout = tokio::spawn(run_fanout(
            FanOut {
                store: Arc::clone(&store),
                budgets: Arc::clone(&budgets),
                encoder: Encoder::new(cfg.upload.encoding, SequenceGenerator::new()),
                spill,
                upload: upload_tx,
                metrics: Arc::clone(&metrics),
            },
            sealed_rx,
        ));

        let (control, control_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let synthetic = SyntheticSet::from_config(&cfg.synthetic)?;
        let aggregator = tokio::spawn(run_aggregator(
            Aggregator::from_config(&cfg.window, Arc::clone(&metrics)).with_synthetic(synthetic),
            events,
            control_rx,
            sealed_tx,
            cancel.clone(),
        ));

        let clock = WindowClock::new(cfg.window.duration, cfg.window.allowed_lateness)?;
        let tick = control.clone();
        clock.on_window_closed(Box::new(move |_| {
            let _ = tick.send(Control::Tick);
        }));
        clock.start();

        info!(
            producer_id = %cfg.producer_id,
            window = ?cfg.window.duration,
            max_metrics = cfg.window.max_metrics,
            upload = uploader.is_some(),
            "pipeline started",
        );

        Ok(Self {
            source,
            scopes,
            store,
            budgets,
            metrics,
            clock,
            control,
            cancel,
            aggregator,
            fanout,
            uploader,
        })
    }

    /// Host entry point for events.
    pub fn source(&self) -> &Arc<EventSource> {
        &self.source
    }

    /// Shorthand for `source().ingest(event)`.
    pub fn ingest(&self, event: RawEvent) {
        self.source.ingest(event);
    }

    pub fn scopes(&self) -> &Arc<ScopeTracker> {
        &self.scopes
    }

    /// Opens a timed scope on `thread_id`.
    pub fn begin_scope(&self, thread_id: u32, name: &str, category: &str, timestamp_ns: u64) {
        self.scopes.begin(thread_id, name, category, timestamp_ns);
    }

    /// Closes the innermost scope on `thread_id` and ingests its duration event.
    pub fn end_scope(&self, thread_id: u32, timestamp_ns: u64) {
        if let Some(event) = self.scopes.end(thread_id, timestamp_ns) {
            self.source.ingest(event);
        }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn budgets(&self) -> &Arc<BudgetTable> {
        &self.budgets
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Stored windows whose start falls in `range`.
    pub fn query(&self, range: Range<u64>, filter: Option<EventFilter>) -> QueryResult {
        self.store.query(range, filter)
    }

    pub fn drop_counters(&self) -> DropCounters {
        self.metrics.snapshot()
    }

    /// Replaces the ingest filter.
    pub fn set_filter(&self, filter: EventFilter) {
        self.source.set_filter(filter);
    }

    /// Drains queued events and waits until every due window is stored,
    /// spilled and handed to the uploader.
    ///
    /// Windows still accepting events are not sealed. Their current contents
    /// are stored as provisional copies, so queries see everything ingested
    /// before the call while later events for those windows still count.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Flush(tx))
            .map_err(|_| anyhow::anyhow!("pipeline is stopped"))?;
        rx.await.context("waiting for flush")?;
        Ok(())
    }

    /// Stops intake, seals the remaining windows, makes the final bounded
    /// upload attempt and joins every task.
    pub async fn stop(self) -> Result<DropCounters> {
        self.source.shutdown();
        self.clock.stop();
        self.cancel.cancel();

        self.aggregator.await.context("joining aggregator")?;
        self.fanout.await.context("joining fan-out")?;
        if let Some(uploader) = self.uploader {
            let summary = uploader.await.context("joining uploader")?;
            debug!(acked = summary.acked, dropped = summary.dropped, "upload summary");
        }

        let counters = self.metrics.snapshot();
        info!(
            ingest_drops = counters.ingest_drops,
            upload_drops = counters.upload_drops,
            overflow_count = counters.overflow_count,
            late_drops = counters.late_drops,
            "pipeline stopped",
        );
        Ok(counters)
    }
}

/// Single consumer of the event queue. Sealed windows leave by move.
async fn run_aggregator(
    mut aggregator: Aggregator,
    mut events: mpsc::Receiver<RawEvent>,
    mut control: mpsc::UnboundedReceiver<Control>,
    sealed: mpsc::UnboundedSender<Sealed>,
    cancel: CancellationToken,
) {
    let mut buf = Vec::with_capacity(DRAIN_CHUNK);
    let mut last_fed = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            cmd = control.recv() => match cmd {
                Some(Control::Tick) => {
                    if drain_queued(&mut aggregator, &mut events) > 0 {
                        last_fed = Instant::now();
                    }
                    let idle_ns = duration_ns(last_fed.elapsed());
                    for snapshot in aggregator.seal_idle(idle_ns) {
                        let _ = sealed.send(Sealed::Window(snapshot));
                    }
                }
                Some(Control::Flush(ack)) => {
                    if drain_queued(&mut aggregator, &mut events) > 0 {
                        last_fed = Instant::now();
                    }
                    for snapshot in aggregator.seal_ready() {
                        let _ = sealed.send(Sealed::Window(snapshot));
                    }
                    for snapshot in aggregator.open_snapshots() {
                        let _ = sealed.send(Sealed::Provisional(snapshot));
                    }
                    let _ = sealed.send(Sealed::Barrier(ack));
                }
                None => break,
            },

            n = events.recv_many(&mut buf, DRAIN_CHUNK) => {
                if n == 0 {
                    break;
                }
                for event in buf.drain(..) {
                    aggregator.feed(&event);
                }
                last_fed = Instant::now();
            }
        }
    }

    // Final drain: nothing new can enter once the queue is closed.
    events.close();
    drain_queued(&mut aggregator, &mut events);
    let remaining = aggregator.seal_all();
    debug!(windows = remaining.len(), "sealing remaining windows");
    for snapshot in remaining {
        let _ = sealed.send(Sealed::Window(snapshot));
    }
}

fn drain_queued(aggregator: &mut Aggregator, events: &mut mpsc::Receiver<RawEvent>) -> usize {
    let mut drained = 0;
    while let Ok(event) = events.try_recv() {
        aggregator.feed(&event);
        drained += 1;
    }
    drained
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

struct FanOut {
    store: Arc<SnapshotStore>,
    budgets: Arc<BudgetTable>,
    encoder: Encoder,
    spill: Option<Arc<SpillWriter>>,
    upload: Option<mpsc::UnboundedSender<EncodedBatch>>,
    metrics: Arc<PipelineMetrics>,
}

/// Stores, encodes, spills and forwards sealed windows. Exits when the
/// aggregator hangs up, which closes the uploader input in turn.
async fn run_fanout(mut fanout: FanOut, mut sealed: mpsc::UnboundedReceiver<Sealed>) {
    while let Some(msg) = sealed.recv().await {
        match msg {
            Sealed::Window(snapshot) => fanout.handle(snapshot).await,
            Sealed::Provisional(snapshot) => {
                let stored = fanout.store.record(Arc::new(snapshot));
                fanout.metrics.store_windows.set(stored as i64);
            }
            Sealed::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

impl FanOut {
    async fn handle(&mut self, snapshot: WindowSnapshot) {
        let snapshot = Arc::new(snapshot);
        let stored = self.store.record(Arc::clone(&snapshot));
        self.metrics.store_windows.set(stored as i64);

        for report in self.budgets.evaluate(&snapshot) {
            if report.exceeded {
                warn!(
                    metric = %report.name,
                    category = %report.category,
                    mean = report.mean,
                    budget = report.budget,
                    window_start_ns = snapshot.window_start_ns,
                    "metric over budget",
                );
            }
        }

        if self.upload.is_none() && self.spill.is_none() {
            return;
        }

        let batch = match self.encoder.encode(&snapshot) {
            Ok(batch) => batch,
            Err(e) => {
                self.metrics.encode_failures.inc();
                error!(
                    error = %e,
                    window_start_ns = snapshot.window_start_ns,
                    "discarding window that failed to encode",
                );
                return;
            }
        };

        if let Some(spill) = &self.spill {
            self.spill_window(Arc::clone(spill), &snapshot, &batch).await;
        }

        if let Some(upload) = &self.upload {
            if upload.send(batch).is_err() {
                self.metrics.upload_drops.inc();
                warn!("uploader has stopped, dropping window");
            }
        }
    }

    async fn spill_window(
        &self,
        spill: Arc<SpillWriter>,
        snapshot: &WindowSnapshot,
        batch: &EncodedBatch,
    ) {
        let envelope = match batch.kind {
            EncodingKind::Binary => Ok(batch.payload.clone()),
            EncodingKind::Text => encode_binary(snapshot, batch.sequence_id),
        };
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.spill_errors.inc();
                warn!(error = %e, "encoding window for spill");
                return;
            }
        };

        let start = snapshot.window_start_ns;
        match tokio::task::spawn_blocking(move || spill.write(start, &envelope)).await {
            Ok(Ok(path)) => {
                self.metrics.spill_writes.inc();
                debug!(path = %path.display(), "spilled window");
            }
            Ok(Err(e)) => {
                self.metrics.spill_errors.inc();
                warn!(error = %e, "spilling window");
            }
            Err(e) => {
                self.metrics.spill_errors.inc();
                warn!(error = %e, "spill task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::now_ns;
    use crate::source::filter::NameFilter;

    const SEC: u64 = 1_000_000_000;

    fn config() -> Config {
        let mut cfg = Config::default();
        // Keep the clock out of the way; tests seal explicitly.
        cfg.window.duration = Duration::from_secs(3600);
        cfg.window.allowed_lateness = Duration::from_secs(60);
        cfg
    }

    async fn local_pipeline(cfg: Config) -> Pipeline {
        Pipeline::start_with_transport::<HttpTransport>(cfg, None)
            .await
            .expect("pipeline")
    }

    #[tokio::test]
    async fn test_flush_stores_window() {
        let pipeline = local_pipeline(config()).await;
        for _ in 0..10 {
            pipeline.ingest(RawEvent::numeric("frame_time", "render", 5 * SEC, 16.6));
        }
        pipeline.flush().await.expect("flush");

        let latest = pipeline.store().latest().expect("window");
        assert_eq!(latest.window_start_ns, 0);
        assert_eq!(latest.get("frame_time", "render").map(|m| m.count), Some(10));

        let counters = pipeline.stop().await.expect("stop");
        assert_eq!(counters, DropCounters::default());
    }

    #[tokio::test]
    async fn test_stop_seals_open_windows() {
        let pipeline = local_pipeline(config()).await;
        let store = Arc::clone(pipeline.store());
        pipeline.ingest(RawEvent::numeric("x", "c", 1, 1.0));
        pipeline.ingest(RawEvent::numeric("x", "c", 3600 * SEC + 1, 1.0));

        pipeline.stop().await.expect("stop");
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_after_stop_signal_is_dropped() {
        let pipeline = local_pipeline(config()).await;
        let source = Arc::clone(pipeline.source());
        let metrics = Arc::clone(pipeline.metrics());
        pipeline.stop().await.expect("stop");

        source.ingest(RawEvent::numeric("x", "c", 1, 1.0));
        assert_eq!(metrics.snapshot().ingest_drops, 1);
    }

    #[tokio::test]
    async fn test_scopes_become_duration_events() {
        let pipeline = local_pipeline(config()).await;
        pipeline.begin_scope(1, "layout", "render", 10 * SEC);
        pipeline.begin_scope(1, "measure", "render", 10 * SEC + 1_000_000);
        pipeline.end_scope(1, 10 * SEC + 3_000_000);
        pipeline.end_scope(1, 10 * SEC + 5_000_000);
        pipeline.flush().await.expect("flush");

        let latest = pipeline.store().latest().expect("window");
        assert_eq!(latest.get("measure", "render").map(|m| m.sum), Some(2.0));
        assert_eq!(latest.get("layout", "render").map(|m| m.sum), Some(5.0));
        pipeline.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_filter_swap() {
        let pipeline = local_pipeline(config()).await;
        pipeline.set_filter(EventFilter::new(
            NameFilter::StartsWith("frame".into()),
            None,
        ));
        pipeline.ingest(RawEvent::numeric("frame_time", "render", 1, 1.0));
        pipeline.ingest(RawEvent::numeric("gc_pause", "memory", 1, 1.0));
        pipeline.flush().await.expect("flush");

        let latest = pipeline.store().latest().expect("window");
        assert_eq!(latest.metrics.len(), 1);
        assert_eq!(pipeline.metrics().events_filtered.get(), 1);
        pipeline.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_spill_and_restore() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = config();
        cfg.store.spill_dir = Some(dir.path().to_path_buf());

        let pipeline = local_pipeline(cfg.clone()).await;
        pipeline.ingest(RawEvent::numeric("frame_time", "render", 7, 16.6));
        // Moves event time past the first window's lateness.
        pipeline.ingest(RawEvent::numeric("frame_time", "render", 3660 * SEC, 16.6));
        pipeline.flush().await.expect("flush");
        assert_eq!(pipeline.metrics().spill_writes.get(), 1);
        pipeline.stop().await.expect("stop");

        let restored = local_pipeline(cfg).await;
        assert_eq!(restored.store().len(), 2);
        let first = restored.query(0..1, None);
        let first = first.iter().next().expect("restored window");
        assert_eq!(first.get("frame_time", "render").map(|m| m.count), Some(1));
        restored.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_clock_seals_due_windows() {
        let mut cfg = Config::default();
        cfg.window.duration = Duration::from_millis(50);
        cfg.window.allowed_lateness = Duration::ZERO;
        let pipeline = local_pipeline(cfg).await;

        pipeline.ingest(RawEvent::numeric("x", "c", now_ns(), 1.0));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(pipeline.store().len(), 1);
        pipeline.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_flush_keeps_current_window_open() {
        let pipeline = local_pipeline(config()).await;
        let store = Arc::clone(pipeline.store());

        pipeline.ingest(RawEvent::numeric("x", "c", 10, 1.0));
        pipeline.flush().await.expect("flush");
        assert_eq!(store.latest().map(|w| w.total_count()), Some(1));
        assert_eq!(pipeline.metrics().windows_sealed.get(), 0);

        pipeline.ingest(RawEvent::numeric("x", "c", 20, 1.0));
        pipeline.flush().await.expect("flush");
        assert_eq!(store.len(), 1);
        assert_eq!(store.latest().map(|w| w.total_count()), Some(2));

        let counters = pipeline.stop().await.expect("stop");
        assert_eq!(counters.late_drops, 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.latest().map(|w| w.total_count()), Some(2));
    }

    #[tokio::test]
    async fn test_live_ticks_with_host_relative_timestamps() {
        let mut cfg = Config::default();
        cfg.window.duration = Duration::from_secs(1);
        cfg.window.allowed_lateness = Duration::from_millis(250);
        let pipeline = local_pipeline(cfg).await;

        // Event time runs from 5s while the wall clock ticks past several
        // window boundaries during ingest.
        for i in 0..10u64 {
            pipeline.ingest(RawEvent::numeric("x", "c", 5 * SEC + i * 50_000_000, 1.0));
            tokio::time::sleep(Duration::from_millis(150)).await;
        }

        let store = Arc::clone(pipeline.store());
        let counters = pipeline.stop().await.expect("stop");
        assert_eq!(counters.late_drops, 0);
        assert_eq!(store.len(), 1);
        let window = store.latest().expect("window");
        assert_eq!(window.window_start_ns, 5 * SEC);
        assert_eq!(window.total_count(), 10);
    }

    #[tokio::test]
    async fn test_dropped_pipeline_winds_down() {
        let pipeline = local_pipeline(config()).await;
        let store = Arc::clone(pipeline.store());
        pipeline.ingest(RawEvent::numeric("x", "c", 1, 1.0));
        drop(pipeline);

        // The aggregator only seals leftovers on exit, once its inputs close.
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("tasks kept running after drop");
        assert_eq!(store.latest().map(|w| w.total_count()), Some(1));
    }
}
