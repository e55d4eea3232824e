use anyhow::Result;
use prometheus::{IntCounter, IntGauge, Opts, Registry};
use serde::Serialize;

const NAMESPACE: &str = "perfcollector";

/// Point-in-time copy of the drop and overflow counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounters {
    /// Events rejected at ingest (queue full or shutting down).
    pub ingest_drops: u64,
    /// Batches dropped by the uploader (retries exhausted, queue evicted, shutdown).
    pub upload_drops: u64,
    /// Events folded into the overflow metric.
    pub overflow_count: u64,
    /// Events that arrived after their window was sealed.
    pub late_drops: u64,
    /// Windows that could not be encoded.
    pub encode_failures: u64,
}

/// Prometheus metrics for pipeline health.
///
/// All metrics use the "perfcollector" namespace and live in a private
/// registry so several pipelines can coexist in one process.
pub struct PipelineMetrics {
    registry: Registry,

    // === Ingest ===
    /// Events accepted into the ingest queue.
    pub events_ingested: IntCounter,
    /// Events dropped at ingest.
    pub ingest_drops: IntCounter,
    /// Events rejected by the ingest filter.
    pub events_filtered: IntCounter,
    /// Scopes refused because the per-thread depth limit was reached.
    pub scope_overflows: IntCounter,
    /// `end` calls with no open scope on the thread.
    pub unmatched_scope_ends: IntCounter,

    // === Aggregation ===
    /// Events dropped because their window had already been sealed.
    pub late_drops: IntCounter,
    /// Events folded into the overflow metric.
    pub overflow_count: IntCounter,
    /// Windows sealed.
    pub windows_sealed: IntCounter,
    /// Windows in the snapshot store.
    pub store_windows: IntGauge,

    // === Export ===
    /// Windows that failed to encode.
    pub encode_failures: IntCounter,
    /// Windows written to the spill directory.
    pub spill_writes: IntCounter,
    /// Failed spill writes.
    pub spill_errors: IntCounter,
    /// Upload requests acknowledged by the collector.
    pub batches_uploaded: IntCounter,
    /// Encoded windows dropped by the uploader.
    pub upload_drops: IntCounter,
    /// Upload attempts rescheduled after a failure.
    pub upload_retries: IntCounter,
    /// Upload attempts that failed.
    pub upload_failures: IntCounter,
    /// Upload requests waiting for a first or further attempt.
    pub pending_upload_requests: IntGauge,
}

impl PipelineMetrics {
    /// Creates the metric set with every metric registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let events_ingested = counter(
            "events_ingested_total",
            "Total events accepted into the ingest queue.",
        )?;
        let ingest_drops = counter(
            "ingest_drops_total",
            "Total events dropped at ingest because the queue was full or closed.",
        )?;
        let events_filtered = counter(
            "events_filtered_total",
            "Total events rejected by the ingest filter.",
        )?;
        let scope_overflows = counter(
            "scope_overflows_total",
            "Total scopes refused at the depth limit.",
        )?;
        let unmatched_scope_ends = counter(
            "unmatched_scope_ends_total",
            "Total scope ends with no open scope.",
        )?;

        let late_drops = counter(
            "late_drops_total",
            "Total events that arrived after their window was sealed.",
        )?;
        let overflow_count = counter(
            "overflow_events_total",
            "Total events folded into the overflow metric.",
        )?;
        let windows_sealed = counter("windows_sealed_total", "Total windows sealed.")?;
        let store_windows = gauge(
            "store_windows",
            "Number of sealed windows held in memory.",
        )?;

        let encode_failures = counter(
            "encode_failures_total",
            "Total windows that failed to encode.",
        )?;
        let spill_writes = counter("spill_writes_total", "Total windows spilled to disk.")?;
        let spill_errors = counter("spill_errors_total", "Total failed spill writes.")?;
        let batches_uploaded = counter(
            "upload_requests_acked_total",
            "Total upload requests acknowledged by the collector.",
        )?;
        let upload_drops = counter(
            "upload_drops_total",
            "Total encoded windows dropped by the uploader.",
        )?;
        let upload_retries = counter(
            "upload_retries_total",
            "Total upload attempts rescheduled after a failure.",
        )?;
        let upload_failures = counter(
            "upload_failures_total",
            "Total failed upload attempts.",
        )?;
        let pending_upload_requests = gauge(
            "pending_upload_requests",
            "Upload requests waiting to be sent.",
        )?;

        Ok(Self {
            registry,
            events_ingested,
            ingest_drops,
            events_filtered,
            scope_overflows,
            unmatched_scope_ends,
            late_drops,
            overflow_count,
            windows_sealed,
            store_windows,
            encode_failures,
            spill_writes,
            spill_errors,
            batches_uploaded,
            upload_drops,
            upload_retries,
            upload_failures,
            pending_upload_requests,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current drop and overflow counters.
    pub fn snapshot(&self) -> DropCounters {
        DropCounters {
            ingest_drops: self.ingest_drops.get(),
            upload_drops: self.upload_drops.get(),
            overflow_count: self.overflow_count.get(),
            late_drops: self.late_drops.get(),
            encode_failures: self.encode_failures.get(),
        }
    }
}
