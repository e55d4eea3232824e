pub mod event;
pub mod filter;
pub mod scope;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::export::health::PipelineMetrics;

use self::event::RawEvent;
use self::filter::EventFilter;
use self::scope::NameInterner;

/// Why an event did not reach the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("event queue full")]
    Overflow,
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

/// Host-facing entry point of the pipeline.
///
/// `ingest` never blocks: events go into a bounded queue and are dropped,
/// and counted, when the queue is full or the pipeline is shutting down.
/// Safe to call from any thread, including threads outside the tokio runtime.
pub struct EventSource {
    tx: mpsc::Sender<RawEvent>,
    filter: ArcSwap<EventFilter>,
    interner: Arc<NameInterner>,
    shutting_down: AtomicBool,
    metrics: Arc<PipelineMetrics>,
}

impl EventSource {
    /// Creates the source and the receiving end consumed by the aggregator.
    pub fn new(
        capacity: usize,
        filter: EventFilter,
        interner: Arc<NameInterner>,
        metrics: Arc<PipelineMetrics>,
    ) -> (Self, mpsc::Receiver<RawEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self {
            tx,
            filter: ArcSwap::from_pointee(filter),
            interner,
            shutting_down: AtomicBool::new(false),
            metrics,
        };
        (source, rx)
    }

    /// Hands an event to the pipeline, dropping it on backpressure.
    pub fn ingest(&self, event: RawEvent) {
        let _ = self.try_ingest(event);
    }

    /// Like `ingest`, but reports why an event was dropped.
    ///
    /// Filtered-out events return `Ok`: they were never wanted.
    pub fn try_ingest(&self, event: RawEvent) -> Result<(), IngestError> {
        if self.shutting_down.load(Ordering::Acquire) {
            self.metrics.ingest_drops.inc();
            return Err(IngestError::ShutdownInProgress);
        }

        {
            let filter = self.filter.load();
            if !filter.is_accept_all() && !filter.matches(&event.name, &event.category) {
                self.metrics.events_filtered.inc();
                return Ok(());
            }
        }

        match self.tx.try_send(event) {
            Ok(()) => {
                self.metrics.events_ingested.inc();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.ingest_drops.inc();
                Err(IngestError::Overflow)
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.ingest_drops.inc();
                Err(IngestError::ShutdownInProgress)
            }
        }
    }

    /// Builds an event whose name and category are interned.
    pub fn event(&self, name: &str, category: &str, timestamp_ns: u64) -> RawEvent {
        RawEvent::new(
            self.interner.intern(name),
            self.interner.intern(category),
            timestamp_ns,
        )
    }

    /// Swaps the ingest allowlist without blocking producers.
    pub fn set_filter(&self, filter: EventFilter) {
        self.filter.store(Arc::new(filter));
        tracing::info!("event filter updated");
    }

    /// Rejects all further events.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Events currently queued for the aggregator.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn interner(&self) -> &Arc<NameInterner> {
        &self.interner
    }
}
