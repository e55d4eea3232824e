pub mod backoff;
pub mod http;
pub mod transport;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::encode::EncodedBatch;
use crate::export::health::PipelineMetrics;

use self::backoff::Backoff;
use self::transport::{Transport, TransportError, UploadRequest};

/// Idle wake-up when nothing is scheduled.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

type Attempt = (UploadRequest, Result<(), TransportError>);

/// Tallies reported when the uploader exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    /// Requests acknowledged.
    pub acked: u64,
    /// Encoded windows dropped (retries exhausted, evicted, or abandoned at shutdown).
    pub dropped: u64,
}

/// Batches encoded windows and delivers them through a [`Transport`].
///
/// Each request moves Pending → InFlight → Acked or Failed. A failed request
/// goes back to Pending after a backoff delay until it has failed
/// `max_retries` more times than its first attempt, then it is dropped.
/// Attempts run in their own tasks, at most `workers` at a time, each under
/// the per-call timeout.
pub struct Uploader<T: Transport> {
    transport: Arc<T>,
    metrics: Arc<PipelineMetrics>,
    backoff: Backoff,
    batch_size: usize,
    batch_timeout: Duration,
    timeout: Duration,
    max_queue_depth: usize,
    workers: usize,
    max_retries: u32,
    shutdown_timeout: Duration,

    batch: Vec<EncodedBatch>,
    batch_deadline: Option<Instant>,
    pending: VecDeque<UploadRequest>,
    in_flight: JoinSet<Attempt>,
    /// Encoded windows owned by in-flight attempts.
    in_flight_batches: usize,
    summary: UploadSummary,
}

impl<T: Transport> Uploader<T> {
    pub fn new(cfg: &UploadConfig, transport: T, metrics: Arc<PipelineMetrics>) -> Self {
        let batch_size = cfg.batch_size.max(1);
        Self {
            transport: Arc::new(transport),
            metrics,
            backoff: Backoff::from_config(&cfg.retry),
            batch_size,
            batch_timeout: cfg.batch_timeout,
            timeout: cfg.timeout,
            max_queue_depth: cfg.max_queue_depth.max(1),
            workers: cfg.workers.max(1),
            max_retries: cfg.retry.max_retries,
            shutdown_timeout: cfg.shutdown_timeout,
            batch: Vec::with_capacity(batch_size),
            batch_deadline: None,
            pending: VecDeque::new(),
            in_flight: JoinSet::new(),
            in_flight_batches: 0,
            summary: UploadSummary::default(),
        }
    }

    /// Spawns the uploader loop, returning the sender that feeds it.
    ///
    /// Dropping every sender starts the final flush; the handle resolves
    /// once it is done.
    pub fn spawn(
        self,
    ) -> (
        mpsc::UnboundedSender<EncodedBatch>,
        tokio::task::JoinHandle<UploadSummary>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    /// Runs until `rx` closes, then makes one bounded final attempt.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EncodedBatch>) -> UploadSummary {
        info!(
            batch_size = self.batch_size,
            workers = self.workers,
            max_retries = self.max_retries,
            "uploader started",
        );

        loop {
            self.dispatch_ready();
            let wake = self.next_wake();

            tokio::select! {
                batch = rx.recv() => match batch {
                    Some(batch) => self.push(batch),
                    None => break,
                },

                joined = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Some(joined) = joined {
                        self.complete(joined);
                    }
                }

                _ = tokio::time::sleep_until(wake) => {
                    if self.batch_deadline.is_some_and(|d| d <= Instant::now()) {
                        self.flush_batch();
                    }
                }
            }
        }

        self.shutdown().await
    }

    fn push(&mut self, batch: EncodedBatch) {
        if self.batch.is_empty() {
            self.batch_deadline = Some(Instant::now() + self.batch_timeout);
        }
        self.batch.push(batch);
        if self.batch.len() >= self.batch_size {
            self.flush_batch();
        }
    }

    /// Turns the partial batch into a pending request.
    fn flush_batch(&mut self) {
        self.batch_deadline = None;
        if self.batch.is_empty() {
            return;
        }
        let batches = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        self.enqueue(UploadRequest::new(batches));
    }

    /// Queues a request in first-sequence order, evicting the oldest past the depth limit.
    fn enqueue(&mut self, request: UploadRequest) {
        let first = request.first_sequence();
        let pos = self
            .pending
            .partition_point(|r| r.first_sequence() < first);
        self.pending.insert(pos, request);

        while self.pending.len() > self.max_queue_depth {
            if let Some(evicted) = self.pending.pop_front() {
                warn!(
                    first_sequence = evicted.first_sequence(),
                    batches = evicted.len(),
                    "upload queue full, dropping oldest request",
                );
                self.drop_request(&evicted);
            }
        }
        self.metrics.pending_upload_requests.set(self.pending.len() as i64);
    }

    /// Moves due requests to in-flight while workers are free.
    fn dispatch_ready(&mut self) {
        let now = Instant::now();
        while self.in_flight.len() < self.workers {
            let Some(pos) = self.pending.iter().position(|r| r.not_before <= now) else {
                break;
            };
            let Some(request) = self.pending.remove(pos) else {
                break;
            };
            self.spawn_attempt(request);
        }
        self.metrics.pending_upload_requests.set(self.pending.len() as i64);
    }

    fn spawn_attempt(&mut self, request: UploadRequest) {
        let transport = Arc::clone(&self.transport);
        let timeout = self.timeout;
        self.in_flight_batches += request.len();

        self.in_flight.spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.send(&request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            };
            (request, result)
        });
    }

    fn complete(&mut self, joined: Result<Attempt, tokio::task::JoinError>) {
        let (mut request, result) = match joined {
            Ok(attempt) => attempt,
            Err(e) => {
                // Its windows stay in `in_flight_batches` and are counted as dropped on exit.
                warn!(error = %e, "upload attempt task failed");
                return;
            }
        };
        self.in_flight_batches -= request.len();

        match result {
            Ok(()) => {
                self.summary.acked += 1;
                self.metrics.batches_uploaded.inc();
                debug!(
                    first_sequence = request.first_sequence(),
                    last_sequence = request.last_sequence(),
                    attempts = request.failures + 1,
                    "upload acknowledged",
                );
            }
            Err(e) => {
                self.metrics.upload_failures.inc();
                request.failures += 1;

                if request.failures > self.max_retries {
                    warn!(
                        first_sequence = request.first_sequence(),
                        batches = request.len(),
                        attempts = request.failures,
                        error = %e,
                        "upload retries exhausted, dropping request",
                    );
                    self.drop_request(&request);
                    return;
                }

                let delay = self.backoff.delay(request.failures);
                debug!(
                    first_sequence = request.first_sequence(),
                    failures = request.failures,
                    delay = ?delay,
                    error = %e,
                    "upload failed, retrying",
                );
                request.not_before = Instant::now() + delay;
                self.metrics.upload_retries.inc();
                self.enqueue(request);
            }
        }
    }

    fn next_wake(&self) -> Instant {
        let far = Instant::now() + IDLE_WAKE;
        let retry = if self.in_flight.len() < self.workers {
            self.pending.iter().map(|r| r.not_before).min()
        } else {
            None
        };

        [self.batch_deadline, retry]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(far)
    }

    fn drop_request(&mut self, request: &UploadRequest) {
        let n = request.len() as u64;
        self.summary.dropped += n;
        self.metrics.upload_drops.inc_by(n);
    }

    /// Flushes the partial batch and gives each request one attempt within
    /// `shutdown_timeout`. Whatever is left is dropped and counted.
    async fn shutdown(mut self) -> UploadSummary {
        self.flush_batch();
        let deadline = Instant::now() + self.shutdown_timeout;

        debug!(
            pending = self.pending.len(),
            in_flight = self.in_flight.len(),
            "uploader final flush",
        );

        let drained = tokio::time::timeout_at(deadline, async {
            loop {
                while self.in_flight.len() < self.workers {
                    let Some(request) = self.pending.pop_front() else {
                        break;
                    };
                    self.spawn_attempt(request);
                }

                match self.in_flight.join_next().await {
                    Some(joined) => self.complete_final(joined),
                    None => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("final upload timed out");
        }

        self.in_flight.abort_all();
        while let Some(joined) = self.in_flight.join_next().await {
            if let Ok(attempt) = joined {
                self.complete_final(Ok(attempt));
            }
        }
        let abandoned = std::mem::take(&mut self.in_flight_batches)
            + self.pending.drain(..).map(|r| r.len()).sum::<usize>();
        if abandoned > 0 {
            warn!(batches = abandoned, "dropping undelivered windows at shutdown");
            self.summary.dropped += abandoned as u64;
            self.metrics.upload_drops.inc_by(abandoned as u64);
        }
        self.metrics.pending_upload_requests.set(0);

        info!(
            acked = self.summary.acked,
            dropped = self.summary.dropped,
            "uploader stopped",
        );
        self.summary
    }

    fn complete_final(&mut self, joined: Result<Attempt, tokio::task::JoinError>) {
        if let Ok((request, _)) = &joined {
            self.in_flight_batches -= request.len();
        }
        match joined {
            Ok((request, Ok(()))) => {
                self.summary.acked += 1;
                self.metrics.batches_uploaded.inc();
                debug!(first_sequence = request.first_sequence(), "final upload acknowledged");
            }
            Ok((request, Err(e))) => {
                self.metrics.upload_failures.inc();
                warn!(
                    first_sequence = request.first_sequence(),
                    error = %e,
                    "final upload failed, dropping request",
                );
                self.drop_request(&request);
            }
            Err(e) => warn!(error = %e, "upload attempt task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::config::RetryConfig;
    use crate::encode::EncodingKind;

    struct FlakyTransport {
        failures_left: AtomicU32,
        calls: Arc<AtomicU32>,
    }

    impl Transport for FlakyTransport {
        async fn send(&self, _request: &UploadRequest) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(TransportError::Status(503));
            }
            Ok(())
        }
    }

    struct HangingTransport;

    impl Transport for HangingTransport {
        async fn send(&self, _request: &UploadRequest) -> Result<(), TransportError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn cfg(batch_size: usize, max_retries: u32) -> UploadConfig {
        UploadConfig {
            enabled: true,
            address: "mock://".to_string(),
            batch_size,
            batch_timeout: Duration::from_millis(50),
            timeout: Duration::from_secs(1),
            retry: RetryConfig {
                max_retries,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                multiplier: 2.0,
                jitter_factor: 0.0,
            },
            shutdown_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn batch(seq: u64) -> EncodedBatch {
        EncodedBatch {
            sequence_id: seq,
            window_start_ns: seq,
            kind: EncodingKind::Binary,
            payload: vec![0u8; 4],
        }
    }

    fn flaky(failures: u32) -> (FlakyTransport, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            FlakyTransport {
                failures_left: AtomicU32::new(failures),
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }

    fn metrics() -> Arc<PipelineMetrics> {
        Arc::new(PipelineMetrics::new().expect("metrics"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_acks() {
        let metrics = metrics();
        let (transport, calls) = flaky(3);
        let (tx, handle) = Uploader::new(&cfg(1, 5), transport, Arc::clone(&metrics)).spawn();

        tx.send(batch(1)).expect("send");
        // Attempts at 0, 100, 300 and 700ms.
        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.batches_uploaded.get(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(metrics.batches_uploaded.get(), 1);

        drop(tx);
        let summary = handle.await.expect("join");
        assert_eq!(summary, UploadSummary { acked: 1, dropped: 0 });
        assert_eq!(metrics.upload_retries.get(), 3);
        assert_eq!(metrics.upload_failures.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drops_after_retry_ceiling() {
        let metrics = metrics();
        let (transport, calls) = flaky(u32::MAX);
        let (tx, handle) = Uploader::new(&cfg(2, 2), transport, Arc::clone(&metrics)).spawn();

        tx.send(batch(1)).expect("send");
        tx.send(batch(2)).expect("send");
        tokio::time::sleep(Duration::from_secs(5)).await;

        // First attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.upload_drops.get(), 2);

        drop(tx);
        let summary = handle.await.expect("join");
        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.acked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_on_timeout() {
        let metrics = metrics();
        let (transport, calls) = flaky(0);
        let (tx, handle) = Uploader::new(&cfg(10, 0), transport, Arc::clone(&metrics)).spawn();

        tx.send(batch(1)).expect("send");
        tx.send(batch(2)).expect("send");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(tx);
        assert_eq!(handle.await.expect("join").acked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_depth_drops_oldest() {
        let metrics = metrics();
        let mut config = cfg(1, 0);
        config.max_queue_depth = 2;
        config.timeout = Duration::from_secs(60);
        config.shutdown_timeout = Duration::from_millis(10);
        let (tx, handle) = Uploader::new(&config, HangingTransport, Arc::clone(&metrics)).spawn();

        // The first request occupies the single worker; the rest queue.
        for seq in 1..=5 {
            tx.send(batch(seq)).expect("send");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Requests 2 and 3 are evicted; 4 and 5 remain pending.
        assert_eq!(metrics.upload_drops.get(), 2);
        assert_eq!(metrics.pending_upload_requests.get(), 2);

        drop(tx);
        let summary = handle.await.expect("join");
        // Everything else is abandoned at shutdown.
        assert_eq!(summary.dropped, 5);
        assert_eq!(metrics.upload_drops.get(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let metrics = metrics();
        let mut config = cfg(1, 0);
        config.timeout = Duration::from_millis(100);
        let (tx, handle) = Uploader::new(&config, HangingTransport, Arc::clone(&metrics)).spawn();

        tx.send(batch(1)).expect("send");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(metrics.upload_failures.get(), 1);
        assert_eq!(metrics.upload_drops.get(), 1);

        drop(tx);
        handle.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_partial_batch() {
        let metrics = metrics();
        let (transport, calls) = flaky(0);
        let (tx, handle) = Uploader::new(&cfg(10, 3), transport, Arc::clone(&metrics)).spawn();

        tx.send(batch(1)).expect("send");
        drop(tx);

        let summary = handle.await.expect("join");
        assert_eq!(summary.acked, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_retrying_request_one_attempt() {
        let metrics = metrics();
        let (transport, calls) = flaky(1);
        let mut config = cfg(1, 5);
        config.retry.initial_delay = Duration::from_secs(30);
        config.retry.max_delay = Duration::from_secs(30);
        let (tx, handle) = Uploader::new(&config, transport, Arc::clone(&metrics)).spawn();

        tx.send(batch(1)).expect("send");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Shutdown does not wait out the 30s backoff.
        drop(tx);
        let summary = handle.await.expect("join");
        assert_eq!(summary.acked, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
