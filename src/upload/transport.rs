use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::encode::EncodedBatch;

/// Why a delivery attempt failed. Every variant leads to a retry.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport failure: {0}")]
    Request(String),
    #[error("transport failure: collector returned status {0}")]
    Status(u16),
    #[error("transport failure: no response within {0:?}")]
    Timeout(Duration),
    #[error("transport failure: building body: {0}")]
    Body(String),
}

/// One POST worth of encoded windows, in sequence order.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub batches: Vec<EncodedBatch>,
    /// Failed attempts so far.
    pub failures: u32,
    /// Earliest time of the next attempt.
    pub not_before: Instant,
}

impl UploadRequest {
    pub fn new(batches: Vec<EncodedBatch>) -> Self {
        Self {
            batches,
            failures: 0,
            not_before: Instant::now(),
        }
    }

    pub fn first_sequence(&self) -> u64 {
        self.batches.first().map_or(0, |b| b.sequence_id)
    }

    pub fn last_sequence(&self) -> u64 {
        self.batches.last().map_or(0, |b| b.sequence_id)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Delivers upload requests to a collector.
///
/// `Ok` means acknowledged. The uploader owns retries and timeouts, so an
/// implementation makes exactly one attempt per call.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: &UploadRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}
