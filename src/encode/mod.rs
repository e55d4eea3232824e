pub mod binary;
pub mod text;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;

use crate::aggregate::snapshot::WindowSnapshot;

/// Wire format of an encoded window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingKind {
    /// Length-prefixed little-endian envelope.
    #[default]
    Binary,
    /// One JSON object per window.
    Text,
}

impl EncodingKind {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Binary => "application/octet-stream",
            Self::Text => "application/x-ndjson",
        }
    }
}

/// A sealed window ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    pub sequence_id: u64,
    pub window_start_ns: u64,
    pub kind: EncodingKind,
    pub payload: Vec<u8>,
}

/// Raised when a snapshot breaks a wire-format limit. An encoding invariant
/// violation: it should never happen with names bounded at ingest.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encoding invariant violation: {field} is {len} bytes")]
    FieldTooLong { field: &'static str, len: usize },
    #[error("encoding invariant violation: {0} metrics in one window")]
    TooManyMetrics(usize),
    #[error("encoding invariant violation: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a binary envelope could not be read back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u16),
    #[error("truncated at offset {offset}, needed {needed} more bytes")]
    Truncated { offset: usize, needed: usize },
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
}

/// Hands out strictly increasing sequence ids.
///
/// Seeded from the wall clock in microseconds so ids keep increasing across
/// restarts of the same producer.
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        let seed = chrono::Utc::now().timestamp_micros().max(1) as u64;
        Self::starting_at(seed)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Assigns sequence ids and serializes windows.
pub struct Encoder {
    kind: EncodingKind,
    sequence: SequenceGenerator,
}

impl Encoder {
    pub fn new(kind: EncodingKind, sequence: SequenceGenerator) -> Self {
        Self { kind, sequence }
    }

    pub fn kind(&self) -> EncodingKind {
        self.kind
    }

    /// Encodes `snapshot` under the next sequence id.
    ///
    /// A failed encode still consumes an id; gaps are allowed, reuse is not.
    pub fn encode(&self, snapshot: &WindowSnapshot) -> Result<EncodedBatch, EncodeError> {
        let sequence_id = self.sequence.next();
        let payload = match self.kind {
            EncodingKind::Binary => binary::encode_binary(snapshot, sequence_id)?,
            EncodingKind::Text => text::encode_text(snapshot, sequence_id)?.into_bytes(),
        };
        Ok(EncodedBatch {
            sequence_id,
            window_start_ns: snapshot.window_start_ns,
            kind: self.kind,
            payload,
        })
    }
}
