use std::collections::BTreeMap;
use std::sync::Arc;

use super::{DecodeError, EncodeError};
use crate::aggregate::histogram::{QuantileSketch, NUM_BUCKETS};
use crate::aggregate::snapshot::{MetricKey, WindowSnapshot};
use crate::aggregate::stats::MetricStats;
use crate::source::event::canonical_f64;

/// Envelope magic bytes.
pub const MAGIC: [u8; 4] = *b"PCWS";
/// Current envelope version.
pub const VERSION: u16 = 1;
/// magic + version + flags + sequence + start + duration + metric count.
pub const HEADER_SIZE: usize = 4 + 2 + 2 + 8 + 8 + 8 + 4;
/// Fixed part of a metric record: two length prefixes, count, sum, min, max, buckets.
const RECORD_FIXED_SIZE: usize = 2 + 2 + 8 + 8 + 8 + 8 + NUM_BUCKETS * 4;

/// Encodes a sealed window into the little-endian binary envelope.
///
/// Layout:
/// ```text
/// magic[4] version:u16 flags:u16 sequence_id:u64 window_start_ns:u64
/// window_duration_ns:u64 metric_count:u32
/// per metric, in key order:
///   name_len:u16 name category_len:u16 category
///   count:u64 sum:f64 min:f64 max:f64 buckets:[u32; 128]
/// ```
/// Output is a pure function of the snapshot and sequence id. NaN floats are
/// written as 0.0.
pub fn encode_binary(snapshot: &WindowSnapshot, sequence_id: u64) -> Result<Vec<u8>, EncodeError> {
    let metric_count = u32::try_from(snapshot.metrics.len())
        .map_err(|_| EncodeError::TooManyMetrics(snapshot.metrics.len()))?;

    let names_len: usize = snapshot
        .metrics
        .keys()
        .map(|k| k.name.len() + k.category.len())
        .sum();
    let mut buf =
        Vec::with_capacity(HEADER_SIZE + snapshot.metrics.len() * RECORD_FIXED_SIZE + names_len);

    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&sequence_id.to_le_bytes());
    buf.extend_from_slice(&snapshot.window_start_ns.to_le_bytes());
    buf.extend_from_slice(&snapshot.window_duration_ns.to_le_bytes());
    buf.extend_from_slice(&metric_count.to_le_bytes());

    for (key, stats) in &snapshot.metrics {
        put_str(&mut buf, "name", &key.name)?;
        put_str(&mut buf, "category", &key.category)?;
        buf.extend_from_slice(&stats.count.to_le_bytes());
        buf.extend_from_slice(&canonical_f64_bits(stats.sum));
        buf.extend_from_slice(&canonical_f64_bits(stats.min));
        buf.extend_from_slice(&canonical_f64_bits(stats.max));
        for bucket in stats.sketch.buckets() {
            buf.extend_from_slice(&bucket.to_le_bytes());
        }
    }

    Ok(buf)
}

/// Decodes an envelope produced by `encode_binary`, returning the sequence id
/// and the window.
pub fn decode_binary(data: &[u8]) -> Result<(u64, WindowSnapshot), DecodeError> {
    let mut r = Reader::new(data);

    if r.take(4)? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let _flags = r.u16()?;
    let sequence_id = r.u64()?;
    let window_start_ns = r.u64()?;
    let window_duration_ns = r.u64()?;
    let metric_count = r.u32()?;

    let mut metrics = BTreeMap::new();
    for _ in 0..metric_count {
        let name = r.str("name")?;
        let category = r.str("category")?;
        let count = r.u64()?;
        let sum = r.f64()?;
        let min = r.f64()?;
        let max = r.f64()?;
        let mut buckets = [0u32; NUM_BUCKETS];
        for bucket in buckets.iter_mut() {
            *bucket = r.u32()?;
        }

        metrics.insert(
            MetricKey {
                name,
                category,
            },
            MetricStats::from_parts(count, sum, min, max, QuantileSketch::from_buckets(buckets)),
        );
    }

    if r.remaining() > 0 {
        return Err(DecodeError::TrailingBytes(r.remaining()));
    }

    Ok((
        sequence_id,
        WindowSnapshot {
            window_start_ns,
            window_duration_ns,
            metrics,
        },
    ))
}

fn put_str(buf: &mut Vec<u8>, field: &'static str, s: &str) -> Result<(), EncodeError> {
    let len = u16::try_from(s.len()).map_err(|_| EncodeError::FieldTooLong {
        field,
        len: s.len(),
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn canonical_f64_bits(v: f64) -> [u8; 8] {
    // Infinities are legal here; only NaN has no canonical encoding.
    let v = if v.is_nan() { canonical_f64(v) } else { v };
    v.to_le_bytes()
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn str(&mut self, field: &'static str) -> Result<Arc<str>, DecodeError> {
        let len = usize::from(self.u16()?);
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8(field))?;
        Ok(Arc::from(s))
    }
}
