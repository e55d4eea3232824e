use std::io::Write;

use anyhow::{Context, Result};

use super::transport::{Transport, TransportError, UploadRequest};
use crate::config::UploadConfig;
use crate::encode::EncodingKind;

/// POSTs upload requests to an HTTP collector.
pub struct HttpTransport {
    client: reqwest::Client,
    address: String,
    producer_id: String,
    token: Option<String>,
    headers: Vec<(String, String)>,
    compression: BodyCompression,
}

impl HttpTransport {
    pub fn new(cfg: &UploadConfig, producer_id: &str) -> Result<Self> {
        let mut client_builder = reqwest::Client::builder().timeout(cfg.timeout);

        if !cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        let client = client_builder.build().context("building HTTP client")?;
        let compression = BodyCompression::parse(&cfg.compression)?;

        let mut headers: Vec<(String, String)> = cfg
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();

        Ok(Self {
            client,
            address: cfg.address.clone(),
            producer_id: producer_id.to_string(),
            token: cfg.token.clone(),
            headers,
            compression,
        })
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: &UploadRequest) -> Result<(), TransportError> {
        let kind = request
            .batches
            .first()
            .map_or(EncodingKind::Binary, |b| b.kind);

        let body = build_body(request, kind);
        let raw_len = body.len();
        let compressed = self
            .compression
            .compress(body)
            .map_err(|e| TransportError::Body(format!("{e:#}")))?;

        let mut req = self
            .client
            .post(&self.address)
            .header("Content-Type", kind.content_type())
            .header("X-Sequence-First", request.first_sequence().to_string())
            .header("X-Sequence-Last", request.last_sequence().to_string())
            .header("X-Producer-Id", self.producer_id.as_str())
            .body(compressed);

        if let Some(encoding) = self.compression.content_encoding() {
            req = req.header("Content-Encoding", encoding);
        }

        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        tracing::debug!(
            batches = request.len(),
            first_sequence = request.first_sequence(),
            bytes = raw_len,
            "uploaded request",
        );

        Ok(())
    }
}

/// Concatenates the request's windows into one body.
///
/// Binary envelopes are each prefixed with their `u32` LE length; text
/// windows become NDJSON lines.
pub fn build_body(request: &UploadRequest, kind: EncodingKind) -> Vec<u8> {
    let payload_len: usize = request.batches.iter().map(|b| b.payload.len() + 4).sum();
    let mut buf = Vec::with_capacity(payload_len);

    for batch in &request.batches {
        match kind {
            EncodingKind::Binary => {
                let len = u32::try_from(batch.payload.len()).unwrap_or(u32::MAX);
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(&batch.payload);
            }
            EncodingKind::Text => {
                buf.extend_from_slice(&batch.payload);
                buf.push(b'\n');
            }
        }
    }

    buf
}

/// Splits a length-framed binary body back into envelopes.
pub fn split_frames(mut body: &[u8]) -> Option<Vec<&[u8]>> {
    let mut frames = Vec::new();
    while !body.is_empty() {
        let len_bytes: [u8; 4] = body.get(..4)?.try_into().ok()?;
        let len = usize::try_from(u32::from_le_bytes(len_bytes)).ok()?;
        let frame = body.get(4..4 + len)?;
        frames.push(frame);
        body = &body[4 + len..];
    }
    Some(frames)
}

// --- Compression ---

/// Body compression applied after framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyCompression {
    None,
    Gzip,
    Zstd,
    Zlib,
    Snappy,
}

impl BodyCompression {
    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "none" | "" => Self::None,
            "gzip" => Self::Gzip,
            "zstd" => Self::Zstd,
            "zlib" => Self::Zlib,
            "snappy" => Self::Snappy,
            other => anyhow::bail!("unsupported compression: {other}"),
        })
    }

    /// Value for the Content-Encoding header, if any.
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
            Self::Zlib => Some("deflate"),
            Self::Snappy => Some("snappy"),
        }
    }

    pub fn compress(self, body: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(body),
            Self::Gzip => {
                let mut out = flate2::write::GzEncoder::new(
                    Vec::with_capacity(body.len() / 2),
                    flate2::Compression::default(),
                );
                out.write_all(&body).context("gzip write")?;
                out.finish().context("gzip finish")
            }
            Self::Zlib => {
                let mut out = flate2::write::ZlibEncoder::new(
                    Vec::with_capacity(body.len() / 2),
                    flate2::Compression::default(),
                );
                out.write_all(&body).context("zlib write")?;
                out.finish().context("zlib finish")
            }
            Self::Zstd => zstd::encode_all(body.as_slice(), 0).context("zstd encode"),
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(&body)
                .context("snappy encode"),
        }
    }
}
