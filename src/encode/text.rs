use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};

use super::EncodeError;
use crate::aggregate::snapshot::WindowSnapshot;
use crate::aggregate::stats::MetricStats;
use crate::source::event::canonical_f64;

/// JSON view of a sealed window, used by the text encoding and the query API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotJson {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence_id: Option<u64>,
    pub window_start: String,
    pub window_start_ns: u64,
    pub window_duration_ns: u64,
    pub metrics: Vec<MetricJson>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricJson {
    pub name: String,
    pub category: String,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

impl MetricJson {
    fn new(name: &str, category: &str, stats: &MetricStats) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            count: stats.count,
            sum: canonical_f64(stats.sum),
            min: canonical_f64(stats.min),
            max: canonical_f64(stats.max),
            mean: canonical_f64(stats.mean()),
            p50: canonical_f64(stats.percentile(0.50)),
            p90: canonical_f64(stats.percentile(0.90)),
            p99: canonical_f64(stats.percentile(0.99)),
        }
    }
}

impl SnapshotJson {
    /// Builds the JSON view; metrics keep the snapshot's key order.
    pub fn from_snapshot(snapshot: &WindowSnapshot, sequence_id: Option<u64>) -> Self {
        Self {
            sequence_id,
            window_start: rfc3339(snapshot.window_start_ns),
            window_start_ns: snapshot.window_start_ns,
            window_duration_ns: snapshot.window_duration_ns,
            metrics: snapshot
                .metrics
                .iter()
                .map(|(k, v)| MetricJson::new(&k.name, &k.category, v))
                .collect(),
        }
    }
}

/// Encodes a window as one compact JSON line.
pub fn encode_text(snapshot: &WindowSnapshot, sequence_id: u64) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(&SnapshotJson::from_snapshot(
        snapshot,
        Some(sequence_id),
    ))?)
}

fn rfc3339(ns: u64) -> String {
    DateTime::from_timestamp_nanos(i64::try_from(ns).unwrap_or(i64::MAX))
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
