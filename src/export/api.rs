use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::health::PipelineMetrics;
use crate::encode::text::SnapshotJson;
use crate::source::filter::{EventFilter, NameFilter};
use crate::store::budget::BudgetTable;
use crate::store::SnapshotStore;

/// HTTP server exposing Prometheus metrics and the viewer query API.
pub struct ApiServer {
    addr: String,
    state: Arc<AppState>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

/// Shared state for axum handlers.
struct AppState {
    store: Arc<SnapshotStore>,
    metrics: Arc<PipelineMetrics>,
    budgets: Arc<BudgetTable>,
}

impl ApiServer {
    pub fn new(
        addr: &str,
        store: Arc<SnapshotStore>,
        metrics: Arc<PipelineMetrics>,
        budgets: Arc<BudgetTable>,
    ) -> Self {
        Self {
            addr: addr.to_string(),
            state: Arc::new(AppState {
                store,
                metrics,
                budgets,
            }),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/api/v1/query", get(query_handler))
            .route("/api/v1/counters", get(counters_handler))
            .route("/api/v1/budgets", get(budgets_handler))
            .with_state(Arc::clone(&self.state))
    }

    /// Binds the listener and serves in the background, returning the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let app = self.router();
        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "api server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "api server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// Query parameters for /api/v1/query.
#[derive(Debug, Default, Deserialize)]
struct QueryParams {
    from_ns: Option<u64>,
    to_ns: Option<u64>,
    name: Option<String>,
    name_prefix: Option<String>,
    category: Option<String>,
}

impl QueryParams {
    fn filter(&self) -> EventFilter {
        let names = match (&self.name, &self.name_prefix) {
            (Some(name), _) => NameFilter::Equal(name.clone()),
            (None, Some(prefix)) => NameFilter::StartsWith(prefix.clone()),
            (None, None) => NameFilter::Any,
        };
        EventFilter::new(names, self.category.clone().map(|c| vec![c]))
    }
}

/// GET /api/v1/query - stored windows in `[from_ns, to_ns)`.
async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Vec<SnapshotJson>> {
    let range = params.from_ns.unwrap_or(0)..params.to_ns.unwrap_or(u64::MAX);
    let result = state.store.query(range, Some(params.filter()));
    Json(
        result
            .iter()
            .map(|w| SnapshotJson::from_snapshot(&w, None))
            .collect(),
    )
}

/// GET /api/v1/counters - drop and overflow counters.
async fn counters_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// GET /api/v1/budgets - budget report for the latest window.
async fn budgets_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let reports = state
        .store
        .latest()
        .map(|w| state.budgets.evaluate(&w))
        .unwrap_or_default();
    Json(reports)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::aggregate::snapshot::{MetricKey, WindowSnapshot};
    use crate::aggregate::stats::MetricStats;

    fn server() -> (ApiServer, Arc<SnapshotStore>, Arc<PipelineMetrics>) {
        let store = Arc::new(SnapshotStore::new(8));
        let metrics = Arc::new(PipelineMetrics::new().expect("metrics"));
        let budgets = Arc::new(BudgetTable::new([("frame_time", 10.0)]));
        let server = ApiServer::new(
            "127.0.0.1:0",
            Arc::clone(&store),
            Arc::clone(&metrics),
            budgets,
        );
        (server, store, metrics)
    }

    fn window(start: u64) -> Arc<WindowSnapshot> {
        let mut snap = WindowSnapshot::new(start, 1_000);
        snap.metrics
            .insert(MetricKey::new("frame_time", "render"), MetricStats::from_sample(16.6));
        snap.metrics
            .insert(MetricKey::new("gc_pause", "memory"), MetricStats::from_sample(1.0));
        Arc::new(snap)
    }

    /// Minimal HTTP/1.0 GET returning the response body.
    async fn get_body(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.0\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write");

        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        assert!(response.starts_with("HTTP/1.0 200") || response.starts_with("HTTP/1.1 200"));
        response
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default()
    }

    #[test]
    fn test_query_params_filter() {
        let params = QueryParams {
            name_prefix: Some("frame".to_string()),
            category: Some("render".to_string()),
            ..Default::default()
        };
        let filter = params.filter();
        assert!(filter.matches("frame_time", "render"));
        assert!(!filter.matches("frame_time", "audio"));
        assert!(!filter.matches("gc_pause", "render"));

        assert!(QueryParams::default().filter().is_accept_all());
    }

    #[tokio::test]
    async fn test_endpoints() {
        let (server, store, metrics) = server();
        store.record(window(0));
        store.record(window(1_000));
        store.record(window(2_000));
        metrics.ingest_drops.inc_by(4);

        let addr = server.start().await.expect("start");

        assert_eq!(get_body(addr, "/healthz").await, "ok");

        let body = get_body(addr, "/api/v1/query?from_ns=1000&name=frame_time").await;
        let windows: Vec<SnapshotJson> = serde_json::from_str(&body).expect("json");
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].window_start_ns, 1_000);
        assert_eq!(windows[0].metrics.len(), 1);
        assert_eq!(windows[0].metrics[0].name, "frame_time");

        let body = get_body(addr, "/api/v1/counters").await;
        let counters: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(counters["ingest_drops"], 4);

        let body = get_body(addr, "/api/v1/budgets").await;
        let budgets: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(budgets[0]["name"], "frame_time");
        assert_eq!(budgets[0]["exceeded"], true);

        let body = get_body(addr, "/metrics").await;
        assert!(body.contains("perfcollector_ingest_drops_total 4"));

        server.stop();
    }
}
