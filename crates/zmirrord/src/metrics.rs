//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  OpenMetrics text exposition
//!   GET /healthz  Liveness probe (always 200 if process is running)
//!   GET /readyz   Readiness probe (200 if the cache directory is usable)

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::Registry,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

type Labels = Vec<(String, String)>;

/// Counters updated by the artifact handler.
#[derive(Clone)]
pub struct MirrorMetrics {
    requests: Family<Labels, Counter>,
    fetch_seconds: Histogram,
    upstream_bytes: Counter,
}

impl MirrorMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let requests = Family::default();
        let fetch_seconds = Histogram::new([0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0]);
        let upstream_bytes = Counter::default();

        registry.register(
            "zmirror_requests",
            "Artifact requests by outcome",
            requests.clone(),
        );
        registry.register(
            "zmirror_upstream_fetch_seconds",
            "Duration of successful upstream downloads in seconds",
            fetch_seconds.clone(),
        );
        registry.register(
            "zmirror_upstream_bytes",
            "Bytes downloaded from upstream and published to the cache",
            upstream_bytes.clone(),
        );

        MirrorMetrics {
            requests,
            fetch_seconds,
            upstream_bytes,
        }
    }

    /// Count one artifact request. `outcome` is a cache outcome or error
    /// label (hit, coalesced, fetched, invalid, not_found, unavailable, local_io).
    pub fn record_request(&self, outcome: &str) {
        self.requests
            .get_or_create(&vec![("outcome".to_string(), outcome.to_string())])
            .inc();
    }

    pub fn record_fetch(&self, bytes: u64, elapsed: Duration) {
        self.upstream_bytes.inc_by(bytes);
        self.fetch_seconds.observe(elapsed.as_secs_f64());
    }
}

/// Shared state for the metrics and health endpoints
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub cache_dir: PathBuf,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9100")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("metrics bind {addr}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, router(state))
        .await
        .context("metrics server")
}

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

async fn metrics_handler(State(state): State<HealthState>) -> Response {
    let mut body = String::new();
    if let Err(e) = encode(&mut body, &state.registry) {
        tracing::error!("metrics encode failed: {e}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response()
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Readiness probe: returns 200 if the cache directory exists, 503 otherwise.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match tokio::fs::metadata(&state.cache_dir).await {
        Ok(meta) if meta.is_dir() => (StatusCode::OK, "ready"),
        Ok(_) => (StatusCode::SERVICE_UNAVAILABLE, "cache path is not a directory"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "cache directory missing"),
    }
}
