//! Mirror HTTP surface: routes, access log, artifact handler.
//!
//! Routes:
//!   GET /                   landing page
//!   GET /{file}             artifact
//!   GET /zig/{file}         artifact
//!   GET /builds/{file}      artifact
//!   GET /download/{*path}   artifact (only the last segment is used)
//!
//! Path parameters are percent-decoded before validation, so nightly names
//! may arrive with `+` spelled as `%2B`.

use axum::{
    body::Body,
    extract::{rejection::PathRejection, ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tower::ServiceExt;
use tower_http::{limit::RequestBodyLimitLayer, services::ServeFile};
use tracing::{info, warn};
use zmirror_cache::{ArtifactCache, ArtifactId, CacheOutcome, FetchError, FetchErrorKind, InvalidFilename};

use crate::metrics::MirrorMetrics;

const INDEX_HTML: &str = include_str!("../templates/index.html");

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ArtifactCache>,
    pub metrics: MirrorMetrics,
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/{file}", get(artifact_handler))
        .route("/zig/{file}", get(artifact_handler))
        .route("/builds/{file}", get(artifact_handler))
        .route("/download/{*path}", get(artifact_handler))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(middleware::from_fn(access_log))
}

// ── Errors ─────────────────────────────────────────────────────────────────────

/// Everything the artifact handler can fail with, mapped onto a status code
/// and a short text body.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    InvalidFilename(#[from] InvalidFilename),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidFilename(_) => StatusCode::BAD_REQUEST,
            AppError::Fetch(e) => match e.kind() {
                FetchErrorKind::NotFound => StatusCode::NOT_FOUND,
                FetchErrorKind::Unavailable => StatusCode::BAD_GATEWAY,
                FetchErrorKind::LocalIo => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AppError::InvalidFilename(_) => "invalid",
            AppError::Fetch(e) => e.kind().as_str(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            AppError::InvalidFilename(_) => "Invalid filename format",
            AppError::Fetch(_) => status.canonical_reason().unwrap_or("Error"),
        };
        (status, body).into_response()
    }
}

// ── Handlers ───────────────────────────────────────────────────────────────────

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn artifact_handler(
    State(state): State<AppState>,
    param: Result<Path<String>, PathRejection>,
    req: Request,
) -> Response {
    let path = req.uri().path().to_string();
    let source = source_param(req.uri().query()).unwrap_or_default();

    let decoded = match param {
        Ok(Path(decoded)) => decoded,
        Err(e) => {
            warn!(path = %path, source = %source, "undecodable path: {e}");
            return fail(&state, InvalidFilename(path).into());
        }
    };
    let filename = decoded.rsplit('/').next().unwrap_or_default();

    let id = match ArtifactId::parse(filename) {
        Ok(id) => id,
        Err(e) => {
            warn!(path = %path, filename, source = %source, "invalid filename format");
            return fail(&state, e.into());
        }
    };

    match state.cache.ensure_cached(&id).await {
        Ok(outcome) => {
            state.metrics.record_request(outcome.as_str());
            if let CacheOutcome::Fetched { bytes, elapsed } = outcome {
                state.metrics.record_fetch(bytes, elapsed);
            }
        }
        Err(e) => return fail(&state, e.into()),
    }

    info!(filename = %id, source = %source, "serving file from cache");
    serve_file(state.cache.path_for(&id), req).await
}

fn fail(state: &AppState, err: AppError) -> Response {
    state.metrics.record_request(err.label());
    err.into_response()
}

/// Stream a published entry. Range, conditional and HEAD requests are
/// answered by `ServeFile`.
async fn serve_file(path: PathBuf, req: Request) -> Response {
    match ServeFile::new(path).oneshot(req).await {
        Ok(resp) => {
            let mut resp = resp.map(Body::new);
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            resp
        }
        Err(never) => match never {},
    }
}

/// Optional `?source=` tag clients use to identify themselves.
fn source_param(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "source")
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

// ── Middleware ─────────────────────────────────────────────────────────────────

/// One log line per request.
async fn access_log(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let remote_ip = remote_ip(req.headers(), peer);
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let resp = next.run(req).await;

    info!(
        remote_ip = %remote_ip,
        method = %method,
        path = %path,
        status = resp.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        user_agent = %user_agent,
        "request handled"
    );
    resp
}

/// Client address: first `X-Forwarded-For` entry when behind a proxy,
/// otherwise the TCP peer.
pub fn remote_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(first) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
