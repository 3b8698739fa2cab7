//! Main axum router and HTTP request handlers for the binary-cache proxy.
//!
//! Routes:
//! - `GET /nix-cache-info`       - Fixed binary-cache descriptor
//! - `GET /{hash}.narinfo`       - Metadata document (cached or fetched)
//! - `GET /nar/{hash}.nar[.ext]` - Archive payload (cached or fetched)
//! - `GET /lock`                 - Administrative freeze (only when enabled)
//!
//! Everything else, including non-`GET` methods and keys that no upstream
//! has, gets the fixed 404 body existing clients expect.

use std::path::Path as FsPath;
use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    Router,
    body::Body,
    extract::{Path, Request, State, rejection::PathRejection},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::AppState;
use crate::cache::{Category, ContentHash, FetchError};
use crate::metrics::MetricsRegistry;

/// Body of every 404 response.
pub const NOT_FOUND_BODY: &str =
    "\n<script>window.location.href = \"https://www.youtube.com/watch?v=dQw4w9WgXcQ\"</script>\n";

/// Body of `GET /nix-cache-info`.
pub const CACHE_INFO_BODY: &str = "StoreDir: /nix/store\nWantMassQuery: 1\nPriority: 1\n";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] for the cache listener.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route(
            "/nix-cache-info",
            get(handle_cache_info).fallback(handle_not_found),
        )
        .route("/nar/{file}", get(handle_nar).fallback(handle_not_found))
        .route("/{file}", get(handle_narinfo).fallback(handle_not_found));

    if state.config.enable_lock_route {
        router = router.route(
            "/lock",
            get(super::lock::handle_lock).fallback(handle_not_found),
        );
    }

    router
        .fallback(handle_not_found)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Build the router for the dedicated metrics listener.
pub fn create_metrics_router(metrics: MetricsRegistry) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(metrics)
}

async fn log_request(req: Request, next: Next) -> Response {
    info!(method = %req.method(), path = %req.uri().path(), "request");
    next.run(req).await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /nix-cache-info`
async fn handle_cache_info() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/x-nix-cache-info")],
        CACHE_INFO_BODY,
    )
        .into_response()
}

/// `GET /{hash}.narinfo`
async fn handle_narinfo(
    State(state): State<Arc<AppState>>,
    file: Result<Path<String>, PathRejection>,
) -> Result<Response, AppError> {
    match file.ok().and_then(|Path(f)| ContentHash::parse_narinfo(&f)) {
        Some(hash) => serve_entry(&state, hash).await,
        None => Ok(not_found()),
    }
}

/// `GET /nar/{hash}.nar[.ext]`
async fn handle_nar(
    State(state): State<Arc<AppState>>,
    file: Result<Path<String>, PathRejection>,
) -> Result<Response, AppError> {
    match file.ok().and_then(|Path(f)| ContentHash::parse_nar(&f)) {
        Some(hash) => serve_entry(&state, hash).await,
        None => Ok(not_found()),
    }
}

async fn handle_not_found() -> Response {
    not_found()
}

/// `GET /metrics` on the metrics listener.
async fn handle_metrics(State(metrics): State<MetricsRegistry>) -> Result<Response, AppError> {
    let buf = metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

pub fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        NOT_FOUND_BODY,
    )
        .into_response()
}

/// Ensure `hash` is cached and stream it back, or answer 404.
async fn serve_entry(state: &AppState, hash: ContentHash) -> Result<Response, AppError> {
    match state.cache.ensure(&hash).await? {
        Some(path) => serve_local_file(&path, hash.category()).await,
        None => Ok(not_found()),
    }
}

/// Stream a published store entry from local disk.
async fn serve_local_file(path: &FsPath, category: Category) -> Result<Response, AppError> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open cached entry: {}", path.display()))?;
    let len = file
        .metadata()
        .await
        .with_context(|| format!("stat cached entry: {}", path.display()))?
        .len();

    let body = Body::from_stream(ReaderStream::new(file));

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static(category.content_type()),
            ),
            (header::CONTENT_LENGTH, HeaderValue::from(len)),
        ],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// A fetch or local read failed.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error\n").into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<FetchError> for AppError {
    fn from(err: FetchError) -> Self {
        AppError::Internal(err.into())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
