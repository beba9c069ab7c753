//! Operational HTTP surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/metrics` | Prometheus text exposition |
//! | `GET`  | `/healthz` | `200 ok` when every source and adapter is up, else `503` |
//! | `POST` | `/-/reload` | Cancels the running service; the supervisor restarts it |
//!
//! The server stops accepting connections once the shutdown token is
//! cancelled and finishes in-flight requests before returning.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::metrics::Metrics;
use crate::status::StatusAggregator;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub status: Arc<StatusAggregator>,
    pub metrics: Arc<Metrics>,
    /// Cancelled by `POST /-/reload`.
    pub reload: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .route("/healthz", get(handle_health))
        .route("/-/reload", post(handle_reload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves on `listener` until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("http server stopped");
    Ok(())
}

// ============ GET /metrics ============

async fn handle_metrics(State(state): State<AppState>) -> Response {
    state.metrics.refresh(&state.status);
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

// ============ GET /healthz ============

async fn handle_health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.status.is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}

// ============ POST /-/reload ============

async fn handle_reload(State(state): State<AppState>) -> StatusCode {
    warn!("reload requested, shutting down");
    state.reload.cancel();
    StatusCode::OK
}
