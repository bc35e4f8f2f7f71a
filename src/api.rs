//! HTTP Status API
//!
//! Read-only endpoints for a running generator or replay:
//! - `GET /health`
//! - `GET /metrics`          Prometheus text exposition
//! - `GET /buffers`          per-pool buffer occupancy
//! - `GET /replay/progress`  replay cursor

use crate::metrics;
use crate::pool::{BufferProbe, BufferStats};
use crate::replay::{ReplayEngine, ReplayProgress};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone, Default)]
pub struct ApiState {
    pub buffers: Vec<BufferProbe>,
    pub replay: Option<Arc<ReplayEngine>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedBufferStats {
    pub source: String,
    #[serde(flatten)]
    pub stats: BufferStats,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/buffers", get(buffers_handler))
        .route("/replay/progress", get(replay_progress_handler))
        .with_state(state)
}

/// Serve the status API until `shutdown` fires
pub async fn serve(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Status API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler() -> String {
    metrics::render()
}

async fn buffers_handler(State(state): State<ApiState>) -> Json<Vec<NamedBufferStats>> {
    Json(
        state
            .buffers
            .iter()
            .map(|probe| NamedBufferStats {
                source: probe.name().to_string(),
                stats: probe.stats(),
            })
            .collect(),
    )
}

async fn replay_progress_handler(
    State(state): State<ApiState>,
) -> Result<Json<ReplayProgress>, StatusCode> {
    state
        .replay
        .as_ref()
        .map(|engine| Json(engine.progress()))
        .ok_or(StatusCode::NOT_FOUND)
}
