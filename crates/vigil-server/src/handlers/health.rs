//! Health and metrics endpoints. Neither requires a user.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use serde::Serialize;
use vigil_alerts::Role;

use crate::state::AppState;

/// Content type of the OpenMetrics text format.
const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Health of this replica.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `ok` when the server answers.
    pub status: &'static str,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// This replica's peer name.
    pub peer: String,
    /// Role in the cluster.
    pub role: Role,
    /// Position among live peers, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Number of live peers.
    pub peers: usize,
    /// True if the scheduler is evaluating rules.
    pub evaluating: bool,
}

/// `GET /api/health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let coordinator = state.coordinator();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        peer: state.config().ha.peer_name.clone(),
        role: coordinator.role(),
        position: coordinator.position(),
        peers: coordinator.peers().len(),
        evaluating: state.scheduler().is_evaluating(),
    })
}

/// `GET /metrics`
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
        state.metrics().encode(),
    )
}
