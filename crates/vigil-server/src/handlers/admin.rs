//! Admin configuration: external Alertmanagers of an organisation.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use tracing::info;
use vigil_notify::distributor::{AdminConfiguration, RemoteState};

use super::MessageResponse;
use super::prometheus::PrometheusResponse;
use crate::auth::{Action, Scope, User};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// An external Alertmanager in discovery responses.
#[derive(Debug, Clone, Serialize)]
pub struct AlertmanagerUrl {
    /// Base URL, password redacted.
    pub url: String,
}

/// Payload of `GET /api/v1/ngalert/alertmanagers`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagersDiscovery {
    /// Alertmanagers whose last sync succeeded.
    pub active_alert_managers: Vec<AlertmanagerUrl>,
    /// Alertmanagers not synced yet or failing.
    pub dropped_alert_managers: Vec<AlertmanagerUrl>,
}

/// `GET /api/v1/ngalert/admin_config`
pub async fn get_admin_config(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<AdminConfiguration>> {
    state.authorize(&user, Action::AdminConfig, Scope::Global)?;
    state
        .notify()
        .admin()
        .get(user.org_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no admin configuration available".to_string()))
}

/// `POST /api/v1/ngalert/admin_config`
pub async fn post_admin_config(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(mut config): Json<AdminConfiguration>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    state.authorize(&user, Action::AdminConfig, Scope::Global)?;
    config.org_id = user.org_id;
    let count = config.alertmanagers.len();
    state.notify().admin().set(config)?;
    info!(org_id = user.org_id, user = %user.login, alertmanagers = count, "admin configuration updated");
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new("admin configuration updated")),
    ))
}

/// `DELETE /api/v1/ngalert/admin_config`
pub async fn delete_admin_config(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<MessageResponse>> {
    state.authorize(&user, Action::AdminConfig, Scope::Global)?;
    if !state.notify().admin().delete(user.org_id) {
        return Err(ApiError::NotFound("no admin configuration available".to_string()));
    }
    info!(org_id = user.org_id, user = %user.login, "admin configuration deleted");
    Ok(Json(MessageResponse::new("admin configuration deleted")))
}

/// `GET /api/v1/ngalert/alertmanagers`
pub async fn alertmanagers(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<PrometheusResponse<AlertmanagersDiscovery>>> {
    state.authorize(&user, Action::AdminConfig, Scope::Global)?;
    let mut discovery = AlertmanagersDiscovery::default();
    for remote in state.notify().distributor().alertmanagers(user.org_id) {
        let entry = AlertmanagerUrl { url: remote.url };
        match remote.state {
            RemoteState::Active => discovery.active_alert_managers.push(entry),
            RemoteState::Dropped => discovery.dropped_alert_managers.push(entry),
        }
    }
    Ok(Json(PrometheusResponse::success(discovery)))
}
