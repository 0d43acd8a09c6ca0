//! Alertmanager configuration and runtime API of the caller's organisation.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::info;
use vigil_alerts::{Matchers, PostableAlert};
use vigil_notify::config_store::DEFAULT_HISTORY_LIMIT;
use vigil_notify::{
    AlertGroup, AlertmanagerConfig, AlertmanagerStatus, GettableAlert, HistoryEntry,
};

use super::MessageResponse;
use crate::auth::{Action, Scope, User};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Parses repeated `filter` query parameters into matchers.
pub(crate) fn filter_matchers(params: &[(String, String)]) -> ApiResult<Matchers> {
    let filters: Vec<&str> = params
        .iter()
        .filter(|(k, _)| k == "filter")
        .map(|(_, v)| v.as_str())
        .collect();
    Ok(Matchers::parse(&filters)?)
}

// ============ Configuration ============

/// `GET /api/alertmanager/config/api/v1/alerts`
pub async fn get_config(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<AlertmanagerConfig>> {
    state.authorize(&user, Action::NotificationsRead, Scope::Global)?;
    state.alertmanager(&user)?;
    let config = state
        .notify()
        .configs()
        .redacted(user.org_id)
        .ok_or_else(|| ApiError::NotFound("alertmanager configuration not found".to_string()))?;
    Ok(Json(config))
}

/// `POST /api/alertmanager/config/api/v1/alerts`
pub async fn post_config(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(config): Json<AlertmanagerConfig>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    state.authorize(&user, Action::NotificationsWrite, Scope::Global)?;
    let outcome = state.notify().apply_config(user.org_id, config)?;
    info!(org_id = user.org_id, user = %user.login, id = outcome.id, changed = outcome.changed, "alertmanager configuration posted");
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("configuration created")),
    ))
}

/// `DELETE /api/alertmanager/config/api/v1/alerts`
pub async fn delete_config(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    state.authorize(&user, Action::NotificationsWrite, Scope::Global)?;
    state.notify().reset(user.org_id)?;
    info!(org_id = user.org_id, user = %user.login, "alertmanager configuration reset");
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("configuration deleted; the default is applied")),
    ))
}

/// Query parameters of the history endpoint.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Maximum number of entries.
    pub limit: Option<usize>,
}

/// `GET /api/alertmanager/config/history`
pub async fn history(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<HistoryEntry>>> {
    state.authorize(&user, Action::NotificationsRead, Scope::Global)?;
    let limit = query
        .limit
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.notify().configs().history(user.org_id, limit)))
}

/// `POST /api/alertmanager/config/history/{id}/_activate`
pub async fn activate(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<u64>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    state.authorize(&user, Action::NotificationsWrite, Scope::Global)?;
    state.notify().activate(user.org_id, id)?;
    info!(org_id = user.org_id, user = %user.login, id, "alertmanager configuration activated");
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("configuration activated")),
    ))
}

// ============ Runtime ============

/// `GET /api/alertmanager/api/v2/alerts`
pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<Json<Vec<GettableAlert>>> {
    state.authorize(&user, Action::AlertsRead, Scope::Global)?;
    let matchers = filter_matchers(&params)?;
    Ok(Json(state.alertmanager(&user)?.alerts(&matchers)))
}

/// `POST /api/alertmanager/api/v2/alerts`
pub async fn post_alerts(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(alerts): Json<Vec<PostableAlert>>,
) -> ApiResult<StatusCode> {
    state.authorize(&user, Action::AlertsWrite, Scope::Global)?;
    state.notify().put_alerts(user.org_id, alerts)?;
    Ok(StatusCode::OK)
}

/// `GET /api/alertmanager/api/v2/alerts/groups`
pub async fn alert_groups(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<Vec<AlertGroup>>> {
    state.authorize(&user, Action::AlertsRead, Scope::Global)?;
    Ok(Json(state.alertmanager(&user)?.alert_groups()))
}

/// `GET /api/alertmanager/api/v2/status`
pub async fn status(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<AlertmanagerStatus>> {
    state.authorize(&user, Action::AlertsRead, Scope::Global)?;
    Ok(Json(state.alertmanager(&user)?.status()))
}
