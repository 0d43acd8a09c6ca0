//! Silence API.
//!
//! A silence with an `__alert_rule_uid__` equality matcher belongs to the
//! folder of that rule and is checked against folder permissions; any other
//! silence uses the organisation-wide silence permissions.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Serialize;
use tracing::info;
use vigil_alerts::Matchers;
use vigil_notify::silence::rule_scope;
use vigil_notify::{GettableSilence, PostableSilence};

use super::MessageResponse;
use super::alertmanager::filter_matchers;
use crate::auth::{Action, Scope, User};
use crate::error::ApiResult;
use crate::state::AppState;

/// Response of a silence create or update.
#[derive(Debug, Clone, Serialize)]
pub struct SilenceCreated {
    /// ID of the stored silence.
    #[serde(rename = "silenceID")]
    pub silence_id: String,
}

/// Folder a set of silence matchers is scoped to.
async fn silence_folder(state: &AppState, org_id: i64, matchers: &Matchers) -> ApiResult<Option<String>> {
    match rule_scope(matchers) {
        Some(uid) => state.rule_folder(org_id, uid).await,
        None => Ok(None),
    }
}

async fn authorize_silence(
    state: &AppState,
    user: &User,
    action: Action,
    matchers: &Matchers,
) -> ApiResult<()> {
    state.authorize(user, action, Scope::Global)?;
    if let Some(folder) = silence_folder(state, user.org_id, matchers).await? {
        state.authorize(user, action, Scope::Folder(&folder))?;
    }
    Ok(())
}

/// `POST /api/alertmanager/api/v2/silences`
pub async fn post_silence(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(mut silence): Json<PostableSilence>,
) -> ApiResult<(StatusCode, Json<SilenceCreated>)> {
    authorize_silence(&state, &user, Action::SilencesWrite, &silence.matchers).await?;
    let am = state.alertmanager(&user)?;
    if let Some(id) = silence.id.as_deref().filter(|id| !id.is_empty()) {
        let current = am.silences().get(id)?;
        authorize_silence(&state, &user, Action::SilencesWrite, &current.silence.matchers).await?;
    }
    if silence.created_by.is_empty() {
        silence.created_by.clone_from(&user.login);
    }

    let silence_id = am.silences().upsert(silence)?;
    Ok((StatusCode::ACCEPTED, Json(SilenceCreated { silence_id })))
}

/// `GET /api/alertmanager/api/v2/silences`
pub async fn list_silences(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<Json<Vec<GettableSilence>>> {
    state.authorize(&user, Action::SilencesRead, Scope::Global)?;
    let filter = filter_matchers(&params)?;
    let am = state.alertmanager(&user)?;

    let mut visible = Vec::new();
    for silence in am.silences().list(&filter) {
        let allowed = match silence_folder(&state, user.org_id, &silence.silence.matchers).await? {
            Some(folder) => state
                .access()
                .allowed(&user, Action::SilencesRead, Scope::Folder(&folder)),
            None => true,
        };
        if allowed {
            visible.push(silence);
        }
    }
    Ok(Json(visible))
}

/// `GET /api/alertmanager/api/v2/silence/{id}`
pub async fn get_silence(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> ApiResult<Json<GettableSilence>> {
    state.authorize(&user, Action::SilencesRead, Scope::Global)?;
    let silence = state.alertmanager(&user)?.silences().get(&id)?;
    authorize_silence(&state, &user, Action::SilencesRead, &silence.silence.matchers).await?;
    Ok(Json(silence))
}

/// `DELETE /api/alertmanager/api/v2/silence/{id}`
pub async fn delete_silence(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    state.authorize(&user, Action::SilencesWrite, Scope::Global)?;
    let am = state.alertmanager(&user)?;
    let silence = am.silences().get(&id)?;
    authorize_silence(&state, &user, Action::SilencesWrite, &silence.silence.matchers).await?;
    am.silences().expire(&id)?;
    info!(org_id = user.org_id, user = %user.login, silence_id = %id, "silence expired");
    Ok(Json(MessageResponse::new("silence deleted")))
}
