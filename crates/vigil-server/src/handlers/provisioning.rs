//! Provisioning API for notification policies, contact points, templates
//! and mute timings.
//!
//! Every write loads the organisation's configuration, changes one part of
//! it and saves it through the same validation as a full configuration
//! post; nothing is stored if the result is invalid.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::info;
use vigil_notify::config::ReceiverConfig;
use vigil_notify::{AlertmanagerConfig, IntegrationConfig, MuteTiming, RouteConfig};

use super::MessageResponse;
use crate::auth::{Action, Scope, User};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// ============ Shared ============

fn read_config(state: &AppState, user: &User) -> ApiResult<AlertmanagerConfig> {
    state.authorize(user, Action::ProvisioningRead, Scope::Global)?;
    state.alertmanager(user)?;
    state
        .notify()
        .configs()
        .redacted(user.org_id)
        .ok_or_else(|| ApiError::Internal("alertmanager configuration missing".to_string()))
}

/// Loads the decrypted configuration, applies `change` and saves the result.
fn modify<T>(
    state: &AppState,
    user: &User,
    change: impl FnOnce(&mut AlertmanagerConfig) -> ApiResult<T>,
) -> ApiResult<T> {
    state.authorize(user, Action::ProvisioningWrite, Scope::Global)?;
    state.alertmanager(user)?;
    let mut config = state
        .notify()
        .configs()
        .decrypted(user.org_id)?
        .ok_or_else(|| ApiError::Internal("alertmanager configuration missing".to_string()))?;
    let out = change(&mut config)?;
    let outcome = state.notify().apply_config(user.org_id, config)?;
    info!(org_id = user.org_id, user = %user.login, id = outcome.id, changed = outcome.changed, "provisioned configuration saved");
    Ok(out)
}

// ============ Notification policies ============

/// `GET /api/v1/provisioning/policies`
pub async fn get_policies(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<RouteConfig>> {
    Ok(Json(read_config(&state, &user)?.alertmanager_config.route))
}

/// `PUT /api/v1/provisioning/policies`
pub async fn put_policies(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(route): Json<RouteConfig>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    modify(&state, &user, |config| {
        config.alertmanager_config.route = route;
        Ok(())
    })?;
    Ok((StatusCode::ACCEPTED, Json(MessageResponse::new("policies updated"))))
}

/// `DELETE /api/v1/provisioning/policies`
///
/// Replaces the tree with the default one, keeping the root receiver.
pub async fn reset_policies(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<(StatusCode, Json<RouteConfig>)> {
    let route = modify(&state, &user, |config| {
        let mut route = AlertmanagerConfig::default().alertmanager_config.route;
        route.receiver.clone_from(&config.alertmanager_config.route.receiver);
        config.alertmanager_config.route = route.clone();
        Ok(route)
    })?;
    Ok((StatusCode::ACCEPTED, Json(route)))
}

// ============ Contact points ============

/// One integration, named after its receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPoint {
    /// Integration UID; generated when empty.
    #[serde(default)]
    pub uid: String,
    /// Receiver the integration belongs to.
    pub name: String,
    /// Integration type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Plain settings.
    #[serde(default)]
    pub settings: serde_json::Value,
    /// Secret settings, write only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secure_settings: BTreeMap<String, String>,
    /// Which secure settings are set.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secure_fields: BTreeMap<String, bool>,
    /// Skip resolved-only notifications.
    #[serde(default)]
    pub disable_resolve_message: bool,
}

impl ContactPoint {
    fn from_integration(receiver: &str, integration: IntegrationConfig) -> Self {
        Self {
            uid: integration.uid,
            name: receiver.to_string(),
            kind: integration.kind,
            settings: integration.settings,
            secure_settings: BTreeMap::new(),
            secure_fields: integration.secure_fields,
            disable_resolve_message: integration.disable_resolve_message,
        }
    }

    fn into_integration(self) -> IntegrationConfig {
        let settings = if self.settings.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.settings
        };
        IntegrationConfig {
            uid: self.uid,
            name: self.name,
            kind: self.kind,
            settings,
            secure_settings: self.secure_settings,
            secure_fields: self.secure_fields,
            disable_resolve_message: self.disable_resolve_message,
        }
    }

    fn redacted(mut self) -> Self {
        for key in std::mem::take(&mut self.secure_settings).into_keys() {
            self.secure_fields.insert(key, true);
        }
        self
    }
}

/// Removes the integration with `uid`, returning its receiver name.
fn take_integration(config: &mut AlertmanagerConfig, uid: &str) -> Option<(String, IntegrationConfig)> {
    for receiver in &mut config.alertmanager_config.receivers {
        if let Some(pos) = receiver.integrations.iter().position(|i| i.uid == uid) {
            return Some((receiver.name.clone(), receiver.integrations.remove(pos)));
        }
    }
    None
}

/// Drops a receiver left without integrations, unless a route uses it.
fn prune_receiver(config: &mut AlertmanagerConfig, name: &str) -> ApiResult<()> {
    let empty = config
        .receiver(name)
        .is_some_and(|r| r.integrations.is_empty());
    if !empty {
        return Ok(());
    }
    if config.receiver_in_use(name) {
        return Err(ApiError::Conflict(format!(
            "contact point {name:?} is used by a notification policy"
        )));
    }
    config.alertmanager_config.receivers.retain(|r| r.name != name);
    Ok(())
}

fn add_integration(config: &mut AlertmanagerConfig, receiver: &str, integration: IntegrationConfig) {
    let receivers = &mut config.alertmanager_config.receivers;
    if let Some(existing) = receivers.iter_mut().find(|r| r.name == receiver) {
        existing.integrations.push(integration);
    } else {
        receivers.push(ReceiverConfig {
            name: receiver.to_string(),
            integrations: vec![integration],
        });
    }
}

fn check_contact_point(point: &ContactPoint) -> ApiResult<()> {
    if point.name.trim().is_empty() {
        return Err(ApiError::Validation("contact point name cannot be empty".to_string()));
    }
    if point.kind.trim().is_empty() {
        return Err(ApiError::Validation("contact point type cannot be empty".to_string()));
    }
    Ok(())
}

/// `GET /api/v1/provisioning/contact-points`
pub async fn list_contact_points(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<Vec<ContactPoint>>> {
    let config = read_config(&state, &user)?;
    let points = config
        .alertmanager_config
        .receivers
        .into_iter()
        .flat_map(|r| {
            let name = r.name;
            r.integrations
                .into_iter()
                .map(move |i| ContactPoint::from_integration(&name, i))
        })
        .collect();
    Ok(Json(points))
}

/// `POST /api/v1/provisioning/contact-points`
pub async fn create_contact_point(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(mut point): Json<ContactPoint>,
) -> ApiResult<(StatusCode, Json<ContactPoint>)> {
    check_contact_point(&point)?;
    if point.uid.is_empty() {
        point.uid = uuid::Uuid::new_v4().simple().to_string();
    }
    let created = point.clone();
    modify(&state, &user, |config| {
        if config.integrations().any(|i| i.uid == point.uid) {
            return Err(ApiError::Conflict(format!(
                "contact point with UID {:?} already exists",
                point.uid
            )));
        }
        let receiver = point.name.clone();
        add_integration(config, &receiver, point.into_integration());
        Ok(())
    })?;
    Ok((StatusCode::ACCEPTED, Json(created.redacted())))
}

/// `PUT /api/v1/provisioning/contact-points/{uid}`
pub async fn update_contact_point(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(uid): Path<String>,
    Json(mut point): Json<ContactPoint>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    check_contact_point(&point)?;
    point.uid.clone_from(&uid);
    modify(&state, &user, |config| {
        let (previous_receiver, _) = take_integration(config, &uid)
            .ok_or_else(|| ApiError::NotFound(format!("contact point not found: {uid}")))?;
        let receiver = point.name.clone();
        add_integration(config, &receiver, point.into_integration());
        prune_receiver(config, &previous_receiver)
    })?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("contactpoint updated")),
    ))
}

/// `DELETE /api/v1/provisioning/contact-points/{uid}`
pub async fn delete_contact_point(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(uid): Path<String>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    modify(&state, &user, |config| {
        let (receiver, _) = take_integration(config, &uid)
            .ok_or_else(|| ApiError::NotFound(format!("contact point not found: {uid}")))?;
        prune_receiver(config, &receiver)
    })?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("contactpoint deleted")),
    ))
}

// ============ Templates ============

/// A named notification template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    /// Template name.
    pub name: String,
    /// Template source.
    pub template: String,
}

/// Body of a template update.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateContent {
    /// Template source.
    pub template: String,
}

/// `GET /api/v1/provisioning/templates`
pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<Vec<NotificationTemplate>>> {
    let config = read_config(&state, &user)?;
    Ok(Json(
        config
            .template_files
            .into_iter()
            .map(|(name, template)| NotificationTemplate { name, template })
            .collect(),
    ))
}

/// `GET /api/v1/provisioning/templates/{name}`
pub async fn get_template(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(name): Path<String>,
) -> ApiResult<Json<NotificationTemplate>> {
    let mut config = read_config(&state, &user)?;
    let template = config
        .template_files
        .remove(&name)
        .ok_or_else(|| ApiError::NotFound(format!("template not found: {name}")))?;
    Ok(Json(NotificationTemplate { name, template }))
}

/// `PUT /api/v1/provisioning/templates/{name}`
pub async fn put_template(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(name): Path<String>,
    Json(body): Json<TemplateContent>,
) -> ApiResult<(StatusCode, Json<NotificationTemplate>)> {
    if name.trim().is_empty() {
        return Err(ApiError::Validation("template name cannot be empty".to_string()));
    }
    let saved = NotificationTemplate {
        name: name.clone(),
        template: body.template.clone(),
    };
    modify(&state, &user, |config| {
        config.template_files.insert(name, body.template);
        Ok(())
    })?;
    Ok((StatusCode::ACCEPTED, Json(saved)))
}

/// `DELETE /api/v1/provisioning/templates/{name}`
pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    modify(&state, &user, |config| {
        config
            .template_files
            .remove(&name)
            .map(|_| ())
            .ok_or_else(|| ApiError::NotFound(format!("template not found: {name}")))
    })?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Mute timings ============

/// `GET /api/v1/provisioning/mute-timings`
pub async fn list_mute_timings(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<Vec<MuteTiming>>> {
    Ok(Json(read_config(&state, &user)?.alertmanager_config.mute_time_intervals))
}

/// `GET /api/v1/provisioning/mute-timings/{name}`
pub async fn get_mute_timing(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(name): Path<String>,
) -> ApiResult<Json<MuteTiming>> {
    read_config(&state, &user)?
        .alertmanager_config
        .mute_time_intervals
        .into_iter()
        .find(|m| m.name == name)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("mute timing not found: {name}")))
}

/// `POST /api/v1/provisioning/mute-timings`
pub async fn create_mute_timing(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(timing): Json<MuteTiming>,
) -> ApiResult<(StatusCode, Json<MuteTiming>)> {
    timing.validate()?;
    let created = timing.clone();
    modify(&state, &user, |config| {
        let timings = &mut config.alertmanager_config.mute_time_intervals;
        if timings.iter().any(|m| m.name == timing.name) {
            return Err(ApiError::Conflict(format!(
                "mute timing {:?} already exists",
                timing.name
            )));
        }
        timings.push(timing);
        Ok(())
    })?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `PUT /api/v1/provisioning/mute-timings/{name}`
pub async fn update_mute_timing(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(name): Path<String>,
    Json(mut timing): Json<MuteTiming>,
) -> ApiResult<(StatusCode, Json<MuteTiming>)> {
    timing.name.clone_from(&name);
    timing.validate()?;
    let updated = timing.clone();
    modify(&state, &user, |config| {
        let slot = config
            .alertmanager_config
            .mute_time_intervals
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| ApiError::NotFound(format!("mute timing not found: {name}")))?;
        *slot = timing;
        Ok(())
    })?;
    Ok((StatusCode::ACCEPTED, Json(updated)))
}

/// `DELETE /api/v1/provisioning/mute-timings/{name}`
pub async fn delete_mute_timing(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    modify(&state, &user, |config| {
        if config.mute_timing_in_use(&name) {
            return Err(ApiError::Conflict(format!(
                "mute timing {name:?} is used by a notification policy"
            )));
        }
        let timings = &mut config.alertmanager_config.mute_time_intervals;
        let before = timings.len();
        timings.retain(|m| m.name != name);
        if timings.len() == before {
            return Err(ApiError::NotFound(format!("mute timing not found: {name}")));
        }
        Ok(())
    })?;
    Ok(StatusCode::NO_CONTENT)
}
