//! Ruler API: rule groups per namespace (folder).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use vigil_alerts::{
    AlertQuery, AlertRule, ExecErrState, GroupKey, Labels, NoDataState, RuleGroup,
};

use super::MessageResponse;
use crate::auth::{Action, Scope, User};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Interval of groups posted without one.
pub const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(60);

/// A rule as posted by clients. Server-managed fields are optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostableRule {
    /// Existing rule to update; a new one is created when empty.
    #[serde(default)]
    pub uid: String,
    /// Title, unique within the folder.
    pub title: String,
    /// `ref_id` of the deciding query.
    pub condition: String,
    /// Queries.
    pub data: Vec<AlertQuery>,
    /// Pending period.
    #[serde(default, rename = "for", with = "humantime_serde")]
    pub for_duration: Duration,
    /// Policy for empty results.
    #[serde(default)]
    pub no_data_state: NoDataState,
    /// Policy for failed queries.
    #[serde(default)]
    pub exec_err_state: ExecErrState,
    /// Labels.
    #[serde(default)]
    pub labels: Labels,
    /// Annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Paused rules are not evaluated.
    #[serde(default)]
    pub is_paused: bool,
    /// Version the client last saw; zero skips the check.
    #[serde(default)]
    pub version: u64,
}

impl PostableRule {
    fn into_rule(self) -> AlertRule {
        AlertRule {
            uid: self.uid,
            org_id: 0,
            folder_uid: String::new(),
            rule_group: String::new(),
            title: self.title,
            condition: self.condition,
            data: self.data,
            interval: Duration::ZERO,
            for_duration: self.for_duration,
            no_data_state: self.no_data_state,
            exec_err_state: self.exec_err_state,
            labels: self.labels,
            annotations: self.annotations,
            is_paused: self.is_paused,
            version: self.version,
            updated: Utc::now(),
        }
    }
}

/// A rule group as posted by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostableRuleGroup {
    /// Group name.
    pub name: String,
    /// Evaluation interval.
    #[serde(default, with = "humantime_serde::option")]
    pub interval: Option<Duration>,
    /// Rules; an empty list deletes the group.
    #[serde(default)]
    pub rules: Vec<PostableRule>,
}

/// A stored rule group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GettableRuleGroup {
    /// Group name.
    pub name: String,
    /// Evaluation interval.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Rules with server-managed fields.
    pub rules: Vec<AlertRule>,
}

impl From<RuleGroup> for GettableRuleGroup {
    fn from(group: RuleGroup) -> Self {
        Self {
            name: group.name,
            interval: group.interval,
            rules: group.rules,
        }
    }
}

/// Groups keyed by namespace.
pub type NamespaceConfig = BTreeMap<String, Vec<GettableRuleGroup>>;

fn by_namespace(groups: Vec<RuleGroup>) -> NamespaceConfig {
    let mut out = NamespaceConfig::new();
    for group in groups {
        out.entry(group.folder_uid.clone())
            .or_default()
            .push(group.into());
    }
    for groups in out.values_mut() {
        groups.sort_by(|a, b| a.name.cmp(&b.name));
    }
    out
}

/// `GET /api/ruler/rules`
pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<NamespaceConfig>> {
    state.authorize(&user, Action::RulesRead, Scope::Global)?;
    let groups = state
        .rules()
        .list_groups(user.org_id, None)
        .await?
        .into_iter()
        .filter(|g| {
            state
                .access()
                .allowed(&user, Action::RulesRead, Scope::Folder(&g.folder_uid))
        })
        .collect();
    Ok(Json(by_namespace(groups)))
}

/// `GET /api/ruler/rules/{namespace}`
pub async fn list_namespace(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(namespace): Path<String>,
) -> ApiResult<Json<NamespaceConfig>> {
    state.authorize(&user, Action::RulesRead, Scope::Folder(&namespace))?;
    let groups = state.rules().list_groups(user.org_id, Some(&namespace)).await?;
    Ok(Json(by_namespace(groups)))
}

/// `GET /api/ruler/rules/{namespace}/{group}`
pub async fn get_group(
    State(state): State<Arc<AppState>>,
    user: User,
    Path((namespace, group)): Path<(String, String)>,
) -> ApiResult<Json<GettableRuleGroup>> {
    state.authorize(&user, Action::RulesRead, Scope::Folder(&namespace))?;
    let key = GroupKey::new(user.org_id, namespace.clone(), group.clone());
    let stored = state
        .rules()
        .get_group(&key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("rule group not found: {namespace}/{group}")))?;
    Ok(Json(stored.into()))
}

/// `POST /api/ruler/rules/{namespace}`
pub async fn post_group(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(namespace): Path<String>,
    Json(body): Json<PostableRuleGroup>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    state.authorize(&user, Action::RulesWrite, Scope::Folder(&namespace))?;

    let interval = body.interval.unwrap_or(DEFAULT_GROUP_INTERVAL);
    let rules = body.rules.into_iter().map(PostableRule::into_rule).collect();
    let group = RuleGroup::new(user.org_id, namespace, body.name, interval, rules);
    if !group.rules.is_empty() {
        group.validate(state.config().base_interval)?;
    }

    let key = group.key();
    let change = state.rules().replace_group(group).await?;
    info!(
        group = %key,
        user = %user.login,
        added = change.added.len(),
        updated = change.updated.len(),
        deleted = change.deleted.len(),
        "rule group saved"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("rule group updated successfully")),
    ))
}

/// `DELETE /api/ruler/rules/{namespace}/{group}`
pub async fn delete_group(
    State(state): State<Arc<AppState>>,
    user: User,
    Path((namespace, group)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    state.authorize(&user, Action::RulesWrite, Scope::Folder(&namespace))?;
    let key = GroupKey::new(user.org_id, namespace.clone(), group.clone());
    if state.rules().get_group(&key).await?.is_none() {
        return Err(ApiError::NotFound(format!(
            "rule group not found: {namespace}/{group}"
        )));
    }
    let change = state.rules().delete_group(&key).await?;
    info!(group = %key, user = %user.login, deleted = change.deleted.len(), "rule group deleted");
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("rule group deleted")),
    ))
}
