//! Prometheus-compatible rule and alert listings.
//!
//! Both endpoints read the shared rule and state stores rather than this
//! replica's cache, so every replica answers the same.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::Serialize;
use vigil_alerts::{AlertInstance, AlertRule, InstanceState, Labels, RuleKey};

use crate::auth::{Action, Scope, User};
use crate::error::ApiResult;
use crate::state::AppState;

/// Envelope of Prometheus API responses.
#[derive(Debug, Clone, Serialize)]
pub struct PrometheusResponse<T> {
    /// Always `success`.
    pub status: &'static str,
    /// Payload.
    pub data: T,
}

impl<T> PrometheusResponse<T> {
    pub(crate) fn success(data: T) -> Self {
        Self {
            status: "success",
            data,
        }
    }
}

/// One alert instance in Prometheus shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusAlert {
    /// Instance labels.
    pub labels: Labels,
    /// Instance annotations.
    pub annotations: BTreeMap<String, String>,
    /// `Alerting`, `Pending`, `NoData` or `Error`.
    pub state: String,
    /// Start of the current state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_at: Option<DateTime<Utc>>,
    /// Condition value at the last evaluation.
    pub value: String,
}

/// One alerting rule in Prometheus shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusRule {
    /// Rule title.
    pub name: String,
    /// Rule UID.
    pub uid: String,
    /// Serialized queries.
    pub query: String,
    /// Pending period in seconds.
    pub duration: f64,
    /// Rule labels.
    pub labels: Labels,
    /// Rule annotations.
    pub annotations: BTreeMap<String, String>,
    /// `inactive`, `pending` or `firing`.
    pub state: &'static str,
    /// `ok`, `nodata` or `error`.
    pub health: &'static str,
    /// Last evaluation error.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    /// Always `alerting`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Last evaluation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_evaluation: Option<DateTime<Utc>>,
    /// Duration of the last evaluation in seconds.
    pub evaluation_time: f64,
    /// Active instances.
    pub alerts: Vec<PrometheusAlert>,
}

/// One rule group in Prometheus shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusGroup {
    /// Group name.
    pub name: String,
    /// Namespace (folder UID).
    pub file: String,
    /// Evaluation interval in seconds.
    pub interval: f64,
    /// Rules.
    pub rules: Vec<PrometheusRule>,
}

/// Payload of `GET .../api/v1/rules`.
#[derive(Debug, Clone, Serialize)]
pub struct RuleDiscovery {
    /// Rule groups.
    pub groups: Vec<PrometheusGroup>,
}

/// Payload of `GET .../api/v1/alerts`.
#[derive(Debug, Clone, Serialize)]
pub struct AlertDiscovery {
    /// Active alerts.
    pub alerts: Vec<PrometheusAlert>,
}

fn alert(rule: &AlertRule, instance: &AlertInstance) -> PrometheusAlert {
    let value = instance
        .condition_value(&rule.condition)
        .map_or_else(String::new, |v| v.to_string());
    PrometheusAlert {
        labels: instance.labels.clone(),
        annotations: instance.annotations.clone(),
        state: instance.state.as_str().to_string(),
        active_at: (instance.state != InstanceState::Normal).then_some(instance.starts_at),
        value,
    }
}

fn rule_entry(rule: &AlertRule, instances: &[AlertInstance]) -> PrometheusRule {
    let active: Vec<&AlertInstance> = instances
        .iter()
        .filter(|i| i.state != InstanceState::Normal)
        .collect();

    let state = if active.iter().any(|i| i.state.is_firing()) {
        "firing"
    } else if active.iter().any(|i| i.state == InstanceState::Pending) {
        "pending"
    } else {
        "inactive"
    };
    let last_error = instances
        .iter()
        .find_map(|i| i.error.clone())
        .unwrap_or_default();
    let health = if instances.iter().any(|i| i.state == InstanceState::Error) || !last_error.is_empty() {
        "error"
    } else if instances.iter().any(|i| i.state == InstanceState::NoData) {
        "nodata"
    } else {
        "ok"
    };
    let latest = instances.iter().max_by_key(|i| i.last_evaluation_at);

    PrometheusRule {
        name: rule.title.clone(),
        uid: rule.uid.clone(),
        query: serde_json::to_string(&rule.data).unwrap_or_default(),
        duration: rule.for_duration.as_secs_f64(),
        labels: rule.labels.clone(),
        annotations: rule.annotations.clone(),
        state,
        health,
        last_error,
        kind: "alerting",
        last_evaluation: latest.map(|i| i.last_evaluation_at),
        evaluation_time: latest.map_or(0.0, |i| i.evaluation_duration.as_secs_f64()),
        alerts: active.into_iter().map(|i| alert(rule, i)).collect(),
    }
}

async fn instances_by_rule(
    state: &AppState,
    org_id: i64,
) -> ApiResult<HashMap<RuleKey, Vec<AlertInstance>>> {
    let mut by_rule: HashMap<RuleKey, Vec<AlertInstance>> = HashMap::new();
    for instance in state.states().list(org_id).await? {
        by_rule.entry(instance.rule.clone()).or_default().push(instance);
    }
    for instances in by_rule.values_mut() {
        instances.sort_by_key(|i| i.labels.fingerprint());
    }
    Ok(by_rule)
}

/// `GET /api/prometheus/api/v1/rules`
pub async fn rules(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<PrometheusResponse<RuleDiscovery>>> {
    state.authorize(&user, Action::RulesRead, Scope::Global)?;
    let by_rule = instances_by_rule(&state, user.org_id).await?;

    let mut groups: Vec<PrometheusGroup> = state
        .rules()
        .list_groups(user.org_id, None)
        .await?
        .into_iter()
        .filter(|g| {
            state
                .access()
                .allowed(&user, Action::RulesRead, Scope::Folder(&g.folder_uid))
        })
        .map(|g| PrometheusGroup {
            rules: g
                .rules
                .iter()
                .map(|r| rule_entry(r, by_rule.get(&r.key()).map_or(&[], Vec::as_slice)))
                .collect(),
            name: g.name,
            file: g.folder_uid,
            interval: g.interval.as_secs_f64(),
        })
        .collect();
    groups.sort_by(|a, b| a.file.cmp(&b.file).then_with(|| a.name.cmp(&b.name)));

    Ok(Json(PrometheusResponse::success(RuleDiscovery { groups })))
}

/// `GET /api/prometheus/api/v1/alerts`
pub async fn alerts(
    State(state): State<Arc<AppState>>,
    user: User,
) -> ApiResult<Json<PrometheusResponse<AlertDiscovery>>> {
    state.authorize(&user, Action::RulesRead, Scope::Global)?;
    let by_rule = instances_by_rule(&state, user.org_id).await?;

    let mut alerts = Vec::new();
    for group in state.rules().list_groups(user.org_id, None).await? {
        if !state
            .access()
            .allowed(&user, Action::RulesRead, Scope::Folder(&group.folder_uid))
        {
            continue;
        }
        for rule in &group.rules {
            let Some(instances) = by_rule.get(&rule.key()) else {
                continue;
            };
            alerts.extend(
                instances
                    .iter()
                    .filter(|i| i.state != InstanceState::Normal)
                    .map(|i| alert(rule, i)),
            );
        }
    }

    Ok(Json(PrometheusResponse::success(AlertDiscovery { alerts })))
}
