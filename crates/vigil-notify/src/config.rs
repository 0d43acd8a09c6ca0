//! Alertmanager configuration documents.
//!
//! The JSON shape follows the Grafana-managed Alertmanager API:
//!
//! ```json
//! {
//!   "template_files": { "name": "{{ define \"name\" }}...{{ end }}" },
//!   "alertmanager_config": {
//!     "route": { "receiver": "ops", "group_by": ["alertname"], "routes": [] },
//!     "receivers": [{ "name": "ops", "grafana_managed_receiver_configs": [] }],
//!     "inhibit_rules": [],
//!     "mute_time_intervals": []
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_alerts::Matchers;

use crate::error::{NotifyError, Result};
use crate::mute::MuteTiming;

/// Default wait before the first notification of a new group.
pub const DEFAULT_GROUP_WAIT: Duration = Duration::from_secs(30);
/// Default wait between notifications of a changed group.
pub const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default wait before re-sending an unchanged firing group.
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);
/// Name of the receiver in a fresh organisation's configuration.
pub const DEFAULT_RECEIVER: &str = "default";
/// `group_by` value meaning "every label".
pub const GROUP_BY_ALL: &str = "...";

/// A full per-organisation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertmanagerConfig {
    /// Named notification templates.
    #[serde(default)]
    pub template_files: BTreeMap<String, String>,
    /// Routing tree, receivers and suppression settings.
    pub alertmanager_config: RoutingConfig,
}

impl Default for AlertmanagerConfig {
    fn default() -> Self {
        Self {
            template_files: BTreeMap::new(),
            alertmanager_config: RoutingConfig {
                route: RouteConfig {
                    receiver: Some(DEFAULT_RECEIVER.to_string()),
                    group_by: Some(vec!["alertname".to_string(), "grafana_folder".to_string()]),
                    ..RouteConfig::default()
                },
                receivers: vec![ReceiverConfig {
                    name: DEFAULT_RECEIVER.to_string(),
                    integrations: vec![IntegrationConfig::new("log", DEFAULT_RECEIVER)],
                }],
                inhibit_rules: Vec::new(),
                mute_time_intervals: Vec::new(),
            },
        }
    }
}

/// Routing part of [`AlertmanagerConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Root of the routing tree.
    pub route: RouteConfig,
    /// Receivers referenced by routes.
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
    /// Inhibition rules.
    #[serde(default)]
    pub inhibit_rules: Vec<InhibitRule>,
    /// Mute timings referenced by routes.
    #[serde(default)]
    pub mute_time_intervals: Vec<MuteTiming>,
}

/// One node of the routing tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Receiver; inherited from the parent when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    /// Grouping labels; `["..."]` groups by every label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    /// Wait before the first notification of a new group.
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub group_wait: Option<Duration>,
    /// Wait between notifications about a changed group.
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub group_interval: Option<Duration>,
    /// Wait before re-sending an unchanged firing group.
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<Duration>,
    /// Matchers selecting alerts for this node.
    #[serde(
        default,
        alias = "object_matchers",
        skip_serializing_if = "Matchers::is_empty"
    )]
    pub matchers: Matchers,
    /// Keep matching siblings after this node matched.
    #[serde(default, rename = "continue", skip_serializing_if = "std::ops::Not::not")]
    pub continue_matching: bool,
    /// Mute timings that hold back notifications for this node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mute_time_intervals: Vec<String>,
    /// Child nodes, matched in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
}

impl RouteConfig {
    fn walk<'a>(&'a self, out: &mut Vec<&'a RouteConfig>) {
        out.push(self);
        for child in &self.routes {
            child.walk(out);
        }
    }

    /// Every node of the subtree, depth first.
    #[must_use]
    pub fn nodes(&self) -> Vec<&RouteConfig> {
        let mut out = Vec::new();
        self.walk(&mut out);
        out
    }
}

/// A named set of integrations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Receiver name.
    pub name: String,
    /// Integrations notified together.
    #[serde(default, rename = "grafana_managed_receiver_configs", alias = "integrations")]
    pub integrations: Vec<IntegrationConfig>,
}

/// One integration (contact point) of a receiver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationConfig {
    /// Stable identifier; generated when empty.
    #[serde(default)]
    pub uid: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Integration type, e.g. `webhook`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Plain settings.
    #[serde(default = "empty_object")]
    pub settings: serde_json::Value,
    /// Secret settings; plaintext on input, encrypted at rest.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secure_settings: BTreeMap<String, String>,
    /// Which secure settings are set, shown instead of their values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secure_fields: BTreeMap<String, bool>,
    /// Skip resolved-only notifications.
    #[serde(default)]
    pub disable_resolve_message: bool,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl IntegrationConfig {
    /// Creates an integration of `kind` with empty settings.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            settings: empty_object(),
            ..Self::default()
        }
    }

    /// Sets a plain setting.
    #[must_use]
    pub fn with_setting(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let serde_json::Value::Object(map) = &mut self.settings {
            map.insert(key.to_string(), value.into());
        } else {
            let mut map = serde_json::Map::new();
            map.insert(key.to_string(), value.into());
            self.settings = serde_json::Value::Object(map);
        }
        self
    }

    /// Sets a secure setting.
    #[must_use]
    pub fn with_secure_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secure_settings.insert(key.into(), value.into());
        self
    }

    /// Sets the UID.
    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }
}

/// Suppresses target alerts while matching source alerts fire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InhibitRule {
    /// Alerts that inhibit.
    #[serde(default)]
    pub source_matchers: Matchers,
    /// Alerts that get inhibited.
    #[serde(default)]
    pub target_matchers: Matchers,
    /// Labels that must be equal on source and target.
    #[serde(default)]
    pub equal: Vec<String>,
}

impl AlertmanagerConfig {
    /// Receiver by name.
    #[must_use]
    pub fn receiver(&self, name: &str) -> Option<&ReceiverConfig> {
        self.alertmanager_config
            .receivers
            .iter()
            .find(|r| r.name == name)
    }

    /// Every integration of every receiver.
    pub fn integrations(&self) -> impl Iterator<Item = &IntegrationConfig> {
        self.alertmanager_config
            .receivers
            .iter()
            .flat_map(|r| r.integrations.iter())
    }

    /// Mutable access to every integration.
    pub fn integrations_mut(&mut self) -> impl Iterator<Item = &mut IntegrationConfig> {
        self.alertmanager_config
            .receivers
            .iter_mut()
            .flat_map(|r| r.integrations.iter_mut())
    }

    /// Fills in missing integration UIDs.
    pub fn assign_uids(&mut self) {
        for integration in self.integrations_mut() {
            if integration.uid.is_empty() {
                integration.uid = uuid::Uuid::new_v4().simple().to_string();
            }
        }
    }

    /// Names of routes that reference `receiver`, used to refuse deletes.
    #[must_use]
    pub fn receiver_in_use(&self, receiver: &str) -> bool {
        self.alertmanager_config
            .route
            .nodes()
            .iter()
            .any(|n| n.receiver.as_deref() == Some(receiver))
    }

    /// True if some route references the mute timing.
    #[must_use]
    pub fn mute_timing_in_use(&self, name: &str) -> bool {
        self.alertmanager_config
            .route
            .nodes()
            .iter()
            .any(|n| n.mute_time_intervals.iter().any(|m| m == name))
    }

    /// Checks the document's structure. Integration settings are checked
    /// separately by the integration registry.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::InvalidConfig` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let cfg = &self.alertmanager_config;
        let root = &cfg.route;

        if root.receiver.as_deref().is_none_or(str::is_empty) {
            return Err(NotifyError::invalid_config("root route must specify a default receiver"));
        }
        if !root.matchers.is_empty() {
            return Err(NotifyError::invalid_config("root route must not have any matchers"));
        }
        if !root.mute_time_intervals.is_empty() {
            return Err(NotifyError::invalid_config(
                "root route must not have any mute time intervals",
            ));
        }

        let mut receivers = HashSet::new();
        for receiver in &cfg.receivers {
            if receiver.name.trim().is_empty() {
                return Err(NotifyError::invalid_config("receiver name cannot be empty"));
            }
            if !receivers.insert(receiver.name.as_str()) {
                return Err(NotifyError::invalid_config(format!(
                    "receiver {:?} is defined more than once",
                    receiver.name
                )));
            }
        }

        let mut uids = HashSet::new();
        for integration in self.integrations() {
            if !integration.uid.is_empty() && !uids.insert(integration.uid.as_str()) {
                return Err(NotifyError::invalid_config(format!(
                    "integration UID {:?} is used more than once",
                    integration.uid
                )));
            }
        }

        let mut timings = HashSet::new();
        for timing in &cfg.mute_time_intervals {
            timing.validate()?;
            if !timings.insert(timing.name.as_str()) {
                return Err(NotifyError::invalid_config(format!(
                    "mute time interval {:?} is defined more than once",
                    timing.name
                )));
            }
        }

        for node in root.nodes() {
            if let Some(receiver) = &node.receiver {
                if !receivers.contains(receiver.as_str()) {
                    return Err(NotifyError::invalid_config(format!(
                        "receiver {receiver:?} does not exist"
                    )));
                }
            }
            for timing in &node.mute_time_intervals {
                if !timings.contains(timing.as_str()) {
                    return Err(NotifyError::invalid_config(format!(
                        "mute time interval {timing:?} does not exist"
                    )));
                }
            }
            if let Some(group_by) = &node.group_by {
                if group_by.iter().any(|l| l == GROUP_BY_ALL) && group_by.len() > 1 {
                    return Err(NotifyError::invalid_config(
                        "cannot have wildcard group_by (`...`) and other labels at the same time",
                    ));
                }
            }
            for (name, value) in [
                ("group_wait", node.group_wait),
                ("group_interval", node.group_interval),
                ("repeat_interval", node.repeat_interval),
            ] {
                if value.is_some_and(|d| d.is_zero() && name != "group_wait") {
                    return Err(NotifyError::invalid_config(format!("{name} cannot be zero")));
                }
            }
        }
        Ok(())
    }

    /// Stable hash of the document, used to detect no-op updates.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> AlertmanagerConfig {
        serde_json::from_value(value).unwrap()
    }

    fn minimal() -> serde_json::Value {
        json!({
            "alertmanager_config": {
                "route": {
                    "receiver": "ops",
                    "group_by": ["alertname"],
                    "group_wait": "10s",
                    "routes": [{
                        "receiver": "db",
                        "object_matchers": [{"name": "team", "value": "db"}],
                        "continue": true
                    }]
                },
                "receivers": [
                    {"name": "ops", "grafana_managed_receiver_configs": [
                        {"uid": "u1", "name": "ops", "type": "webhook", "settings": {"url": "http://example.com"}}
                    ]},
                    {"name": "db", "grafana_managed_receiver_configs": []}
                ]
            }
        })
    }

    #[test]
    fn parses_grafana_shape() {
        let config = parse(minimal());
        let route = &config.alertmanager_config.route;
        assert_eq!(route.group_wait, Some(Duration::from_secs(10)));
        assert_eq!(route.routes[0].matchers.len(), 1);
        assert!(route.routes[0].continue_matching);
        assert_eq!(config.integrations().count(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn default_config_is_valid() {
        AlertmanagerConfig::default().validate().unwrap();
    }

    #[test]
    fn missing_receiver_is_rejected() {
        let mut config = parse(minimal());
        config.alertmanager_config.route.routes[0].receiver = Some("nobody".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("\"nobody\" does not exist"));
    }

    #[test]
    fn root_without_receiver_is_rejected() {
        let mut config = parse(minimal());
        config.alertmanager_config.route.receiver = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_integration_uid_is_rejected() {
        let mut config = parse(minimal());
        let dup = config.alertmanager_config.receivers[0].integrations[0].clone();
        config.alertmanager_config.receivers[1].integrations.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_mute_timing_is_rejected() {
        let mut config = parse(minimal());
        config.alertmanager_config.route.routes[0]
            .mute_time_intervals
            .push("weekends".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn wildcard_group_by_must_stand_alone() {
        let mut config = parse(minimal());
        config.alertmanager_config.route.group_by =
            Some(vec!["...".to_string(), "alertname".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn fingerprint_is_stable_across_round_trip() {
        let config = parse(minimal());
        let again: AlertmanagerConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(config.fingerprint(), again.fingerprint());
        assert_eq!(config, again);
    }
}
