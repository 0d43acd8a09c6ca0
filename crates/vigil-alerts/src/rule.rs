//! Alert rules and rule groups.
//!
//! This module provides the rule data model:
//! - [`AlertQuery`]: one query a rule runs, identified by a `ref_id`
//! - [`AlertRule`]: the rule itself, with its condition and state policies
//! - [`RuleGroup`]: rules in one folder that share an evaluation interval
//! - [`RuleKey`] and [`GroupKey`]: identities used by the scheduler and stores

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AlertError, Result};
use crate::labels::Labels;

/// Default organisation ID.
pub const DEFAULT_ORG_ID: i64 = 1;

/// A query executed as part of a rule evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertQuery {
    /// Identifier the rule condition refers to, e.g. `A`.
    pub ref_id: String,
    /// Datasource the query runs against.
    #[serde(default)]
    pub datasource_uid: String,
    /// Time range relative to the evaluation time.
    #[serde(default)]
    pub relative_time_range: RelativeTimeRange,
    /// Opaque query model passed to the executor.
    #[serde(default)]
    pub model: serde_json::Value,
}

impl AlertQuery {
    /// Creates a query with the given ref ID and model.
    pub fn new(ref_id: impl Into<String>, model: serde_json::Value) -> Self {
        Self {
            ref_id: ref_id.into(),
            datasource_uid: String::new(),
            relative_time_range: RelativeTimeRange::default(),
            model,
        }
    }

    /// Sets the datasource UID.
    #[must_use]
    pub fn datasource(mut self, uid: impl Into<String>) -> Self {
        self.datasource_uid = uid.into();
        self
    }
}

/// Query window, in seconds before the evaluation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativeTimeRange {
    /// Start of the window, seconds before now.
    pub from: u64,
    /// End of the window, seconds before now.
    pub to: u64,
}

/// What a rule does when its query returns no data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoDataState {
    /// Treat as firing.
    Alerting,
    /// Enter the dedicated `NoData` state.
    #[default]
    NoData,
    /// Treat as normal.
    #[serde(rename = "OK")]
    Ok,
    /// Keep whatever state the instance had.
    KeepLast,
}

/// What a rule does when its query fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecErrState {
    /// Treat as firing.
    Alerting,
    /// Enter the dedicated `Error` state.
    #[default]
    Error,
    /// Treat as normal.
    #[serde(rename = "OK")]
    Ok,
    /// Keep whatever state the instance had.
    KeepLast,
}

/// Identity of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    /// Owning organisation.
    pub org_id: i64,
    /// Rule UID.
    pub uid: String,
}

impl RuleKey {
    /// Creates a rule key.
    pub fn new(org_id: i64, uid: impl Into<String>) -> Self {
        Self {
            org_id,
            uid: uid.into(),
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.org_id, self.uid)
    }
}

/// Identity of a rule group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    /// Owning organisation.
    pub org_id: i64,
    /// Folder (namespace) UID.
    pub folder_uid: String,
    /// Group name, unique within the folder.
    pub name: String,
}

impl GroupKey {
    /// Creates a group key.
    pub fn new(org_id: i64, folder_uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            org_id,
            folder_uid: folder_uid.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.org_id, self.folder_uid, self.name)
    }
}

/// An alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique identifier.
    pub uid: String,
    /// Owning organisation.
    pub org_id: i64,
    /// Folder the rule lives in.
    pub folder_uid: String,
    /// Group the rule belongs to.
    pub rule_group: String,
    /// Human-readable title, unique within the folder.
    pub title: String,
    /// `ref_id` of the query whose result decides firing.
    pub condition: String,
    /// Queries, in order.
    pub data: Vec<AlertQuery>,
    /// Evaluation interval, inherited from the group.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long the condition must hold before the rule fires.
    #[serde(rename = "for", with = "humantime_serde")]
    pub for_duration: Duration,
    /// Policy for empty query results.
    #[serde(default)]
    pub no_data_state: NoDataState,
    /// Policy for query failures.
    #[serde(default)]
    pub exec_err_state: ExecErrState,
    /// Labels attached to every instance (may contain templates).
    #[serde(default)]
    pub labels: Labels,
    /// Annotations attached to every instance (may contain templates).
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Paused rules are never evaluated.
    #[serde(default)]
    pub is_paused: bool,
    /// Incremented on every administrative change.
    #[serde(default)]
    pub version: u64,
    /// Time of the last administrative change.
    pub updated: DateTime<Utc>,
}

impl AlertRule {
    /// Maximum allowed length for rule titles.
    pub const MAX_TITLE_LENGTH: usize = 190;

    /// Creates a new alert rule builder.
    pub fn builder(title: impl Into<String>, condition: impl Into<String>) -> AlertRuleBuilder {
        AlertRuleBuilder::new(title, condition)
    }

    /// Returns this rule's key.
    #[must_use]
    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.org_id, self.uid.clone())
    }

    /// Returns the key of the group this rule belongs to.
    #[must_use]
    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(self.org_id, self.folder_uid.clone(), self.rule_group.clone())
    }

    /// Checks the rule on its own.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRule` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(AlertError::InvalidRule { reason });

        if self.title.trim().is_empty() {
            return invalid("rule title cannot be empty".to_string());
        }
        if self.title.chars().count() > Self::MAX_TITLE_LENGTH {
            return invalid(format!(
                "rule title exceeds maximum length of {} characters",
                Self::MAX_TITLE_LENGTH
            ));
        }
        if self.data.is_empty() {
            return invalid(format!("rule {:?} has no queries", self.title));
        }
        let mut ref_ids = HashSet::new();
        for query in &self.data {
            if query.ref_id.is_empty() {
                return invalid(format!("rule {:?} has a query without ref_id", self.title));
            }
            if !ref_ids.insert(query.ref_id.as_str()) {
                return invalid(format!(
                    "rule {:?} has duplicate query ref_id {:?}",
                    self.title, query.ref_id
                ));
            }
        }
        if !ref_ids.contains(self.condition.as_str()) {
            return invalid(format!(
                "condition {:?} does not refer to any query of rule {:?}",
                self.condition, self.title
            ));
        }
        for (name, _) in self.labels.iter() {
            if !is_valid_label_name(name) {
                return invalid(format!("invalid label name {name:?}"));
            }
        }
        if self.annotations.keys().any(String::is_empty) {
            return invalid("annotation names cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Label names follow the Prometheus data model.
#[must_use]
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Builder for creating [`AlertRule`] instances.
#[derive(Debug)]
pub struct AlertRuleBuilder {
    uid: Option<String>,
    title: String,
    condition: String,
    data: Vec<AlertQuery>,
    for_duration: Duration,
    no_data_state: NoDataState,
    exec_err_state: ExecErrState,
    labels: Labels,
    annotations: BTreeMap<String, String>,
    is_paused: bool,
}

impl AlertRuleBuilder {
    fn new(title: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            uid: None,
            title: title.into(),
            condition: condition.into(),
            data: Vec::new(),
            for_duration: Duration::ZERO,
            no_data_state: NoDataState::default(),
            exec_err_state: ExecErrState::default(),
            labels: Labels::new(),
            annotations: BTreeMap::new(),
            is_paused: false,
        }
    }

    /// Sets a fixed UID instead of a generated one.
    #[must_use]
    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Adds a query.
    #[must_use]
    pub fn query(mut self, query: AlertQuery) -> Self {
        self.data.push(query);
        self
    }

    /// Sets the duration the condition must hold before firing.
    #[must_use]
    pub const fn for_duration(mut self, duration: Duration) -> Self {
        self.for_duration = duration;
        self
    }

    /// Sets the no-data policy.
    #[must_use]
    pub const fn no_data_state(mut self, state: NoDataState) -> Self {
        self.no_data_state = state;
        self
    }

    /// Sets the execution-error policy.
    #[must_use]
    pub const fn exec_err_state(mut self, state: ExecErrState) -> Self {
        self.exec_err_state = state;
        self
    }

    /// Adds a label to the rule.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key, value);
        self
    }

    /// Adds an annotation to the rule.
    #[must_use]
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Sets whether the rule is paused.
    #[must_use]
    pub const fn paused(mut self, paused: bool) -> Self {
        self.is_paused = paused;
        self
    }

    /// Builds the [`AlertRule`]. Folder, group and interval are filled in
    /// when the rule is placed in a [`RuleGroup`].
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRule` if the rule fails [`AlertRule::validate`].
    pub fn build(self) -> Result<AlertRule> {
        let rule = AlertRule {
            uid: self.uid.unwrap_or_else(|| Uuid::new_v4().to_string()),
            org_id: DEFAULT_ORG_ID,
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
            version: 1,
            updated: Utc::now(),
        };
        rule.validate()?;
        Ok(rule)
    }
}

/// Rules in one folder that are evaluated together on the same interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    /// Owning organisation.
    pub org_id: i64,
    /// Folder (namespace) UID.
    pub folder_uid: String,
    /// Group name.
    pub name: String,
    /// Evaluation interval shared by every rule.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Rules, in evaluation order.
    pub rules: Vec<AlertRule>,
}

impl RuleGroup {
    /// Creates a group and stamps its identity onto every rule.
    pub fn new(
        org_id: i64,
        folder_uid: impl Into<String>,
        name: impl Into<String>,
        interval: Duration,
        rules: Vec<AlertRule>,
    ) -> Self {
        let mut group = Self {
            org_id,
            folder_uid: folder_uid.into(),
            name: name.into(),
            interval,
            rules,
        };
        group.normalize();
        group
    }

    /// Returns this group's key.
    #[must_use]
    pub fn key(&self) -> GroupKey {
        GroupKey::new(self.org_id, self.folder_uid.clone(), self.name.clone())
    }

    /// Copies the group identity and interval onto every rule.
    pub fn normalize(&mut self) {
        for rule in &mut self.rules {
            rule.org_id = self.org_id;
            rule.folder_uid.clone_from(&self.folder_uid);
            rule.rule_group.clone_from(&self.name);
            rule.interval = self.interval;
        }
    }

    /// Checks the group and all of its rules.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRule` if the name is empty, the interval is not
    /// a positive multiple of `base_interval`, a rule is invalid, or two rules
    /// share a title.
    pub fn validate(&self, base_interval: Duration) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AlertError::InvalidRule {
                reason: "rule group name cannot be empty".to_string(),
            });
        }
        if self.folder_uid.trim().is_empty() {
            return Err(AlertError::InvalidRule {
                reason: "rule group namespace cannot be empty".to_string(),
            });
        }
        validate_interval(self.interval, base_interval)?;

        let mut titles = HashSet::new();
        let mut uids = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !titles.insert(rule.title.as_str()) {
                return Err(conflicting_title());
            }
            if !uids.insert(rule.uid.as_str()) {
                return Err(AlertError::InvalidRule {
                    reason: format!("rule UID {:?} appears twice in the group", rule.uid),
                });
            }
        }
        Ok(())
    }

    /// Returns the number of base ticks between evaluations.
    #[must_use]
    pub fn ticks_per_evaluation(&self, base_interval: Duration) -> u64 {
        let base = base_interval.as_millis().max(1);
        (self.interval.as_millis() / base).max(1) as u64
    }
}

/// Error raised when two rules in a folder share a title.
#[must_use]
pub fn conflicting_title() -> AlertError {
    AlertError::InvalidRule {
        reason: "a conflicting alert rule is found: rule title under the same organisation and folder should be unique".to_string(),
    }
}

/// Checks that `interval` is a positive multiple of `base_interval`.
///
/// # Errors
///
/// Returns `AlertError::InvalidDuration` otherwise.
pub fn validate_interval(interval: Duration, base_interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(AlertError::InvalidDuration {
            reason: "interval must be greater than zero".to_string(),
        });
    }
    let base = base_interval.as_millis();
    if base == 0 || interval.as_millis() % base != 0 {
        return Err(AlertError::InvalidDuration {
            reason: format!(
                "interval ({}) should be a non-zero multiple of the base interval ({})",
                humantime::format_duration(interval),
                humantime::format_duration(base_interval)
            ),
        });
    }
    Ok(())
}
