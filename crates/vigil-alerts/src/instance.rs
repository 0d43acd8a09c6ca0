//! Alert instances: the per-label-set state of a rule.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::labels::{Fingerprint, Labels};
use crate::rule::RuleKey;

/// State of one alert instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    /// Condition is not met.
    #[default]
    Normal,
    /// Condition is met but has not held for the rule's `for` duration yet.
    Pending,
    /// The alert is firing.
    Alerting,
    /// The query returned no data and the rule maps that to its own state.
    NoData,
    /// The query failed and the rule maps that to its own state.
    Error,
}

impl InstanceState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Pending => "Pending",
            Self::Alerting => "Alerting",
            Self::NoData => "NoData",
            Self::Error => "Error",
        }
    }

    /// States that produce a firing notification.
    #[must_use]
    pub const fn is_firing(&self) -> bool {
        matches!(self, Self::Alerting | Self::NoData | Self::Error)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance is in its current state, when it is not the plain
/// outcome of the condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateReason {
    /// The query returned no data.
    NoData,
    /// The query failed.
    Error,
    /// The series stopped appearing in query results.
    MissingSeries,
    /// The rule was paused.
    Paused,
    /// The rule was deleted or changed.
    RuleDeleted,
}

/// Key of an alert instance in the state store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    /// Rule the instance belongs to.
    pub rule: RuleKey,
    /// Fingerprint of the instance labels.
    pub fingerprint: Fingerprint,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rule, self.fingerprint)
    }
}

/// The tracked state of one label set produced by one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInstance {
    /// Rule this instance belongs to.
    pub rule: RuleKey,
    /// Folder of the rule.
    pub folder_uid: String,
    /// Fingerprint of `labels`.
    pub fingerprint: Fingerprint,
    /// Full label set.
    pub labels: Labels,
    /// Expanded annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Current state.
    pub state: InstanceState,
    /// Reason for the current state, if any.
    #[serde(default)]
    pub state_reason: Option<StateReason>,
    /// Start of the current firing (or pending) episode.
    pub starts_at: DateTime<Utc>,
    /// When the alert stops being valid unless re-sent.
    pub ends_at: DateTime<Utc>,
    /// Time of the last evaluation that touched this instance.
    pub last_evaluation_at: DateTime<Utc>,
    /// Duration of that evaluation.
    #[serde(default, with = "humantime_serde")]
    pub evaluation_duration: Duration,
    /// Values of all queries for this label set at the last evaluation.
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    /// Error message from the last evaluation.
    #[serde(default)]
    pub error: Option<String>,
    /// When the instance was last handed to the notification sink.
    #[serde(default)]
    pub last_sent_at: Option<DateTime<Utc>>,
    /// When the last firing episode ended.
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Monotonic write counter used for last-writer-wins in the store.
    pub version: u64,
}

impl AlertInstance {
    /// Creates a fresh `Normal` instance.
    #[must_use]
    pub fn new(
        rule: RuleKey,
        folder_uid: impl Into<String>,
        labels: Labels,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            rule,
            folder_uid: folder_uid.into(),
            fingerprint: labels.fingerprint(),
            labels,
            annotations: BTreeMap::new(),
            state: InstanceState::Normal,
            state_reason: None,
            starts_at: now,
            ends_at: now,
            last_evaluation_at: now,
            evaluation_duration: Duration::ZERO,
            values: BTreeMap::new(),
            error: None,
            last_sent_at: None,
            resolved_at: None,
            version: 0,
        }
    }

    /// Returns the store key.
    #[must_use]
    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            rule: self.rule.clone(),
            fingerprint: self.fingerprint,
        }
    }

    /// True if the instance left a firing state in its last transition and
    /// the resolution still has to be delivered.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.state == InstanceState::Normal && self.resolved_at.is_some()
    }

    /// Value of the condition query, if captured.
    #[must_use]
    pub fn condition_value(&self, condition: &str) -> Option<f64> {
        self.values.get(condition).copied()
    }
}
