//! Alerts handed from the state tracker to notification routing.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::labels::{Fingerprint, Labels};

/// An alert in the shape accepted by Alertmanager's `POST /api/v2/alerts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostableAlert {
    /// Identifying labels.
    pub labels: Labels,
    /// Informational annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Start of the firing episode.
    pub starts_at: DateTime<Utc>,
    /// End of validity; in the past for resolved alerts.
    pub ends_at: DateTime<Utc>,
    /// Link back to the rule.
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
}

impl PostableAlert {
    /// Fingerprint of the labels.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.labels.fingerprint()
    }

    /// True if the alert is resolved at `now`.
    #[must_use]
    pub fn is_resolved_at(&self, now: DateTime<Utc>) -> bool {
        self.ends_at <= now
    }
}

/// Receives alerts produced by rule evaluation.
#[async_trait]
pub trait AlertSink: Send + Sync + std::fmt::Debug {
    /// Accepts firing and resolved alerts of an organisation.
    async fn send(&self, org_id: i64, alerts: Vec<PostableAlert>);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl AlertSink for NullSink {
    async fn send(&self, _org_id: i64, _alerts: Vec<PostableAlert>) {}
}

/// Sink that records every batch it receives.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    batches: Arc<Mutex<Vec<(i64, Vec<PostableAlert>)>>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every alert received so far, flattened.
    #[must_use]
    pub fn alerts(&self) -> Vec<PostableAlert> {
        self.batches
            .lock()
            .iter()
            .flat_map(|(_, a)| a.iter().cloned())
            .collect()
    }

    /// Removes and returns everything received so far.
    pub fn take(&self) -> Vec<PostableAlert> {
        std::mem::take(&mut *self.batches.lock())
            .into_iter()
            .flat_map(|(_, a)| a)
            .collect()
    }
}

#[async_trait]
impl AlertSink for CollectingSink {
    async fn send(&self, org_id: i64, alerts: Vec<PostableAlert>) {
        if !alerts.is_empty() {
            self.batches.lock().push((org_id, alerts));
        }
    }
}
