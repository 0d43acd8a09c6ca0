//! Prometheus metrics for the alerting engine.
//!
//! All families are registered once in a single [`AlertingMetrics`] registry
//! shared by the scheduler, the state tracker, the HA coordinator and the
//! notification pipeline. Handles are cheap to clone.
//!
//! ```rust
//! use vigil_alerts::metrics::AlertingMetrics;
//!
//! let metrics = AlertingMetrics::new();
//! metrics.inc_evaluations(1);
//! metrics.inc_missed_evaluations(1);
//! assert!(metrics.encode().contains("vigil_alerting_rule_evaluations_total"));
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::instance::InstanceState;

/// Labels for per-organisation metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OrgLabels {
    /// Organisation ID.
    pub org: String,
}

/// Labels for alert instance gauges.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    /// Organisation ID.
    pub org: String,
    /// Instance state.
    pub state: String,
}

/// Labels for notification delivery metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct IntegrationLabels {
    /// Organisation ID.
    pub org: String,
    /// Integration type, e.g. `slack`.
    pub integration: String,
}

/// Labels for external Alertmanager metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AlertmanagerLabels {
    /// Organisation ID.
    pub org: String,
    /// Alertmanager URL.
    pub url: String,
}

/// Metrics for rule evaluation, notifications and HA coordination.
#[derive(Clone)]
pub struct AlertingMetrics {
    registry: Arc<RwLock<Registry>>,
    evaluations: Family<OrgLabels, Counter>,
    evaluation_failures: Family<OrgLabels, Counter>,
    missed_evaluations: Family<OrgLabels, Counter>,
    evaluation_duration_seconds: Histogram,
    alert_instances: Family<StateLabels, Gauge>,
    state_store_failures: Counter,
    notifications_sent: Family<IntegrationLabels, Counter>,
    notification_failures: Family<IntegrationLabels, Counter>,
    notification_retries: Family<IntegrationLabels, Counter>,
    ha_peer_position: Gauge,
    ha_peers: Gauge,
    ha_is_evaluator: Gauge,
    external_alertmanager_up: Family<AlertmanagerLabels, Gauge>,
}

impl std::fmt::Debug for AlertingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertingMetrics")
            .field("ha_peer_position", &self.ha_peer_position.get())
            .field("ha_is_evaluator", &self.ha_is_evaluator.get())
            .finish_non_exhaustive()
    }
}

impl Default for AlertingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn org(org_id: i64) -> OrgLabels {
    OrgLabels {
        org: org_id.to_string(),
    }
}

impl AlertingMetrics {
    /// Creates the registry with every alerting metric registered.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let evaluations = Family::<OrgLabels, Counter>::default();
        registry.register(
            "vigil_alerting_rule_evaluations",
            "Number of rule evaluations",
            evaluations.clone(),
        );
        let evaluation_failures = Family::<OrgLabels, Counter>::default();
        registry.register(
            "vigil_alerting_rule_evaluation_failures",
            "Number of rule evaluations that ended in an error",
            evaluation_failures.clone(),
        );
        let missed_evaluations = Family::<OrgLabels, Counter>::default();
        registry.register(
            "vigil_alerting_rule_evaluations_missed",
            "Number of rule evaluations skipped because the previous one was still running",
            missed_evaluations.clone(),
        );

        // 5ms .. ~40s
        let evaluation_duration_seconds = Histogram::new(exponential_buckets(0.005, 2.0, 14));
        registry.register(
            "vigil_alerting_rule_evaluation_duration_seconds",
            "Time taken to evaluate a rule",
            evaluation_duration_seconds.clone(),
        );

        let alert_instances = Family::<StateLabels, Gauge>::default();
        registry.register(
            "vigil_alerting_alerts",
            "Number of alert instances by state",
            alert_instances.clone(),
        );
        let state_store_failures = Counter::default();
        registry.register(
            "vigil_alerting_state_store_failures",
            "Number of failed state store writes",
            state_store_failures.clone(),
        );

        let notifications_sent = Family::<IntegrationLabels, Counter>::default();
        registry.register(
            "vigil_alerting_notifications_sent",
            "Number of notifications delivered",
            notifications_sent.clone(),
        );
        let notification_failures = Family::<IntegrationLabels, Counter>::default();
        registry.register(
            "vigil_alerting_notifications_failed",
            "Number of notifications that failed after all attempts",
            notification_failures.clone(),
        );
        let notification_retries = Family::<IntegrationLabels, Counter>::default();
        registry.register(
            "vigil_alerting_notification_retries",
            "Number of notification delivery retries",
            notification_retries.clone(),
        );

        let ha_peer_position = Gauge::default();
        registry.register(
            "vigil_alerting_ha_peer_position",
            "Position of this instance among live peers",
            ha_peer_position.clone(),
        );
        let ha_peers = Gauge::default();
        registry.register(
            "vigil_alerting_ha_peers",
            "Number of live peers",
            ha_peers.clone(),
        );
        let ha_is_evaluator = Gauge::default();
        registry.register(
            "vigil_alerting_ha_is_evaluator",
            "1 if this instance evaluates rules",
            ha_is_evaluator.clone(),
        );

        let external_alertmanager_up = Family::<AlertmanagerLabels, Gauge>::default();
        registry.register(
            "vigil_alerting_external_alertmanager_up",
            "1 if the last sync with the external Alertmanager succeeded",
            external_alertmanager_up.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            evaluations,
            evaluation_failures,
            missed_evaluations,
            evaluation_duration_seconds,
            alert_instances,
            state_store_failures,
            notifications_sent,
            notification_failures,
            notification_retries,
            ha_peer_position,
            ha_peers,
            ha_is_evaluator,
            external_alertmanager_up,
        }
    }

    // ============ Evaluation ============

    /// Counts one evaluation.
    pub fn inc_evaluations(&self, org_id: i64) {
        self.evaluations.get_or_create(&org(org_id)).inc();
    }

    /// Counts one failed evaluation.
    pub fn inc_evaluation_failures(&self, org_id: i64) {
        self.evaluation_failures.get_or_create(&org(org_id)).inc();
    }

    /// Counts one skipped evaluation.
    pub fn inc_missed_evaluations(&self, org_id: i64) {
        self.missed_evaluations.get_or_create(&org(org_id)).inc();
    }

    /// Returns the number of skipped evaluations.
    #[must_use]
    pub fn missed_evaluations(&self, org_id: i64) -> u64 {
        self.missed_evaluations.get_or_create(&org(org_id)).get()
    }

    /// Returns the number of evaluations.
    #[must_use]
    pub fn evaluations(&self, org_id: i64) -> u64 {
        self.evaluations.get_or_create(&org(org_id)).get()
    }

    /// Records how long an evaluation took.
    pub fn observe_evaluation_duration(&self, seconds: f64) {
        self.evaluation_duration_seconds.observe(seconds);
    }

    /// Sets the number of instances in a state.
    pub fn set_alert_instances(&self, org_id: i64, state: InstanceState, count: usize) {
        self.alert_instances
            .get_or_create(&StateLabels {
                org: org_id.to_string(),
                state: state.as_str().to_lowercase(),
            })
            .set(count as i64);
    }

    /// Counts one failed state store write.
    pub fn inc_state_store_failures(&self) {
        self.state_store_failures.inc();
    }

    // ============ Notifications ============

    /// Counts one delivered notification.
    pub fn inc_notifications_sent(&self, org_id: i64, integration: &str) {
        self.notifications_sent
            .get_or_create(&integration_labels(org_id, integration))
            .inc();
    }

    /// Counts one notification that exhausted its attempts.
    pub fn inc_notification_failures(&self, org_id: i64, integration: &str) {
        self.notification_failures
            .get_or_create(&integration_labels(org_id, integration))
            .inc();
    }

    /// Counts one retry.
    pub fn inc_notification_retries(&self, org_id: i64, integration: &str) {
        self.notification_retries
            .get_or_create(&integration_labels(org_id, integration))
            .inc();
    }

    /// Returns the number of failed notifications.
    #[must_use]
    pub fn notification_failures(&self, org_id: i64, integration: &str) -> u64 {
        self.notification_failures
            .get_or_create(&integration_labels(org_id, integration))
            .get()
    }

    // ============ HA ============

    /// Records this instance's position and peer count.
    pub fn set_ha_position(&self, position: Option<usize>, peers: usize) {
        self.ha_peer_position
            .set(position.map_or(-1, |p| p as i64));
        self.ha_peers.set(peers as i64);
    }

    /// Records whether this instance evaluates rules.
    pub fn set_ha_evaluator(&self, evaluating: bool) {
        self.ha_is_evaluator.set(i64::from(evaluating));
    }

    // ============ External Alertmanagers ============

    /// Records the sync status of an external Alertmanager.
    pub fn set_external_alertmanager_up(&self, org_id: i64, url: &str, up: bool) {
        self.external_alertmanager_up
            .get_or_create(&AlertmanagerLabels {
                org: org_id.to_string(),
                url: url.to_string(),
            })
            .set(i64::from(up));
    }

    // ============ Export ============

    /// Encodes all metrics in Prometheus text format.
    #[must_use]
    pub fn encode(&self) -> String {
        let registry = self.registry.read();
        let mut buffer = String::new();
        if encode(&mut buffer, &registry).is_err() {
            tracing::error!("failed to encode prometheus metrics");
            return String::new();
        }
        buffer
    }

    /// Returns the Content-Type header value for the text format.
    #[must_use]
    pub const fn content_type() -> &'static str {
        "text/plain; version=0.0.4; charset=utf-8"
    }
}

fn integration_labels(org_id: i64, integration: &str) -> IntegrationLabels {
    IntegrationLabels {
        org: org_id.to_string(),
        integration: integration.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_counters_with_total_suffix() {
        let metrics = AlertingMetrics::new();
        metrics.inc_evaluations(1);
        let out = metrics.encode();
        assert!(out.contains("vigil_alerting_rule_evaluations_total{org=\"1\"} 1"));
    }

    #[test]
    fn missed_evaluations_counted_per_org() {
        let metrics = AlertingMetrics::new();
        metrics.inc_missed_evaluations(1);
        metrics.inc_missed_evaluations(1);
        metrics.inc_missed_evaluations(2);
        assert_eq!(metrics.missed_evaluations(1), 2);
        assert_eq!(metrics.missed_evaluations(2), 1);
    }

    #[test]
    fn instance_gauge_uses_lowercase_state() {
        let metrics = AlertingMetrics::new();
        metrics.set_alert_instances(1, InstanceState::Alerting, 3);
        assert!(
            metrics
                .encode()
                .contains("vigil_alerting_alerts{org=\"1\",state=\"alerting\"} 3")
        );
    }

    #[test]
    fn ha_gauges() {
        let metrics = AlertingMetrics::new();
        metrics.set_ha_position(Some(2), 3);
        metrics.set_ha_evaluator(false);
        let out = metrics.encode();
        assert!(out.contains("vigil_alerting_ha_peer_position 2"));
        assert!(out.contains("vigil_alerting_ha_peers 3"));
        assert!(out.contains("vigil_alerting_ha_is_evaluator 0"));
    }

    #[test]
    fn clones_share_registry() {
        let metrics = AlertingMetrics::new();
        let clone = metrics.clone();
        clone.inc_notification_failures(1, "slack");
        assert_eq!(metrics.notification_failures(1, "slack"), 1);
    }
}
