//! Per-instance state machine.
//!
//! The [`StateTracker`] turns evaluation results into alert instance
//! transitions, writes every touched instance to the [`StateStore`] and then
//! returns the alerts that must be handed to notification routing.
//!
//! ```text
//!            Firing (for = 0)
//!   Normal ───────────────────────────────► Alerting
//!     │ Firing                                  ▲
//!     ▼                 held for `for`          │
//!   Pending ────────────────────────────────────┘
//!     │ Normal                                  │ Normal
//!     ▼                                         ▼
//!   Normal ◄──────────────────────────── Normal (resolved)
//! ```
//!
//! NoData and Error results are mapped through the rule's `NoDataState` and
//! `ExecErrState` policies first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::clock::chrono_duration;
use crate::evaluator::{EvalResult, Evaluation, ResultState};
use crate::instance::{AlertInstance, InstanceKey, InstanceState, StateReason};
use crate::labels::{
    ALERT_NAME_LABEL, FOLDER_LABEL, Fingerprint, Labels, NAMESPACE_UID_LABEL, RULE_UID_LABEL,
};
use crate::metrics::AlertingMetrics;
use crate::rule::{AlertRule, ExecErrState, NoDataState, RuleKey};
use crate::sink::PostableAlert;
use crate::store::StateStore;
use crate::template::{RuleTemplateData, TemplateEngine};

/// Alert name used for instances in the dedicated `NoData` state.
pub const NO_DATA_ALERT_NAME: &str = "DatasourceNoData";
/// Alert name used for instances in the dedicated `Error` state.
pub const ERROR_ALERT_NAME: &str = "DatasourceError";

/// Configuration for the [`StateTracker`].
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How long resolved instances stay visible.
    pub resolved_retention: Duration,
    /// Minimum time between re-sends of an unchanged firing alert.
    pub resend_delay: Duration,
    /// Base URL used in generator links.
    pub external_url: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            resolved_retention: Duration::from_secs(15 * 60),
            resend_delay: Duration::from_secs(30),
            external_url: "http://localhost:3000".to_string(),
        }
    }
}

impl TrackerConfig {
    /// Sets the resolved retention.
    #[must_use]
    pub const fn with_resolved_retention(mut self, retention: Duration) -> Self {
        self.resolved_retention = retention;
        self
    }

    /// Sets the resend delay.
    #[must_use]
    pub const fn with_resend_delay(mut self, delay: Duration) -> Self {
        self.resend_delay = delay;
        self
    }

    /// Sets the external URL.
    #[must_use]
    pub fn with_external_url(mut self, url: impl Into<String>) -> Self {
        self.external_url = url.into();
        self
    }
}

/// One instance after processing, with the state it had before.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// State before this evaluation.
    pub previous: InstanceState,
    /// The instance after this evaluation.
    pub instance: AlertInstance,
}

impl Transition {
    /// True if the state changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.previous != self.instance.state
    }
}

/// Result of processing one evaluation.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    /// Every instance touched by the evaluation.
    pub transitions: Vec<Transition>,
    /// Alerts to hand to notification routing.
    pub alerts: Vec<PostableAlert>,
    /// Instances dropped from the cache and store.
    pub removed: Vec<InstanceKey>,
}

type RuleStates = HashMap<Fingerprint, AlertInstance>;

/// Tracks alert instance state for every rule evaluated by this process.
pub struct StateTracker {
    cache: Arc<RwLock<HashMap<RuleKey, RuleStates>>>,
    store: Arc<dyn StateStore>,
    templates: Arc<TemplateEngine>,
    config: TrackerConfig,
    metrics: AlertingMetrics,
}

impl std::fmt::Debug for StateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTracker")
            .field("rules", &self.cache.read().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StateTracker {
    /// Creates a tracker writing to `store`.
    pub fn new(store: Arc<dyn StateStore>, config: TrackerConfig, metrics: AlertingMetrics) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            store,
            templates: Arc::new(TemplateEngine::new()),
            config,
            metrics,
        }
    }

    /// Returns the tracker configuration.
    #[must_use]
    pub const fn config(&self) -> &TrackerConfig {
        &self.config
    }

    // ============ Cache management ============

    /// Replaces the cache with the contents of the state store.
    ///
    /// Called when this process becomes the evaluator so that instances that
    /// were already firing keep their `starts_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn warm(&self) -> crate::Result<usize> {
        let instances = self.store.list_all().await?;
        let count = instances.len();
        let mut cache: HashMap<RuleKey, RuleStates> = HashMap::new();
        for instance in instances {
            cache
                .entry(instance.rule.clone())
                .or_default()
                .insert(instance.fingerprint, instance);
        }
        *self.cache.write() = cache;
        info!(instances = count, "warmed state cache from store");
        Ok(count)
    }

    /// Drops all cached state without touching the store.
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    /// Instances of one rule.
    #[must_use]
    pub fn instances(&self, rule: &RuleKey) -> Vec<AlertInstance> {
        self.cache
            .read()
            .get(rule)
            .map(|states| states.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every cached instance.
    #[must_use]
    pub fn all_instances(&self) -> Vec<AlertInstance> {
        self.cache
            .read()
            .values()
            .flat_map(|states| states.values().cloned())
            .collect()
    }

    /// Forgets a rule, deleting its instances and resolving the firing ones.
    pub async fn delete_rule(
        &self,
        rule: &RuleKey,
        reason: StateReason,
        now: DateTime<Utc>,
    ) -> Vec<PostableAlert> {
        let removed = self.cache.write().remove(rule).unwrap_or_default();
        let alerts: Vec<PostableAlert> = removed
            .values()
            .filter(|i| i.state.is_firing())
            .map(|i| {
                let mut resolved = i.clone();
                resolved.state_reason = Some(reason);
                self.resolved_alert(&resolved, i.state, i.starts_at, now)
            })
            .collect();
        if let Err(e) = self.store.delete_rule(rule).await {
            warn!(rule = %rule, error = %e, "failed to delete instances of removed rule");
            self.metrics.inc_state_store_failures();
        }
        if !removed.is_empty() {
            debug!(rule = %rule, instances = removed.len(), resolved = alerts.len(), "dropped rule state");
        }
        alerts
    }

    // ============ Processing ============

    /// Applies an evaluation to the rule's instances.
    ///
    /// Every touched instance is written to the store before this returns;
    /// the returned alerts are ready for the notification sink.
    pub async fn process(&self, rule: &AlertRule, eval: &Evaluation) -> ProcessOutcome {
        let now = eval.evaluated_at;
        let mut outcome = ProcessOutcome::default();

        {
            let mut cache = self.cache.write();
            let states = cache.entry(rule.key()).or_default();
            let mut seen: HashSet<Fingerprint> = HashSet::new();

            let blanket = eval.results.len() == 1
                && eval.results[0].labels.is_empty()
                && matches!(eval.results[0].state, ResultState::NoData | ResultState::Error)
                && !states.is_empty();

            if blanket {
                // A label-less NoData/Error result applies to every known series.
                let result = &eval.results[0];
                for instance in states.values_mut() {
                    seen.insert(instance.fingerprint);
                    self.step(rule, instance, result, eval, &mut outcome);
                }
            } else {
                for result in &eval.results {
                    let labels = self.instance_labels(rule, result);
                    let fingerprint = labels.fingerprint();
                    if !seen.insert(fingerprint) {
                        continue;
                    }
                    let instance = states.entry(fingerprint).or_insert_with(|| {
                        AlertInstance::new(rule.key(), rule.folder_uid.clone(), labels, now)
                    });
                    self.step(rule, instance, result, eval, &mut outcome);
                }
            }

            self.expire(rule, states, &seen, now, &mut outcome);
        }

        self.persist(&outcome).await;
        self.record_gauges(rule.org_id);
        outcome
    }

    fn step(
        &self,
        rule: &AlertRule,
        instance: &mut AlertInstance,
        result: &EvalResult,
        eval: &Evaluation,
        outcome: &mut ProcessOutcome,
    ) {
        let now = eval.evaluated_at;
        let previous = instance.state;
        let previous_start = instance.starts_at;

        apply_result(rule, instance, result, now);
        instance.last_evaluation_at = now;
        instance.evaluation_duration = eval.duration;
        instance.values.clone_from(&result.values);
        instance.error.clone_from(&result.error);
        instance.annotations = self.instance_annotations(rule, instance, result);
        instance.version += 1;

        let current = instance.state;
        if current.is_firing() {
            if previous.is_firing() && notification_name(previous) != notification_name(current) {
                outcome
                    .alerts
                    .push(self.resolved_alert(instance, previous, previous_start, now));
            }
            let due = instance.last_sent_at.is_none_or(|sent| {
                now.signed_duration_since(sent) >= chrono_duration(self.config.resend_delay)
            });
            if previous != current || due {
                let validity = rule.interval.max(self.config.resend_delay) * 4;
                instance.ends_at = now + chrono_duration(validity);
                instance.last_sent_at = Some(now);
                outcome.alerts.push(self.firing_alert(instance));
            }
        } else if previous.is_firing() {
            instance.last_sent_at = Some(now);
            outcome
                .alerts
                .push(self.resolved_alert(instance, previous, previous_start, now));
        }

        if previous != current {
            debug!(
                rule_uid = %rule.uid,
                fingerprint = %instance.fingerprint,
                from = %previous,
                to = %current,
                "alert instance changed state"
            );
        }
        outcome.transitions.push(Transition {
            previous,
            instance: instance.clone(),
        });
    }

    /// Drops series that stopped reporting and resolved instances past retention.
    fn expire(
        &self,
        rule: &AlertRule,
        states: &mut RuleStates,
        seen: &HashSet<Fingerprint>,
        now: DateTime<Utc>,
        outcome: &mut ProcessOutcome,
    ) {
        let stale_after = chrono_duration(rule.interval.max(Duration::from_secs(1)) * 2);
        let retention = chrono_duration(self.config.resolved_retention);

        let stale: Vec<Fingerprint> = states
            .values()
            .filter(|i| {
                !seen.contains(&i.fingerprint)
                    && now.signed_duration_since(i.last_evaluation_at) >= stale_after
            })
            .map(|i| i.fingerprint)
            .collect();
        for fingerprint in stale {
            let Some(mut instance) = states.remove(&fingerprint) else {
                continue;
            };
            let previous = instance.state;
            if previous.is_firing() {
                outcome
                    .alerts
                    .push(self.resolved_alert(&instance, previous, instance.starts_at, now));
                instance.resolved_at = Some(now);
                instance.ends_at = now;
            }
            instance.state = InstanceState::Normal;
            instance.state_reason = Some(StateReason::MissingSeries);
            debug!(rule_uid = %rule.uid, fingerprint = %fingerprint, "series went missing");
            outcome.removed.push(instance.key());
            outcome.transitions.push(Transition { previous, instance });
        }

        let expired: Vec<Fingerprint> = states
            .values()
            .filter(|i| {
                i.state == InstanceState::Normal
                    && i.resolved_at
                        .is_some_and(|at| now.signed_duration_since(at) >= retention)
            })
            .map(|i| i.fingerprint)
            .collect();
        for fingerprint in expired {
            if let Some(instance) = states.remove(&fingerprint) {
                outcome.removed.push(instance.key());
            }
        }
    }

    async fn persist(&self, outcome: &ProcessOutcome) {
        let removed: HashSet<&InstanceKey> = outcome.removed.iter().collect();
        let to_save: Vec<AlertInstance> = outcome
            .transitions
            .iter()
            .filter(|t| !removed.contains(&t.instance.key()))
            .map(|t| t.instance.clone())
            .collect();

        if !to_save.is_empty() {
            match self.store.save(&to_save).await {
                Ok(result) if !result.rejected.is_empty() => {
                    warn!(
                        rejected = result.rejected.len(),
                        "state store holds newer versions of some instances"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "failed to save alert instances");
                    self.metrics.inc_state_store_failures();
                }
            }
        }
        if !outcome.removed.is_empty() {
            if let Err(e) = self.store.delete(&outcome.removed).await {
                warn!(error = %e, "failed to delete alert instances");
                self.metrics.inc_state_store_failures();
            }
        }
    }

    fn record_gauges(&self, org_id: i64) {
        let mut counts: HashMap<InstanceState, usize> = HashMap::new();
        for (_, states) in self.cache.read().iter().filter(|(k, _)| k.org_id == org_id) {
            for instance in states.values() {
                *counts.entry(instance.state).or_default() += 1;
            }
        }
        for state in [
            InstanceState::Normal,
            InstanceState::Pending,
            InstanceState::Alerting,
            InstanceState::NoData,
            InstanceState::Error,
        ] {
            self.metrics
                .set_alert_instances(org_id, state, counts.get(&state).copied().unwrap_or(0));
        }
    }

    // ============ Labels, annotations and alerts ============

    fn instance_labels(&self, rule: &AlertRule, result: &EvalResult) -> Labels {
        let data = RuleTemplateData {
            labels: result.labels.clone(),
            value: result.values.get(&rule.condition).copied(),
            values: result.values.clone(),
        };
        let mut labels = result.labels.clone();
        for (name, value) in rule.labels.iter() {
            labels.insert(name, self.templates.expand(value, &data));
        }
        labels.insert(ALERT_NAME_LABEL, rule.title.clone());
        labels.insert(RULE_UID_LABEL, rule.uid.clone());
        labels.insert(NAMESPACE_UID_LABEL, rule.folder_uid.clone());
        labels.insert(FOLDER_LABEL, rule.folder_uid.clone());
        labels
    }

    fn instance_annotations(
        &self,
        rule: &AlertRule,
        instance: &AlertInstance,
        result: &EvalResult,
    ) -> std::collections::BTreeMap<String, String> {
        let data = RuleTemplateData {
            labels: instance.labels.clone(),
            value: result.values.get(&rule.condition).copied(),
            values: result.values.clone(),
        };
        let mut annotations: std::collections::BTreeMap<String, String> = rule
            .annotations
            .iter()
            .map(|(k, v)| (k.clone(), self.templates.expand(v, &data)))
            .collect();
        if instance.state == InstanceState::Error {
            if let Some(error) = &instance.error {
                annotations.insert("Error".to_string(), error.clone());
            }
        }
        annotations
    }

    fn generator_url(&self, rule_uid: &str) -> String {
        format!(
            "{}/alerting/rules/{rule_uid}",
            self.config.external_url.trim_end_matches('/')
        )
    }

    fn firing_alert(&self, instance: &AlertInstance) -> PostableAlert {
        PostableAlert {
            labels: notification_labels(instance, instance.state),
            annotations: instance.annotations.clone(),
            starts_at: instance.starts_at,
            ends_at: instance.ends_at,
            generator_url: self.generator_url(&instance.rule.uid),
        }
    }

    fn resolved_alert(
        &self,
        instance: &AlertInstance,
        state: InstanceState,
        starts_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> PostableAlert {
        PostableAlert {
            labels: notification_labels(instance, state),
            annotations: instance.annotations.clone(),
            starts_at,
            ends_at: now,
            generator_url: self.generator_url(&instance.rule.uid),
        }
    }
}

/// Maps one result onto an instance according to the rule's policies.
fn apply_result(rule: &AlertRule, instance: &mut AlertInstance, result: &EvalResult, now: DateTime<Utc>) {
    match result.state {
        ResultState::Firing => fire(rule, instance, now, None),
        ResultState::Normal => normal(instance, now, None),
        ResultState::NoData => match rule.no_data_state {
            NoDataState::Alerting => fire(rule, instance, now, Some(StateReason::NoData)),
            NoDataState::NoData => enter(instance, InstanceState::NoData, now),
            NoDataState::Ok => normal(instance, now, Some(StateReason::NoData)),
            NoDataState::KeepLast => instance.state_reason = Some(StateReason::NoData),
        },
        ResultState::Error => match rule.exec_err_state {
            ExecErrState::Alerting => fire(rule, instance, now, Some(StateReason::Error)),
            ExecErrState::Error => enter(instance, InstanceState::Error, now),
            ExecErrState::Ok => normal(instance, now, Some(StateReason::Error)),
            ExecErrState::KeepLast => instance.state_reason = Some(StateReason::Error),
        },
    }
}

fn fire(rule: &AlertRule, instance: &mut AlertInstance, now: DateTime<Utc>, reason: Option<StateReason>) {
    match instance.state {
        InstanceState::Alerting => {}
        InstanceState::Pending => {
            if now.signed_duration_since(instance.starts_at) >= chrono_duration(rule.for_duration) {
                instance.state = InstanceState::Alerting;
            }
        }
        InstanceState::Normal | InstanceState::NoData | InstanceState::Error => {
            instance.starts_at = now;
            instance.resolved_at = None;
            instance.state = if rule.for_duration.is_zero() {
                InstanceState::Alerting
            } else {
                InstanceState::Pending
            };
        }
    }
    instance.state_reason = reason;
}

fn normal(instance: &mut AlertInstance, now: DateTime<Utc>, reason: Option<StateReason>) {
    if instance.state.is_firing() {
        instance.resolved_at = Some(now);
        instance.ends_at = now;
    }
    if instance.state != InstanceState::Normal {
        instance.starts_at = now;
    }
    instance.state = InstanceState::Normal;
    instance.state_reason = reason;
}

fn enter(instance: &mut AlertInstance, state: InstanceState, now: DateTime<Utc>) {
    if instance.state != state {
        instance.starts_at = now;
        instance.resolved_at = None;
        instance.state = state;
    }
    instance.state_reason = None;
}

/// Alert name under which an instance in `state` is notified.
fn notification_name(state: InstanceState) -> Option<&'static str> {
    match state {
        InstanceState::NoData => Some(NO_DATA_ALERT_NAME),
        InstanceState::Error => Some(ERROR_ALERT_NAME),
        _ => None,
    }
}

fn notification_labels(instance: &AlertInstance, state: InstanceState) -> Labels {
    let mut labels = instance.labels.clone();
    if let Some(name) = notification_name(state) {
        let rule_name = labels.get(ALERT_NAME_LABEL).unwrap_or_default().to_string();
        labels.insert("rulename", rule_name);
        labels.insert(ALERT_NAME_LABEL, name);
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvalResult;
    use crate::rule::{AlertQuery, RuleGroup};
    use crate::store::MemoryStateStore;
    use std::collections::BTreeMap;

    fn rule(for_secs: u64) -> AlertRule {
        let r = AlertRule::builder("HighCPU", "A")
            .uid("rule-1")
            .query(AlertQuery::new("A", serde_json::json!({})))
            .for_duration(Duration::from_secs(for_secs))
            .label("severity", "critical")
            .annotation("summary", "{{ $labels.host }} at {{ $value }}")
            .build()
            .unwrap();
        RuleGroup::new(1, "infra", "cpu", Duration::from_secs(10), vec![r])
            .rules
            .remove(0)
    }

    fn result(state: ResultState, host: &str, value: f64) -> EvalResult {
        let mut values = BTreeMap::new();
        values.insert("A".to_string(), value);
        EvalResult {
            labels: Labels::new().with("host", host),
            state,
            values,
            error: None,
        }
    }

    fn eval(at: DateTime<Utc>, results: Vec<EvalResult>) -> Evaluation {
        Evaluation {
            evaluated_at: at,
            duration: Duration::from_millis(5),
            results,
        }
    }

    fn tracker() -> (StateTracker, MemoryStateStore) {
        let store = MemoryStateStore::new();
        let tracker = StateTracker::new(
            Arc::new(store.clone()),
            TrackerConfig::default(),
            AlertingMetrics::new(),
        );
        (tracker, store)
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    mod transition_tests {
        use super::*;

        #[tokio::test]
        async fn zero_for_fires_immediately() {
            let (tracker, _) = tracker();
            let t0 = Utc::now();
            let out = tracker
                .process(&rule(0), &eval(t0, vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            assert_eq!(out.transitions[0].instance.state, InstanceState::Alerting);
            assert_eq!(out.transitions[0].instance.starts_at, t0);
            assert_eq!(out.alerts.len(), 1);
        }

        #[tokio::test]
        async fn pending_then_alerting_keeps_pending_start() {
            let (tracker, _) = tracker();
            let r = rule(20);
            let t0 = Utc::now();
            let out = tracker
                .process(&r, &eval(t0, vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            assert_eq!(out.transitions[0].instance.state, InstanceState::Pending);
            assert!(out.alerts.is_empty());

            let out = tracker
                .process(&r, &eval(t0 + secs(10), vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            assert_eq!(out.transitions[0].instance.state, InstanceState::Pending);

            let out = tracker
                .process(&r, &eval(t0 + secs(20), vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            let instance = &out.transitions[0].instance;
            assert_eq!(instance.state, InstanceState::Alerting);
            assert_eq!(instance.starts_at, t0);
            assert_eq!(out.alerts[0].starts_at, t0);
        }

        #[tokio::test]
        async fn pending_back_to_normal() {
            let (tracker, _) = tracker();
            let r = rule(60);
            let t0 = Utc::now();
            tracker
                .process(&r, &eval(t0, vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            let out = tracker
                .process(&r, &eval(t0 + secs(10), vec![result(ResultState::Normal, "a", 0.0)]))
                .await;
            assert_eq!(out.transitions[0].instance.state, InstanceState::Normal);
            assert!(out.alerts.is_empty());
            assert!(out.transitions[0].instance.resolved_at.is_none());
        }

        #[tokio::test]
        async fn alerting_to_normal_sends_resolved() {
            let (tracker, _) = tracker();
            let r = rule(0);
            let t0 = Utc::now();
            tracker
                .process(&r, &eval(t0, vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            let t1 = t0 + secs(10);
            let out = tracker
                .process(&r, &eval(t1, vec![result(ResultState::Normal, "a", 0.0)]))
                .await;
            let instance = &out.transitions[0].instance;
            assert_eq!(instance.state, InstanceState::Normal);
            assert_eq!(instance.resolved_at, Some(t1));
            assert_eq!(out.alerts.len(), 1);
            assert_eq!(out.alerts[0].starts_at, t0);
            assert!(out.alerts[0].is_resolved_at(t1));
        }

        #[tokio::test]
        async fn starts_at_stable_while_alerting() {
            let (tracker, _) = tracker();
            let r = rule(0);
            let t0 = Utc::now();
            for i in 0..5 {
                let out = tracker
                    .process(&r, &eval(t0 + secs(i * 10), vec![result(ResultState::Firing, "a", 1.0)]))
                    .await;
                assert_eq!(out.transitions[0].instance.starts_at, t0);
            }
        }
    }

    mod policy_tests {
        use super::*;

        fn no_data_rule(policy: NoDataState) -> AlertRule {
            let mut r = rule(0);
            r.no_data_state = policy;
            r
        }

        #[tokio::test]
        async fn no_data_dedicated_state_uses_datasource_alert_name() {
            let (tracker, _) = tracker();
            let out = tracker
                .process(
                    &no_data_rule(NoDataState::NoData),
                    &eval(Utc::now(), vec![EvalResult::no_data()]),
                )
                .await;
            assert_eq!(out.transitions[0].instance.state, InstanceState::NoData);
            assert_eq!(out.alerts[0].labels.get(ALERT_NAME_LABEL), Some(NO_DATA_ALERT_NAME));
            assert_eq!(out.alerts[0].labels.get("rulename"), Some("HighCPU"));
        }

        #[tokio::test]
        async fn no_data_alerting_fires() {
            let (tracker, _) = tracker();
            let out = tracker
                .process(
                    &no_data_rule(NoDataState::Alerting),
                    &eval(Utc::now(), vec![EvalResult::no_data()]),
                )
                .await;
            let instance = &out.transitions[0].instance;
            assert_eq!(instance.state, InstanceState::Alerting);
            assert_eq!(instance.state_reason, Some(StateReason::NoData));
        }

        #[tokio::test]
        async fn no_data_ok_is_normal() {
            let (tracker, _) = tracker();
            let out = tracker
                .process(
                    &no_data_rule(NoDataState::Ok),
                    &eval(Utc::now(), vec![EvalResult::no_data()]),
                )
                .await;
            assert_eq!(out.transitions[0].instance.state, InstanceState::Normal);
            assert!(out.alerts.is_empty());
        }

        #[tokio::test]
        async fn keep_last_applies_to_existing_series() {
            let (tracker, _) = tracker();
            let r = no_data_rule(NoDataState::KeepLast);
            let t0 = Utc::now();
            tracker
                .process(&r, &eval(t0, vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            let out = tracker
                .process(&r, &eval(t0 + secs(10), vec![EvalResult::no_data()]))
                .await;
            assert_eq!(out.transitions.len(), 1);
            let instance = &out.transitions[0].instance;
            assert_eq!(instance.state, InstanceState::Alerting);
            assert_eq!(instance.starts_at, t0);
            assert_eq!(instance.labels.get("host"), Some("a"));
        }

        #[tokio::test]
        async fn error_state_records_message() {
            let (tracker, _) = tracker();
            let out = tracker
                .process(&rule(0), &eval(Utc::now(), vec![EvalResult::error("datasource down")]))
                .await;
            let instance = &out.transitions[0].instance;
            assert_eq!(instance.state, InstanceState::Error);
            assert_eq!(instance.error.as_deref(), Some("datasource down"));
            assert_eq!(out.alerts[0].labels.get(ALERT_NAME_LABEL), Some(ERROR_ALERT_NAME));
            assert_eq!(
                out.alerts[0].annotations.get("Error").map(String::as_str),
                Some("datasource down")
            );
        }

        #[tokio::test]
        async fn error_recovery_resolves_datasource_alert() {
            let (tracker, _) = tracker();
            let r = rule(0);
            let t0 = Utc::now();
            tracker
                .process(&r, &eval(t0, vec![EvalResult::error("down")]))
                .await;
            let mut ok = EvalResult::error("");
            ok.state = ResultState::Normal;
            ok.error = None;
            let out = tracker.process(&r, &eval(t0 + secs(10), vec![ok])).await;
            assert_eq!(out.alerts.len(), 1);
            assert_eq!(out.alerts[0].labels.get(ALERT_NAME_LABEL), Some(ERROR_ALERT_NAME));
            assert!(out.alerts[0].is_resolved_at(t0 + secs(10)));
        }
    }

    mod lifecycle_tests {
        use super::*;

        #[tokio::test]
        async fn missing_series_resolves_after_two_intervals() {
            let (tracker, store) = tracker();
            let r = rule(0);
            let t0 = Utc::now();
            tracker
                .process(
                    &r,
                    &eval(
                        t0,
                        vec![
                            result(ResultState::Firing, "a", 1.0),
                            result(ResultState::Firing, "b", 1.0),
                        ],
                    ),
                )
                .await;
            let out = tracker
                .process(&r, &eval(t0 + secs(10), vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            assert!(out.removed.is_empty());

            let out = tracker
                .process(&r, &eval(t0 + secs(20), vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            assert_eq!(out.removed.len(), 1);
            let resolved: Vec<_> = out
                .alerts
                .iter()
                .filter(|a| a.is_resolved_at(t0 + secs(20)))
                .collect();
            assert_eq!(resolved.len(), 1);
            assert_eq!(resolved[0].labels.get("host"), Some("b"));
            assert_eq!(store.len(), 1);
        }

        #[tokio::test]
        async fn resolved_instances_expire_after_retention() {
            let store = MemoryStateStore::new();
            let tracker = StateTracker::new(
                Arc::new(store.clone()),
                TrackerConfig::default().with_resolved_retention(Duration::from_secs(30)),
                AlertingMetrics::new(),
            );
            let r = rule(0);
            let t0 = Utc::now();
            tracker
                .process(&r, &eval(t0, vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            tracker
                .process(&r, &eval(t0 + secs(10), vec![result(ResultState::Normal, "a", 0.0)]))
                .await;
            assert_eq!(tracker.instances(&r.key()).len(), 1);
            let out = tracker
                .process(&r, &eval(t0 + secs(40), vec![result(ResultState::Normal, "a", 0.0)]))
                .await;
            assert_eq!(out.removed.len(), 1);
            assert!(tracker.instances(&r.key()).is_empty());
            assert!(store.is_empty());
        }

        #[tokio::test]
        async fn firing_alerts_are_resent_after_delay() {
            let (tracker, _) = tracker();
            let r = rule(0);
            let t0 = Utc::now();
            let firing = || vec![result(ResultState::Firing, "a", 1.0)];
            assert_eq!(tracker.process(&r, &eval(t0, firing())).await.alerts.len(), 1);
            assert!(tracker.process(&r, &eval(t0 + secs(10), firing())).await.alerts.is_empty());
            assert_eq!(
                tracker.process(&r, &eval(t0 + secs(30), firing())).await.alerts.len(),
                1
            );
        }

        #[tokio::test]
        async fn writes_reach_store_with_increasing_versions() {
            let (tracker, store) = tracker();
            let r = rule(0);
            let t0 = Utc::now();
            tracker
                .process(&r, &eval(t0, vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            tracker
                .process(&r, &eval(t0 + secs(10), vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            let stored = store.list_for_rule(&r.key()).await.unwrap();
            assert_eq!(stored.len(), 1);
            assert_eq!(stored[0].version, 2);
            assert_eq!(stored[0].state, InstanceState::Alerting);
        }

        #[tokio::test]
        async fn warm_restores_starts_at() {
            let store = MemoryStateStore::new();
            let r = rule(0);
            let t0 = Utc::now();
            let first = StateTracker::new(
                Arc::new(store.clone()),
                TrackerConfig::default(),
                AlertingMetrics::new(),
            );
            first
                .process(&r, &eval(t0, vec![result(ResultState::Firing, "a", 1.0)]))
                .await;

            let second = StateTracker::new(
                Arc::new(store.clone()),
                TrackerConfig::default(),
                AlertingMetrics::new(),
            );
            assert_eq!(second.warm().await.unwrap(), 1);
            let out = second
                .process(&r, &eval(t0 + secs(10), vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            assert_eq!(out.transitions[0].instance.starts_at, t0);
            assert_eq!(out.transitions[0].instance.version, 2);
        }

        #[tokio::test]
        async fn delete_rule_resolves_firing_instances() {
            let (tracker, store) = tracker();
            let r = rule(0);
            let t0 = Utc::now();
            tracker
                .process(&r, &eval(t0, vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            let alerts = tracker
                .delete_rule(&r.key(), StateReason::RuleDeleted, t0 + secs(5))
                .await;
            assert_eq!(alerts.len(), 1);
            assert!(alerts[0].is_resolved_at(t0 + secs(5)));
            assert!(store.is_empty());
            assert!(tracker.all_instances().is_empty());
        }
    }

    mod label_tests {
        use super::*;

        #[tokio::test]
        async fn instance_labels_include_reserved_and_templates() {
            let (tracker, _) = tracker();
            let out = tracker
                .process(&rule(0), &eval(Utc::now(), vec![result(ResultState::Firing, "web-1", 97.0)]))
                .await;
            let instance = &out.transitions[0].instance;
            assert_eq!(instance.labels.get(ALERT_NAME_LABEL), Some("HighCPU"));
            assert_eq!(instance.labels.get(RULE_UID_LABEL), Some("rule-1"));
            assert_eq!(instance.labels.get(NAMESPACE_UID_LABEL), Some("infra"));
            assert_eq!(instance.labels.get("severity"), Some("critical"));
            assert!(instance.annotations["summary"].starts_with("web-1 at 97"));
        }

        #[tokio::test]
        async fn generator_url_points_at_rule() {
            let (tracker, _) = tracker();
            let out = tracker
                .process(&rule(0), &eval(Utc::now(), vec![result(ResultState::Firing, "a", 1.0)]))
                .await;
            assert_eq!(out.alerts[0].generator_url, "http://localhost:3000/alerting/rules/rule-1");
        }
    }
}
