//! Aggregation groups and the notification pipeline.
//!
//! Incoming alerts are routed through the [`RouteTree`] and collected into
//! aggregation groups, one per route node and distinct set of grouping
//! labels. Each group has its own timer: the first flush happens
//! `group_wait` after the group was created, later flushes every
//! `group_interval`. A flush filters silenced and inhibited alerts, holds
//! the group back while one of its route's mute timings is active, and emits
//! a [`Notification`] when the set of firing alerts changed, a previously
//! notified alert resolved, or `repeat_interval` passed since the last send.
//! A group holding silenced alerts is also flushed the moment the earliest
//! of those silences ends.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};
use vigil_alerts::clock::chrono_duration;
use vigil_alerts::{Fingerprint, Labels, PostableAlert};

use crate::config::AlertmanagerConfig;
use crate::error::Result;
use crate::inhibit::Inhibitor;
use crate::mute::CompiledMuteTiming;
use crate::route::{RouteNode, RouteTree};

/// Status of an alert or a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// Still firing.
    Firing,
    /// Resolved.
    Resolved,
}

impl AlertStatus {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

/// A batch of alerts for one receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Receiver to deliver to.
    pub receiver: String,
    /// Aggregation group key.
    pub group_key: String,
    /// Grouping labels of the group.
    pub group_labels: Labels,
    /// Firing alerts followed by resolved ones.
    pub alerts: Vec<PostableAlert>,
    /// Flush time; alert status is relative to it.
    pub at: DateTime<Utc>,
}

impl Notification {
    /// Status of one of the alerts.
    #[must_use]
    pub fn alert_status(&self, alert: &PostableAlert) -> AlertStatus {
        if alert.is_resolved_at(self.at) {
            AlertStatus::Resolved
        } else {
            AlertStatus::Firing
        }
    }

    /// `firing` if any alert fires, else `resolved`.
    #[must_use]
    pub fn status(&self) -> AlertStatus {
        if self.firing().next().is_some() {
            AlertStatus::Firing
        } else {
            AlertStatus::Resolved
        }
    }

    /// Firing alerts.
    pub fn firing(&self) -> impl Iterator<Item = &PostableAlert> {
        self.alerts.iter().filter(|a| !a.is_resolved_at(self.at))
    }

    /// Resolved alerts.
    pub fn resolved(&self) -> impl Iterator<Item = &PostableAlert> {
        self.alerts.iter().filter(|a| a.is_resolved_at(self.at))
    }
}

/// Read-only view of an aggregation group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    /// Group key.
    pub key: String,
    /// Receiver of the group's route.
    pub receiver: String,
    /// Grouping labels.
    pub labels: Labels,
    /// Alerts currently in the group.
    pub alerts: Vec<PostableAlert>,
}

#[derive(Debug, Clone)]
struct AggregationGroup {
    route_id: usize,
    labels: Labels,
    alerts: BTreeMap<Fingerprint, PostableAlert>,
    next_flush: DateTime<Utc>,
    last_notified: Option<DateTime<Utc>>,
    notified_firing: BTreeSet<Fingerprint>,
    silenced_until: Option<DateTime<Utc>>,
}

/// Routing, grouping and suppression for one organisation.
#[derive(Debug)]
pub struct Pipeline {
    tree: RouteTree,
    inhibitor: Inhibitor,
    mute_timings: HashMap<String, CompiledMuteTiming>,
    alerts: HashMap<Fingerprint, PostableAlert>,
    groups: HashMap<String, AggregationGroup>,
    timers: BTreeSet<(DateTime<Utc>, String)>,
}

fn compile(config: &AlertmanagerConfig) -> Result<(RouteTree, Inhibitor, HashMap<String, CompiledMuteTiming>)> {
    let routing = &config.alertmanager_config;
    let tree = RouteTree::new(&routing.route)?;
    let inhibitor = Inhibitor::new(routing.inhibit_rules.clone());
    let mute_timings = routing
        .mute_time_intervals
        .iter()
        .map(|t| t.compile().map(|c| (t.name.clone(), c)))
        .collect::<Result<HashMap<_, _>>>()?;
    Ok((tree, inhibitor, mute_timings))
}

fn group_key(node: &RouteNode, labels: &Labels) -> String {
    format!("{}:{}", node.key, labels)
}

impl Pipeline {
    /// Creates an empty pipeline for a configuration.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::InvalidConfig` if the routing tree or a mute
    /// timing cannot be compiled.
    pub fn new(config: &AlertmanagerConfig) -> Result<Self> {
        let (tree, inhibitor, mute_timings) = compile(config)?;
        Ok(Self {
            tree,
            inhibitor,
            mute_timings,
            alerts: HashMap::new(),
            groups: HashMap::new(),
            timers: BTreeSet::new(),
        })
    }

    /// The routing tree in use.
    #[must_use]
    pub const fn tree(&self) -> &RouteTree {
        &self.tree
    }

    /// Swaps in a new configuration, re-routing every held alert.
    ///
    /// Groups whose key survives keep their timer and notification state;
    /// new groups start their `group_wait`.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the pipeline unchanged, if the configuration
    /// cannot be compiled.
    pub fn reconfigure(&mut self, config: &AlertmanagerConfig, now: DateTime<Utc>) -> Result<()> {
        let (tree, inhibitor, mute_timings) = compile(config)?;
        self.tree = tree;
        self.inhibitor = inhibitor;
        self.mute_timings = mute_timings;

        let mut old = std::mem::take(&mut self.groups);
        self.timers.clear();
        let alerts: Vec<PostableAlert> = self.alerts.values().cloned().collect();
        for alert in alerts {
            self.route_alert(alert, now, &mut old);
        }
        debug!(groups = self.groups.len(), alerts = self.alerts.len(), "pipeline reconfigured");
        Ok(())
    }

    /// Adds or updates alerts.
    ///
    /// An alert already held keeps its original start time unless the held
    /// copy had resolved, in which case the new one starts a new episode.
    pub fn insert(&mut self, alerts: Vec<PostableAlert>, now: DateTime<Utc>) {
        let mut none = HashMap::new();
        for mut alert in alerts {
            let fp = alert.fingerprint();
            if let Some(existing) = self.alerts.get(&fp) {
                if !existing.is_resolved_at(now) && existing.starts_at < alert.starts_at {
                    alert.starts_at = existing.starts_at;
                }
            }
            self.alerts.insert(fp, alert.clone());
            self.route_alert(alert, now, &mut none);
        }
    }

    fn route_alert(
        &mut self,
        alert: PostableAlert,
        now: DateTime<Utc>,
        previous: &mut HashMap<String, AggregationGroup>,
    ) {
        let fp = alert.fingerprint();
        let nodes: Vec<(usize, String, Labels, std::time::Duration)> = self
            .tree
            .route(&alert.labels)
            .into_iter()
            .map(|node| {
                let labels = node.group_by.group_labels(&alert.labels);
                (node.id, group_key(node, &labels), labels, node.group_wait)
            })
            .collect();

        for (route_id, key, labels, group_wait) in nodes {
            if !self.groups.contains_key(&key) {
                let group = previous.remove(&key).map_or_else(
                    || {
                        trace!(group = %key, "new aggregation group");
                        AggregationGroup {
                            route_id,
                            labels,
                            alerts: BTreeMap::new(),
                            next_flush: now + chrono_duration(group_wait),
                            last_notified: None,
                            notified_firing: BTreeSet::new(),
                            silenced_until: None,
                        }
                    },
                    |mut carried| {
                        carried.route_id = route_id;
                        carried.alerts.clear();
                        carried
                    },
                );
                self.timers.insert((group.next_flush, key.clone()));
                self.groups.insert(key.clone(), group);
            }
            if let Some(group) = self.groups.get_mut(&key) {
                group.alerts.insert(fp, alert.clone());
            }
        }
    }

    /// Time of the next due flush.
    #[must_use]
    pub fn next_flush(&self) -> Option<DateTime<Utc>> {
        self.timers.first().map(|(at, _)| *at)
    }

    /// Flushes every group whose timer is due.
    ///
    /// `silenced_until` is asked about each alert at flush time and returns
    /// when the silences muting it end, or `None` if it is not silenced.
    pub fn flush_due(
        &mut self,
        now: DateTime<Utc>,
        silenced_until: impl Fn(&Labels) -> Option<DateTime<Utc>>,
    ) -> Vec<Notification> {
        let mut due = Vec::new();
        while let Some((at, _)) = self.timers.first() {
            if *at > now {
                break;
            }
            if let Some((at, key)) = self.timers.pop_first() {
                due.push((at, key));
            }
        }
        if due.is_empty() {
            return Vec::new();
        }

        let firing: Vec<Labels> = self
            .alerts
            .values()
            .filter(|a| !a.is_resolved_at(now) && silenced_until(&a.labels).is_none())
            .map(|a| a.labels.clone())
            .collect();

        let mut out = Vec::new();
        for (at, key) in due {
            let Some(group) = self.groups.get(&key) else {
                continue;
            };
            if group.next_flush != at {
                continue;
            }
            let Some(node) = self.tree.node(group.route_id).cloned() else {
                continue;
            };

            if self.is_muted(&node, now) {
                debug!(group = %key, receiver = %node.receiver, "group muted by time interval");
                self.reschedule(&key, now + chrono_duration(node.group_interval));
                continue;
            }

            if let Some(notification) = self.flush_group(&key, &node, &firing, &silenced_until, now) {
                out.push(notification);
            }

            match self.groups.get(&key) {
                None => {}
                Some(group) if group.alerts.is_empty() => {
                    self.groups.remove(&key);
                    trace!(group = %key, "aggregation group removed");
                }
                Some(group) => {
                    let interval = now + chrono_duration(node.group_interval);
                    let next = group
                        .silenced_until
                        .filter(|until| *until > now && *until < interval)
                        .unwrap_or(interval);
                    self.reschedule(&key, next);
                }
            }
        }

        let groups = &self.groups;
        self.alerts.retain(|fp, alert| {
            !alert.is_resolved_at(now) || groups.values().any(|g| g.alerts.contains_key(fp))
        });
        out
    }

    fn flush_group(
        &mut self,
        key: &str,
        node: &RouteNode,
        firing_labels: &[Labels],
        silenced_until: &impl Fn(&Labels) -> Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Notification> {
        let inhibitor = &self.inhibitor;
        let group = self.groups.get_mut(key)?;

        let mut firing = Vec::new();
        let mut released_at: Option<DateTime<Utc>> = None;
        for alert in group.alerts.values().filter(|a| !a.is_resolved_at(now)) {
            if let Some(until) = silenced_until(&alert.labels) {
                released_at = Some(released_at.map_or(until, |at| at.min(until)));
            } else if !inhibitor.is_inhibited(&alert.labels, firing_labels) {
                firing.push(alert.clone());
            }
        }
        group.silenced_until = released_at;
        let resolved: Vec<PostableAlert> = group
            .alerts
            .values()
            .filter(|a| a.is_resolved_at(now) && group.notified_firing.contains(&a.fingerprint()))
            .cloned()
            .collect();
        let firing_set: BTreeSet<Fingerprint> = firing.iter().map(PostableAlert::fingerprint).collect();

        let send = if firing.is_empty() && resolved.is_empty() {
            false
        } else if firing_set != group.notified_firing {
            true
        } else {
            group.last_notified.is_none_or(|last| {
                now >= last + chrono_duration(node.repeat_interval)
            })
        };

        group.alerts.retain(|_, a| !a.is_resolved_at(now));

        if !send {
            group.notified_firing = firing_set;
            return None;
        }
        group.notified_firing = firing_set;
        group.last_notified = Some(now);

        debug!(
            group = %key,
            receiver = %node.receiver,
            firing = firing.len(),
            resolved = resolved.len(),
            "flushing aggregation group"
        );
        let mut alerts = firing;
        alerts.extend(resolved);
        Some(Notification {
            receiver: node.receiver.clone(),
            group_key: key.to_string(),
            group_labels: group.labels.clone(),
            alerts,
            at: now,
        })
    }

    /// Makes every group holding silenced alerts due at `now`.
    ///
    /// Called when the silences change, so that a silence expired or
    /// shortened before its scheduled end releases its alerts right away.
    pub fn recheck_silenced(&mut self, now: DateTime<Utc>) {
        let keys: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, g)| g.silenced_until.is_some() && g.next_flush > now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            trace!(group = %key, "silences changed, flushing early");
            self.reschedule(&key, now);
        }
    }

    fn is_muted(&self, node: &RouteNode, now: DateTime<Utc>) -> bool {
        node.mute_time_intervals
            .iter()
            .filter_map(|name| self.mute_timings.get(name))
            .any(|t| t.contains(now))
    }

    fn reschedule(&mut self, key: &str, at: DateTime<Utc>) {
        if let Some(group) = self.groups.get_mut(key) {
            self.timers.remove(&(group.next_flush, key.to_string()));
            group.next_flush = at;
            self.timers.insert((at, key.to_string()));
        }
    }

    /// Every held alert.
    #[must_use]
    pub fn alerts(&self) -> Vec<PostableAlert> {
        let mut alerts: Vec<PostableAlert> = self.alerts.values().cloned().collect();
        alerts.sort_by_key(PostableAlert::fingerprint);
        alerts
    }

    /// Receivers an alert routes to.
    #[must_use]
    pub fn receivers(&self, labels: &Labels) -> Vec<String> {
        let mut receivers: Vec<String> =
            self.tree.route(labels).into_iter().map(|n| n.receiver.clone()).collect();
        receivers.dedup();
        receivers
    }

    /// Fingerprints of the firing alerts inhibiting `labels` at `now`.
    #[must_use]
    pub fn inhibited_by(&self, labels: &Labels, now: DateTime<Utc>) -> Vec<Fingerprint> {
        if self.inhibitor.is_empty() {
            return Vec::new();
        }
        let firing: Vec<Labels> = self
            .alerts
            .values()
            .filter(|a| !a.is_resolved_at(now))
            .map(|a| a.labels.clone())
            .collect();
        self.inhibitor.inhibited_by(labels, &firing)
    }

    /// Every aggregation group, sorted by key.
    #[must_use]
    pub fn groups(&self) -> Vec<GroupView> {
        let mut views: Vec<GroupView> = self
            .groups
            .iter()
            .map(|(key, g)| GroupView {
                key: key.clone(),
                receiver: self
                    .tree
                    .node(g.route_id)
                    .map(|n| n.receiver.clone())
                    .unwrap_or_default(),
                labels: g.labels.clone(),
                alerts: g.alerts.values().cloned().collect(),
            })
            .collect();
        views.sort_by(|a, b| a.key.cmp(&b.key));
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap as Map;
    use std::time::Duration;

    fn config(value: serde_json::Value) -> AlertmanagerConfig {
        serde_json::from_value(json!({ "alertmanager_config": value })).unwrap()
    }

    fn basic() -> AlertmanagerConfig {
        config(json!({
            "route": {
                "receiver": "ops",
                "group_by": ["alertname"],
                "group_wait": "30s",
                "group_interval": "5m",
                "repeat_interval": "1h"
            },
            "receivers": [{"name": "ops"}]
        }))
    }

    fn alert(name: &str, host: &str, now: DateTime<Utc>) -> PostableAlert {
        PostableAlert {
            labels: Labels::new().with("alertname", name).with("host", host),
            annotations: Map::new(),
            starts_at: now,
            ends_at: now + chrono::Duration::minutes(10),
            generator_url: String::new(),
        }
    }

    fn resolved(mut a: PostableAlert, at: DateTime<Utc>) -> PostableAlert {
        a.ends_at = at;
        a
    }

    fn after(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
        now + chrono_duration(Duration::from_secs(secs))
    }

    fn never(_: &Labels) -> Option<DateTime<Utc>> {
        None
    }

    mod grouping_tests {
        use super::*;

        #[test]
        fn first_flush_waits_for_group_wait() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            p.insert(vec![alert("HighCPU", "a", now), alert("HighCPU", "b", now)], now);

            assert!(p.flush_due(after(now, 29), never).is_empty());
            let sent = p.flush_due(after(now, 30), never);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].alerts.len(), 2);
            assert_eq!(sent[0].receiver, "ops");
            assert_eq!(sent[0].group_labels, Labels::new().with("alertname", "HighCPU"));
            assert_eq!(sent[0].status(), AlertStatus::Firing);
        }

        #[test]
        fn distinct_group_labels_form_distinct_groups() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            p.insert(vec![alert("HighCPU", "a", now), alert("Disk", "a", now)], now);
            assert_eq!(p.groups().len(), 2);
            assert_eq!(p.flush_due(after(now, 30), never).len(), 2);
        }

        #[test]
        fn unchanged_group_waits_for_repeat_interval() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            let mut a = alert("HighCPU", "a", now);
            a.ends_at = after(now, 7200);
            p.insert(vec![a], now);
            assert_eq!(p.flush_due(after(now, 30), never).len(), 1);

            // group_interval flushes with nothing new send nothing
            assert!(p.flush_due(after(now, 330), never).is_empty());
            // repeat_interval reached at a later group_interval boundary
            let mut t = 330;
            let mut repeats = 0;
            while t < 30 + 3600 + 300 {
                t += 300;
                repeats += p.flush_due(after(now, t), never).len();
            }
            assert_eq!(repeats, 1);
        }

        #[test]
        fn new_alert_in_group_sends_at_group_interval() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            p.insert(vec![alert("HighCPU", "a", now)], now);
            p.flush_due(after(now, 30), never);

            p.insert(vec![alert("HighCPU", "b", after(now, 60))], after(now, 60));
            assert!(p.flush_due(after(now, 120), never).is_empty());
            let sent = p.flush_due(after(now, 330), never);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].alerts.len(), 2);
        }

        #[test]
        fn resolution_of_notified_alert_is_sent_then_group_dropped() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            let a = alert("HighCPU", "a", now);
            p.insert(vec![a.clone()], now);
            p.flush_due(after(now, 30), never);

            p.insert(vec![resolved(a, after(now, 60))], after(now, 60));
            let sent = p.flush_due(after(now, 330), never);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].status(), AlertStatus::Resolved);
            assert_eq!(sent[0].resolved().count(), 1);
            assert!(p.groups().is_empty());
            assert!(p.alerts().is_empty());
        }

        #[test]
        fn resolution_of_unnotified_alert_is_dropped() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            let a = alert("HighCPU", "a", now);
            p.insert(vec![a.clone()], now);
            p.insert(vec![resolved(a, after(now, 10))], after(now, 10));
            assert!(p.flush_due(after(now, 30), never).is_empty());
            assert!(p.groups().is_empty());
        }

        #[test]
        fn update_keeps_original_start() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            p.insert(vec![alert("HighCPU", "a", now)], now);
            p.insert(vec![alert("HighCPU", "a", after(now, 60))], after(now, 60));
            assert_eq!(p.alerts()[0].starts_at, now);
        }
    }

    mod suppression_tests {
        use super::*;

        #[test]
        fn silenced_alerts_are_not_sent() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            p.insert(vec![alert("HighCPU", "a", now), alert("HighCPU", "b", now)], now);
            let until = after(now, 3600);
            let sent = p.flush_due(after(now, 30), |l: &Labels| (l.get("host") == Some("a")).then_some(until));
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].alerts.len(), 1);
            assert_eq!(sent[0].alerts[0].labels.get("host"), Some("b"));
        }

        #[test]
        fn fully_silenced_group_sends_nothing() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            p.insert(vec![alert("HighCPU", "a", now)], now);
            let until = after(now, 3600);
            assert!(p.flush_due(after(now, 30), |_: &Labels| Some(until)).is_empty());
            assert_eq!(p.groups().len(), 1);
        }

        #[test]
        fn silenced_group_flushes_when_silence_ends() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            let mut a = alert("HighCPU", "a", now);
            a.ends_at = after(now, 7200);
            p.insert(vec![a], now);

            // Silenced until +100s, well inside the 5m group interval.
            let ends = after(now, 100);
            let silenced = move |t: DateTime<Utc>| move |_: &Labels| (t < ends).then_some(ends);
            assert!(p.flush_due(after(now, 30), silenced(after(now, 30))).is_empty());
            assert_eq!(p.next_flush(), Some(ends));

            assert!(p.flush_due(after(now, 99), silenced(after(now, 99))).is_empty());
            let sent = p.flush_due(ends, silenced(ends));
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].at, ends);
            assert_eq!(p.next_flush(), Some(after(now, 400)));
        }

        #[test]
        fn silence_ending_after_group_interval_keeps_interval() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            p.insert(vec![alert("HighCPU", "a", now)], now);
            let until = after(now, 3600);
            p.flush_due(after(now, 30), |_: &Labels| Some(until));
            assert_eq!(p.next_flush(), Some(after(now, 330)));
        }

        #[test]
        fn recheck_pulls_silenced_groups_forward() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            p.insert(vec![alert("HighCPU", "a", now), alert("Disk", "a", now)], now);
            let until = after(now, 3600);
            let sent = p.flush_due(after(now, 30), |l: &Labels| {
                (l.get("alertname") == Some("HighCPU")).then_some(until)
            });
            assert_eq!(sent.len(), 1);

            // The silence is expired early.
            p.recheck_silenced(after(now, 40));
            assert_eq!(p.next_flush(), Some(after(now, 40)));
            let sent = p.flush_due(after(now, 40), never);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].alerts[0].labels.get("alertname"), Some("HighCPU"));
        }

        #[test]
        fn inhibited_alerts_are_not_sent() {
            let cfg = config(json!({
                "route": {"receiver": "ops", "group_by": ["..."], "group_wait": "0s"},
                "receivers": [{"name": "ops"}],
                "inhibit_rules": [{
                    "source_matchers": [{"name": "severity", "value": "critical"}],
                    "target_matchers": [{"name": "severity", "value": "warning"}],
                    "equal": ["host"]
                }]
            }));
            let now = Utc::now();
            let mut p = Pipeline::new(&cfg).unwrap();
            let mut critical = alert("Down", "a", now);
            critical.labels.insert("severity", "critical");
            let mut warning = alert("Slow", "a", now);
            warning.labels.insert("severity", "warning");
            p.insert(vec![critical.clone(), warning.clone()], now);

            let sent = p.flush_due(now, never);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].alerts[0].labels, critical.labels);
            assert_eq!(p.inhibited_by(&warning.labels, now), vec![critical.fingerprint()]);
        }

        #[test]
        fn mute_timing_holds_group_back() {
            let cfg = config(json!({
                "route": {
                    "receiver": "ops",
                    "group_wait": "0s",
                    "group_interval": "1m",
                    "routes": [{
                        "receiver": "ops",
                        "object_matchers": [{"name": "alertname", "value": "HighCPU"}],
                        "mute_time_intervals": ["always"]
                    }]
                },
                "receivers": [{"name": "ops"}],
                "mute_time_intervals": [{"name": "always", "time_intervals": [{}]}]
            }));
            let now = Utc::now();
            let mut p = Pipeline::new(&cfg).unwrap();
            p.insert(vec![alert("HighCPU", "a", now), alert("Disk", "a", now)], now);
            let sent = p.flush_due(now, never);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].alerts[0].labels.get("alertname"), Some("Disk"));
            assert_eq!(p.groups().len(), 2);
        }
    }

    mod reconfigure_tests {
        use super::*;

        #[test]
        fn reconfigure_reroutes_held_alerts() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            p.insert(vec![alert("HighCPU", "a", now)], now);

            let cfg = config(json!({
                "route": {"receiver": "ops", "routes": [
                    {"receiver": "cpu", "object_matchers": [{"name": "alertname", "value": "HighCPU"}]}
                ]},
                "receivers": [{"name": "ops"}, {"name": "cpu"}]
            }));
            p.reconfigure(&cfg, after(now, 5)).unwrap();
            let groups = p.groups();
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].receiver, "cpu");
            assert_eq!(p.receivers(&groups[0].alerts[0].labels), vec!["cpu"]);
        }

        #[test]
        fn reconfigure_with_same_routes_keeps_timers() {
            let now = Utc::now();
            let mut p = Pipeline::new(&basic()).unwrap();
            p.insert(vec![alert("HighCPU", "a", now)], now);
            let before = p.next_flush();
            p.reconfigure(&basic(), after(now, 10)).unwrap();
            assert_eq!(p.next_flush(), before);
        }
    }
}
