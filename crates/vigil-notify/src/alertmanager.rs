//! The notification side of one organisation.
//!
//! An [`Alertmanager`] owns the organisation's pipeline, built receivers,
//! silences and dispatcher. Alerts come in through [`Alertmanager::put_alerts`],
//! [`Alertmanager::run`] flushes due aggregation groups and hands each
//! resulting notification to its own delivery task, so a slow receiver never
//! holds back the timers of other groups.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vigil_alerts::{Clock, Labels, Matchers, PostableAlert};

use crate::config::AlertmanagerConfig;
use crate::dispatch::{DeliveryOutcome, Dispatcher};
use crate::error::{NotifyError, Result};
use crate::integrations::{Integration, IntegrationFactory};
use crate::pipeline::{Notification, Pipeline};
use crate::silence::Silences;

/// Longest the run loop sleeps between flush checks.
const MAX_WAIT: Duration = Duration::from_secs(1);

/// How often expired silences past retention are dropped.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Reference to a receiver by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiverRef {
    /// Receiver name.
    pub name: String,
}

/// Suppression state of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// Notifications are sent.
    Active,
    /// Silenced or inhibited.
    Suppressed,
}

/// Suppression details of an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GettableAlertStatus {
    /// Active or suppressed.
    pub state: AlertState,
    /// IDs of silences muting the alert.
    pub silenced_by: Vec<String>,
    /// Fingerprints of alerts inhibiting it.
    pub inhibited_by: Vec<String>,
}

/// An alert as reported by `GET /api/v2/alerts`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GettableAlert {
    /// The alert.
    #[serde(flatten)]
    pub alert: PostableAlert,
    /// Label fingerprint.
    pub fingerprint: String,
    /// Receivers the alert routes to.
    pub receivers: Vec<ReceiverRef>,
    /// Suppression state.
    pub status: GettableAlertStatus,
}

/// An aggregation group as reported by `GET /api/v2/alerts/groups`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertGroup {
    /// Grouping labels.
    pub labels: Labels,
    /// Receiver of the group's route.
    pub receiver: ReceiverRef,
    /// Alerts still firing in the group.
    pub alerts: Vec<GettableAlert>,
}

/// Delivery state of one integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationStatus {
    /// Integration UID.
    pub uid: String,
    /// Display name.
    pub name: String,
    /// Integration type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Last delivery, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_notify_attempt: Option<DateTime<Utc>>,
    /// Error of the last delivery, if it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_notify_error: Option<String>,
}

/// Delivery state of one receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiverStatus {
    /// Receiver name.
    pub name: String,
    /// True if some route sends to it.
    pub active: bool,
    /// Per-integration state.
    pub integrations: Vec<IntegrationStatus>,
}

/// Runtime summary of an organisation, served by `GET /api/v2/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerStatus {
    /// Organisation.
    pub org_id: i64,
    /// Hash of the applied configuration.
    pub config_hash: String,
    /// When the configuration was applied.
    pub applied_at: DateTime<Utc>,
    /// Alerts held, resolved ones included.
    pub alerts: usize,
    /// Aggregation groups.
    pub groups: usize,
    /// Silences, expired ones included.
    pub silences: usize,
    /// Receivers and their integrations.
    pub receivers: Vec<ReceiverStatus>,
}

#[derive(Debug)]
struct OrgState {
    pipeline: Pipeline,
    receivers: HashMap<String, Vec<Integration>>,
    config: AlertmanagerConfig,
    hash: String,
    applied_at: DateTime<Utc>,
    silence_revision: u64,
}

/// Routing, suppression and delivery for one organisation.
#[derive(Debug)]
pub struct Alertmanager {
    org_id: i64,
    state: Mutex<OrgState>,
    silences: Silences,
    dispatcher: Dispatcher,
    factory: IntegrationFactory,
    clock: Arc<dyn Clock>,
    wakeup: Notify,
}

impl Alertmanager {
    /// Creates an organisation's Alertmanager with an applied configuration.
    ///
    /// Secure settings in `config` must already be decrypted.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built.
    pub fn new(
        org_id: i64,
        config: AlertmanagerConfig,
        factory: IntegrationFactory,
        silences: Silences,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let receivers = factory.build_receivers(&config)?;
        let pipeline = Pipeline::new(&config)?;
        let state = OrgState {
            pipeline,
            receivers,
            hash: config.fingerprint(),
            config,
            applied_at: clock.now(),
            silence_revision: silences.revision(),
        };
        Ok(Self {
            org_id,
            state: Mutex::new(state),
            silences,
            dispatcher,
            factory,
            clock,
            wakeup: Notify::new(),
        })
    }

    /// Organisation ID.
    #[must_use]
    pub const fn org_id(&self) -> i64 {
        self.org_id
    }

    /// The organisation's silences.
    #[must_use]
    pub const fn silences(&self) -> &Silences {
        &self.silences
    }

    /// The applied configuration, secrets decrypted.
    #[must_use]
    pub fn config(&self) -> AlertmanagerConfig {
        self.state.lock().config.clone()
    }

    /// Hash of the applied configuration.
    #[must_use]
    pub fn config_hash(&self) -> String {
        self.state.lock().hash.clone()
    }

    /// Applies a configuration. Returns `false` if it was already applied.
    ///
    /// Held alerts are re-routed; groups whose key survives keep their timers.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the running configuration in place, if the
    /// new one cannot be built.
    pub fn apply_config(&self, config: AlertmanagerConfig) -> Result<bool> {
        let hash = config.fingerprint();
        if self.state.lock().hash == hash {
            debug!(org_id = self.org_id, "configuration unchanged");
            return Ok(false);
        }
        config.validate()?;
        let receivers = self.factory.build_receivers(&config)?;

        let now = self.clock.now();
        let mut state = self.state.lock();
        state.pipeline.reconfigure(&config, now)?;
        state.receivers = receivers;
        state.config = config;
        state.hash = hash;
        state.applied_at = now;
        drop(state);

        info!(org_id = self.org_id, "alertmanager configuration applied");
        self.wakeup.notify_one();
        Ok(true)
    }

    fn validate_alert(alert: &PostableAlert) -> Result<()> {
        let invalid = |reason: String| Err(NotifyError::InvalidAlert { reason });
        if alert.labels.is_empty() {
            return invalid("at least one label pair required".to_string());
        }
        if let Some((name, _)) = alert.labels.iter().find(|(n, _)| !valid_label_name(n)) {
            return invalid(format!("invalid label name {name:?}"));
        }
        if alert.ends_at < alert.starts_at {
            return invalid(format!(
                "start time {} must be before end time {}",
                alert.starts_at, alert.ends_at
            ));
        }
        Ok(())
    }

    /// Accepts firing and resolved alerts.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::InvalidAlert` for the first malformed alert;
    /// nothing is inserted in that case.
    pub fn put_alerts(&self, alerts: Vec<PostableAlert>) -> Result<()> {
        for alert in &alerts {
            Self::validate_alert(alert)?;
        }
        if alerts.is_empty() {
            return Ok(());
        }
        let count = alerts.len();
        self.state.lock().pipeline.insert(alerts, self.clock.now());
        debug!(org_id = self.org_id, count, "alerts received");
        self.wakeup.notify_one();
        Ok(())
    }

    /// Flushes due groups and pairs each notification with the integrations
    /// of its receiver.
    fn take_due(&self) -> Vec<(Notification, Vec<Integration>)> {
        let now = self.clock.now();
        let revision = self.silences.revision();
        let mut state = self.state.lock();
        if state.silence_revision != revision {
            state.silence_revision = revision;
            state.pipeline.recheck_silenced(now);
        }
        let notifications = state
            .pipeline
            .flush_due(now, |labels| self.silences.silenced_until(labels));
        notifications
            .into_iter()
            .map(|n| {
                let integrations = state.receivers.get(&n.receiver).cloned();
                if integrations.is_none() {
                    warn!(org_id = self.org_id, receiver = %n.receiver, "receiver not found");
                }
                (n, integrations.unwrap_or_default())
            })
            .collect()
    }

    async fn deliver(&self, notification: &Notification, integrations: &[Integration]) {
        debug!(
            org_id = self.org_id,
            receiver = %notification.receiver,
            group_key = %notification.group_key,
            alerts = notification.alerts.len(),
            "delivering notification"
        );
        self.dispatcher.deliver(integrations, notification).await;
    }

    /// Flushes every due group and waits for the notifications to be
    /// delivered.
    ///
    /// Returns the notifications that were sent.
    pub async fn flush(&self) -> Vec<Notification> {
        let batches = self.take_due();
        if batches.is_empty() {
            return Vec::new();
        }
        join_all(batches.iter().map(|(n, integrations)| self.deliver(n, integrations))).await;
        batches.into_iter().map(|(n, _)| n).collect()
    }

    fn next_wait(&self) -> Duration {
        let next = self.state.lock().pipeline.next_flush();
        next.map_or(MAX_WAIT, |at| {
            (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO).min(MAX_WAIT)
        })
    }

    /// Flushes groups as their timers come due until `shutdown` flips to
    /// `true`. Expired silences are dropped periodically.
    ///
    /// Deliveries run as separate tasks; those still in flight at shutdown
    /// are aborted.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut deliveries = JoinSet::new();
        loop {
            for (notification, integrations) in self.take_due() {
                let am = Arc::clone(&self);
                deliveries.spawn(async move { am.deliver(&notification, &integrations).await });
            }
            while let Some(result) = deliveries.try_join_next() {
                if let Err(e) = result {
                    warn!(org_id = self.org_id, error = %e, "delivery task failed");
                }
            }
            tokio::select! {
                () = tokio::time::sleep(self.next_wait()) => {}
                () = self.wakeup.notified() => {}
                () = self.silences.changed() => {}
                _ = maintenance.tick() => {
                    let removed = self.silences.expunge();
                    if removed > 0 {
                        debug!(org_id = self.org_id, removed, "expunged silences");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if !deliveries.is_empty() {
            debug!(org_id = self.org_id, in_flight = deliveries.len(), "aborting deliveries");
        }
        deliveries.shutdown().await;
        debug!(org_id = self.org_id, "alertmanager stopped");
    }

    fn gettable(&self, state: &OrgState, alert: &PostableAlert, now: DateTime<Utc>) -> GettableAlert {
        let silenced_by = self.silences.mutes(&alert.labels);
        let inhibited_by: Vec<String> = state
            .pipeline
            .inhibited_by(&alert.labels, now)
            .into_iter()
            .map(|fp| fp.to_string())
            .collect();
        let suppressed = !silenced_by.is_empty() || !inhibited_by.is_empty();
        GettableAlert {
            fingerprint: alert.fingerprint().to_string(),
            receivers: state
                .pipeline
                .receivers(&alert.labels)
                .into_iter()
                .map(|name| ReceiverRef { name })
                .collect(),
            status: GettableAlertStatus {
                state: if suppressed {
                    AlertState::Suppressed
                } else {
                    AlertState::Active
                },
                silenced_by,
                inhibited_by,
            },
            alert: alert.clone(),
        }
    }

    /// Firing alerts whose labels match `filter`.
    #[must_use]
    pub fn alerts(&self, filter: &Matchers) -> Vec<GettableAlert> {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .pipeline
            .alerts()
            .iter()
            .filter(|a| !a.is_resolved_at(now) && filter.matches(&a.labels))
            .map(|a| self.gettable(&state, a, now))
            .collect()
    }

    /// Aggregation groups with their firing alerts.
    #[must_use]
    pub fn alert_groups(&self) -> Vec<AlertGroup> {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .pipeline
            .groups()
            .into_iter()
            .map(|g| AlertGroup {
                alerts: g
                    .alerts
                    .iter()
                    .filter(|a| !a.is_resolved_at(now))
                    .map(|a| self.gettable(&state, a, now))
                    .collect(),
                labels: g.labels,
                receiver: ReceiverRef { name: g.receiver },
            })
            .filter(|g| !g.alerts.is_empty())
            .collect()
    }

    /// Receivers with the outcome of their latest deliveries.
    #[must_use]
    pub fn receivers_status(&self) -> Vec<ReceiverStatus> {
        let state = self.state.lock();
        let routed: Vec<&str> = state
            .pipeline
            .tree()
            .nodes()
            .map(|n| n.receiver.as_str())
            .collect();
        let by_name: BTreeMap<&str, &Vec<Integration>> =
            state.receivers.iter().map(|(k, v)| (k.as_str(), v)).collect();
        by_name
            .into_iter()
            .map(|(name, integrations)| ReceiverStatus {
                name: name.to_string(),
                active: routed.contains(&name),
                integrations: integrations
                    .iter()
                    .map(|i| {
                        let last: Option<DeliveryOutcome> = self.dispatcher.last_outcome(&i.uid);
                        IntegrationStatus {
                            uid: i.uid.clone(),
                            name: i.name.clone(),
                            kind: i.kind.to_string(),
                            last_notify_attempt: last.as_ref().map(|o| o.at),
                            last_notify_error: last.and_then(|o| o.error),
                        }
                    })
                    .collect(),
            })
            .collect()
    }

    /// Runtime summary.
    #[must_use]
    pub fn status(&self) -> AlertmanagerStatus {
        let receivers = self.receivers_status();
        let state = self.state.lock();
        AlertmanagerStatus {
            org_id: self.org_id,
            config_hash: state.hash.clone(),
            applied_at: state.applied_at,
            alerts: state.pipeline.alerts().len(),
            groups: state.pipeline.groups().len(),
            silences: self.silences.len(),
            receivers,
        }
    }
}

fn valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
