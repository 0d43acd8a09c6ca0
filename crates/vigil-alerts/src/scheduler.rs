//! Rule scheduler.
//!
//! A single ticker fires every base interval. Tick `n` is due for a group
//! when `n` is a multiple of the group's `interval / base_interval`, so
//! groups with the same interval are evaluated on the same ticks. Each due
//! rule is evaluated in its own task, bounded by a semaphore. At most one
//! evaluation per rule is in flight; a tick that finds the previous one
//! still running is recorded as missed.
//!
//! Updating a rule leaves a running evaluation alone: it finishes against
//! the snapshot it started with. Deleting or pausing a rule cancels it, and
//! the rule's state is only dropped once the cancelled evaluation has
//! exited, so a late result is never written back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Notify, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::evaluator::{Evaluation, Evaluator};
use crate::ha::EvaluationGate;
use crate::instance::StateReason;
use crate::metrics::AlertingMetrics;
use crate::rule::{AlertRule, GroupKey, RuleGroup, RuleKey};
use crate::rule_store::RuleStore;
use crate::sink::AlertSink;
use crate::state::StateTracker;

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick period; every group interval is a multiple of it.
    pub base_interval: Duration,
    /// Maximum evaluations running at once.
    pub max_concurrent_evaluations: usize,
    /// How long shutdown waits for in-flight evaluations.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(10),
            max_concurrent_evaluations: 64,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// Sets the base interval.
    #[must_use]
    pub const fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub const fn with_max_concurrent_evaluations(mut self, max: usize) -> Self {
        self.max_concurrent_evaluations = max;
        self
    }
}

/// Health of the last evaluation of a rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationInfo {
    /// Scheduled time of the evaluation.
    pub evaluated_at: DateTime<Utc>,
    /// Wall time it took.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Error message, if it failed.
    pub error: Option<String>,
}

/// What a tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Tick number.
    pub tick: u64,
    /// Evaluations started.
    pub scheduled: usize,
    /// Evaluations skipped because the previous one was still running.
    pub missed: usize,
}

struct InFlight {
    id: u64,
    token: CancellationToken,
}

/// Schedules and runs rule evaluations.
pub struct Scheduler {
    config: SchedulerConfig,
    evaluator: Evaluator,
    tracker: Arc<StateTracker>,
    sink: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    metrics: AlertingMetrics,
    groups: RwLock<HashMap<GroupKey, Arc<RuleGroup>>>,
    in_flight: Mutex<HashMap<RuleKey, InFlight>>,
    last_evaluations: RwLock<HashMap<RuleKey, EvaluationInfo>>,
    next_id: AtomicU64,
    synced_revision: AtomicU64,
    semaphore: Arc<Semaphore>,
    idle: Notify,
    evaluating: AtomicBool,
    last_tick: Mutex<Option<u64>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("groups", &self.groups.read().len())
            .field("in_flight", &self.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler with an empty registry.
    pub fn new(
        config: SchedulerConfig,
        evaluator: Evaluator,
        tracker: Arc<StateTracker>,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        metrics: AlertingMetrics,
    ) -> Self {
        let permits = config.max_concurrent_evaluations.max(1);
        Self {
            config,
            evaluator,
            tracker,
            sink,
            clock,
            metrics,
            groups: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            last_evaluations: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            synced_revision: AtomicU64::new(u64::MAX),
            semaphore: Arc::new(Semaphore::new(permits)),
            idle: Notify::new(),
            evaluating: AtomicBool::new(false),
            last_tick: Mutex::new(None),
        }
    }

    /// Scheduler settings.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The state tracker fed by this scheduler.
    #[must_use]
    pub const fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    // ============ Registry ============

    /// Snapshot of every scheduled group.
    #[must_use]
    pub fn groups(&self) -> Vec<Arc<RuleGroup>> {
        let mut groups: Vec<_> = self.groups.read().values().cloned().collect();
        groups.sort_by_key(|g| g.key());
        groups
    }

    /// Health of the last evaluation of a rule.
    #[must_use]
    pub fn last_evaluation(&self, rule: &RuleKey) -> Option<EvaluationInfo> {
        self.last_evaluations.read().get(rule).cloned()
    }

    /// Number of evaluations currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Adds or replaces a group.
    pub async fn upsert_group(&self, group: RuleGroup) {
        let key = group.key();
        let previous = self.groups.write().insert(key, Arc::new(group.clone()));
        let old_rules = previous.map(|g| g.rules.clone()).unwrap_or_default();
        self.reconcile(&old_rules, &group.rules).await;
    }

    /// Removes a group, resolving the alerts of its rules.
    pub async fn remove_group(&self, key: &GroupKey) {
        let previous = self.groups.write().remove(key);
        if let Some(group) = previous {
            self.reconcile(&group.rules, &[]).await;
        }
    }

    /// Replaces the registry with the contents of `store` if its revision
    /// moved since the last sync. Returns true if a sync happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub async fn sync(&self, store: &dyn RuleStore) -> crate::Result<bool> {
        let revision = store.revision();
        if self.synced_revision.load(Ordering::SeqCst) == revision {
            return Ok(false);
        }
        let groups = store.list_all().await?;

        let (old_rules, new_rules) = {
            let mut registry = self.groups.write();
            let old_rules: Vec<AlertRule> =
                registry.values().flat_map(|g| g.rules.iter().cloned()).collect();
            *registry = groups
                .into_iter()
                .map(|g| (g.key(), Arc::new(g)))
                .collect();
            let new_rules: Vec<AlertRule> =
                registry.values().flat_map(|g| g.rules.iter().cloned()).collect();
            (old_rules, new_rules)
        };
        self.reconcile(&old_rules, &new_rules).await;
        self.synced_revision.store(revision, Ordering::SeqCst);
        debug!(revision, rules = new_rules.len(), "scheduler synced with rule store");
        Ok(true)
    }

    /// Cancels evaluations of removed or paused rules and drops their state.
    async fn reconcile(&self, old: &[AlertRule], new: &[AlertRule]) {
        let current: HashMap<RuleKey, &AlertRule> = new.iter().map(|r| (r.key(), r)).collect();
        let mut dropped: Vec<(RuleKey, StateReason)> = Vec::new();
        let mut cancelled: Vec<(RuleKey, u64)> = Vec::new();
        let mut seen = HashSet::new();

        for rule in old {
            let key = rule.key();
            seen.insert(key.clone());
            match current.get(&key) {
                None => {
                    cancelled.extend(self.cancel(&key).map(|id| (key.clone(), id)));
                    dropped.push((key, StateReason::RuleDeleted));
                }
                Some(updated) if updated.is_paused && !rule.is_paused => {
                    cancelled.extend(self.cancel(&key).map(|id| (key.clone(), id)));
                    dropped.push((key, StateReason::Paused));
                }
                Some(_) => {}
            }
        }
        for rule in new.iter().filter(|r| r.is_paused && !seen.contains(&r.key())) {
            dropped.push((rule.key(), StateReason::Paused));
        }

        for (key, id) in cancelled {
            self.wait_exited(&key, id).await;
        }

        let now = self.clock.now();
        for (key, reason) in dropped {
            self.last_evaluations.write().remove(&key);
            let alerts = self.tracker.delete_rule(&key, reason, now).await;
            if !alerts.is_empty() {
                self.sink.send(key.org_id, alerts).await;
            }
        }
    }

    /// Signals the in-flight evaluation of a rule to stop. The entry stays
    /// until the task exits; returns its ID.
    fn cancel(&self, rule: &RuleKey) -> Option<u64> {
        let in_flight = self.in_flight.lock();
        let entry = in_flight.get(rule)?;
        entry.token.cancel();
        debug!(rule = %rule, "cancelled in-flight evaluation");
        Some(entry.id)
    }

    async fn wait_exited(&self, rule: &RuleKey, id: u64) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.in_flight.lock().get(rule).is_some_and(|e| e.id == id) {
                return;
            }
            notified.await;
        }
    }

    /// Cancels every in-flight evaluation.
    pub fn cancel_all(&self) {
        let drained: Vec<InFlight> = self.in_flight.lock().drain().map(|(_, v)| v).collect();
        for entry in drained {
            entry.token.cancel();
        }
        self.idle.notify_waiters();
    }

    // ============ Ticking ============

    /// Tick number for `now`, counted in base intervals since the epoch.
    #[must_use]
    pub fn tick_number(&self, now: DateTime<Utc>) -> u64 {
        let base = u64::try_from(self.config.base_interval.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        u64::try_from(now.timestamp_millis()).unwrap_or(0) / base
    }

    fn tick_time(&self, tick: u64) -> DateTime<Utc> {
        let base = u64::try_from(self.config.base_interval.as_millis()).unwrap_or(u64::MAX);
        let millis = i64::try_from(tick.saturating_mul(base)).unwrap_or(i64::MAX);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(|| self.clock.now())
    }

    /// Starts the evaluations due at `now`.
    pub fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> TickSummary {
        let tick = self.tick_number(now);
        let scheduled_at = self.tick_time(tick);
        let due: Vec<Arc<RuleGroup>> = self
            .groups
            .read()
            .values()
            .filter(|g| tick % g.ticks_per_evaluation(self.config.base_interval) == 0)
            .cloned()
            .collect();

        let mut summary = TickSummary {
            tick,
            ..TickSummary::default()
        };
        for group in due {
            for rule in group.rules.iter().filter(|r| !r.is_paused) {
                if self.start(rule.clone(), scheduled_at) {
                    summary.scheduled += 1;
                } else {
                    summary.missed += 1;
                }
            }
        }
        if summary.scheduled > 0 || summary.missed > 0 {
            debug!(tick, scheduled = summary.scheduled, missed = summary.missed, "scheduler tick");
        }
        summary
    }

    fn start(self: &Arc<Self>, rule: AlertRule, at: DateTime<Utc>) -> bool {
        let key = rule.key();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&key) {
                warn!(rule = %key, "previous evaluation still running, skipping tick");
                self.metrics.inc_missed_evaluations(rule.org_id);
                return false;
            }
            in_flight.insert(
                key.clone(),
                InFlight {
                    id,
                    token: token.clone(),
                },
            );
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => debug!(rule = %key, "evaluation cancelled before it started"),
                permit = Arc::clone(&this.semaphore).acquire_owned() => match permit {
                    Ok(_permit) => this.evaluate(&rule, at, &token).await,
                    Err(_) => debug!(rule = %key, "scheduler stopped before evaluation started"),
                },
            }
            this.finish(&key, id);
        });
        true
    }

    fn finish(&self, key: &RuleKey, id: u64) {
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.get(key).is_some_and(|e| e.id == id) {
                in_flight.remove(key);
            }
        }
        self.idle.notify_waiters();
    }

    async fn evaluate(&self, rule: &AlertRule, at: DateTime<Utc>, token: &CancellationToken) {
        let mut task = {
            let evaluator = self.evaluator.clone();
            let rule = rule.clone();
            tokio::spawn(async move { evaluator.evaluate(&rule, at).await })
        };
        let evaluation = tokio::select! {
            () = token.cancelled() => {
                task.abort();
                debug!(rule_uid = %rule.uid, "evaluation cancelled");
                return;
            }
            joined = &mut task => match joined {
                Ok(evaluation) => evaluation,
                Err(e) if e.is_panic() => {
                    error!(rule_uid = %rule.uid, "rule evaluation panicked");
                    Evaluation::failed(at, Duration::ZERO, "evaluation panicked")
                }
                Err(_) => return,
            },
        };
        if token.is_cancelled() {
            return;
        }

        self.metrics.inc_evaluations(rule.org_id);
        self.metrics
            .observe_evaluation_duration(evaluation.duration.as_secs_f64());
        let error = evaluation
            .results
            .iter()
            .find_map(|r| r.error.clone());
        if evaluation.has_error() {
            self.metrics.inc_evaluation_failures(rule.org_id);
        }
        self.last_evaluations.write().insert(
            rule.key(),
            EvaluationInfo {
                evaluated_at: evaluation.evaluated_at,
                duration: evaluation.duration,
                error,
            },
        );

        let outcome = self.tracker.process(rule, &evaluation).await;
        if token.is_cancelled() {
            debug!(rule_uid = %rule.uid, "rule removed during evaluation, alerts discarded");
            return;
        }
        if !outcome.alerts.is_empty() {
            self.sink.send(rule.org_id, outcome.alerts).await;
        }
    }

    // ============ Lifecycle ============

    /// True while the gate allowed evaluation at the last step.
    #[must_use]
    pub fn is_evaluating(&self) -> bool {
        self.evaluating.load(Ordering::SeqCst)
    }

    /// One iteration of the run loop: resync from `store`, follow the gate
    /// and tick if this replica evaluates and the tick is new.
    ///
    /// The state cache is warmed when `gate` starts allowing evaluation and
    /// cleared when it stops.
    pub async fn step(
        self: &Arc<Self>,
        gate: &dyn EvaluationGate,
        store: Option<&dyn RuleStore>,
    ) -> Option<TickSummary> {
        if let Some(store) = store {
            if let Err(e) = self.sync(store).await {
                warn!(error = %e, "failed to sync rules from store");
            }
        }

        let allowed = gate.should_evaluate();
        if allowed != self.evaluating.load(Ordering::SeqCst) {
            if allowed {
                match self.tracker.warm().await {
                    Ok(n) => info!(instances = n, "became evaluator"),
                    Err(e) => warn!(error = %e, "became evaluator with a cold state cache"),
                }
            } else {
                self.cancel_all();
                self.tracker.clear();
                info!("stopped evaluating");
            }
            self.evaluating.store(allowed, Ordering::SeqCst);
        }
        if !allowed {
            return None;
        }

        let now = self.clock.now();
        let tick = self.tick_number(now);
        {
            let mut last = self.last_tick.lock();
            if *last == Some(tick) {
                return None;
            }
            *last = Some(tick);
        }
        Some(self.tick(now))
    }

    /// Steps every base interval until `shutdown` flips to `true`.
    ///
    /// When `store` is given the registry is resynced from it before each
    /// tick.
    pub async fn run(
        self: Arc<Self>,
        gate: Arc<dyn EvaluationGate>,
        store: Option<Arc<dyn RuleStore>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.base_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(base_interval = ?self.config.base_interval, "rule scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.step(gate.as_ref(), store.as_deref()).await;
        }

        self.shutdown().await;
    }

    /// Stops accepting work and waits up to the grace period for in-flight
    /// evaluations; whatever is left is cancelled.
    pub async fn shutdown(&self) {
        self.semaphore.close();
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.lock().is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(remaining = self.in_flight(), "shutdown grace elapsed, cancelling evaluations");
                self.cancel_all();
                break;
            }
        }
        info!("rule scheduler stopped");
    }
}
