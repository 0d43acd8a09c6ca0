//! Wiring of the alerting engine.
//!
//! [`EngineBuilder`] turns a [`ServerConfig`] into an [`AppState`]. Every
//! external collaborator has an in-process default and can be replaced, so
//! several replicas can share one rule store, state store and membership
//! table inside a single process.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vigil_alerts::ha::MembershipStore;
use vigil_alerts::scheduler::TickSummary;
use vigil_alerts::{
    AlertSink, AlertingMetrics, Clock, Coordinator, DatasourceRouter, EvaluationGate, Evaluator,
    HaConfig, MemoryMembership, MemoryRuleStore, MemoryStateStore, PrometheusExecutor,
    QueryExecutor, RuleStore, Scheduler, SchedulerConfig, StateStore, StateTracker, SystemClock,
    TrackerConfig,
};
use vigil_notify::integrations::EmailSender;
use vigil_notify::{
    AdminConfigStore, ConfigStore, DispatchConfig, Distributor, HttpRemoteAlertmanager,
    IntegrationFactory, MultiOrgAlertmanager, RemoteAlertmanager, SecretsService,
};

use crate::auth::{AccessControl, BasicAccessControl};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

/// Builds an [`AppState`] from configuration and optional collaborators.
#[derive(Debug)]
pub struct EngineBuilder {
    config: ServerConfig,
    clock: Option<Arc<dyn Clock>>,
    rules: Option<Arc<dyn RuleStore>>,
    states: Option<Arc<dyn StateStore>>,
    membership: Option<Arc<dyn MembershipStore>>,
    executor: Option<Arc<dyn QueryExecutor>>,
    remote: Option<Arc<dyn RemoteAlertmanager>>,
    configs: Option<ConfigStore>,
    admin: Option<AdminConfigStore>,
    access: Option<Arc<dyn AccessControl>>,
    email: Option<Arc<dyn EmailSender>>,
}

impl EngineBuilder {
    /// Starts from a configuration; everything else uses defaults.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            clock: None,
            rules: None,
            states: None,
            membership: None,
            executor: None,
            remote: None,
            configs: None,
            admin: None,
            access: None,
            email: None,
        }
    }

    /// Uses `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Uses a shared rule store.
    #[must_use]
    pub fn with_rule_store(mut self, store: Arc<dyn RuleStore>) -> Self {
        self.rules = Some(store);
        self
    }

    /// Uses a shared alert instance store.
    #[must_use]
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.states = Some(store);
        self
    }

    /// Uses a shared membership table.
    #[must_use]
    pub fn with_membership(mut self, store: Arc<dyn MembershipStore>) -> Self {
        self.membership = Some(store);
        self
    }

    /// Replaces the query executor built from the configured datasources.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replaces the HTTP client used for external Alertmanagers.
    #[must_use]
    pub fn with_remote_alertmanager(mut self, remote: Arc<dyn RemoteAlertmanager>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Uses a shared Alertmanager configuration store.
    #[must_use]
    pub fn with_config_store(mut self, store: ConfigStore) -> Self {
        self.configs = Some(store);
        self
    }

    /// Uses a shared admin configuration store.
    #[must_use]
    pub fn with_admin_store(mut self, store: AdminConfigStore) -> Self {
        self.admin = Some(store);
        self
    }

    /// Replaces role-based access control.
    #[must_use]
    pub fn with_access_control(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = Some(access);
        self
    }

    /// Replaces the logging email sender.
    #[must_use]
    pub fn with_email_sender(mut self, sender: Arc<dyn EmailSender>) -> Self {
        self.email = Some(sender);
        self
    }

    fn default_executor(config: &ServerConfig) -> ServerResult<Arc<dyn QueryExecutor>> {
        let client = reqwest::Client::builder()
            .timeout(config.evaluation_timeout)
            .build()
            .map_err(|e| ServerError::Startup(format!("failed to build HTTP client: {e}")))?;

        let mut router = DatasourceRouter::new();
        let mut fallback: Option<Arc<dyn QueryExecutor>> = None;
        for ds in &config.datasources {
            let executor: Arc<dyn QueryExecutor> =
                Arc::new(PrometheusExecutor::new(client.clone(), ds.url.clone()));
            if config.default_datasource.as_deref() == Some(ds.uid.as_str()) {
                fallback = Some(Arc::clone(&executor));
            }
            router = router.with_datasource(ds.uid.clone(), executor);
        }
        if let Some(fallback) = fallback {
            router = router.with_fallback(fallback);
        }
        Ok(Arc::new(router))
    }

    /// Builds the engine. Nothing runs until [`AppState::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a component
    /// cannot be created.
    pub fn build(self) -> ServerResult<AppState> {
        let config = self.config;
        config.validate()?;
        let state_dir = config.state_dir.clone();

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = AlertingMetrics::new();

        let rules = self.rules.unwrap_or_else(|| match &state_dir {
            Some(dir) => Arc::new(MemoryRuleStore::with_snapshot(dir)),
            None => Arc::new(MemoryRuleStore::new()),
        });
        let states = self.states.unwrap_or_else(|| match &state_dir {
            Some(dir) => Arc::new(MemoryStateStore::with_snapshot(dir)),
            None => Arc::new(MemoryStateStore::new()),
        });
        let membership = self
            .membership
            .unwrap_or_else(|| Arc::new(MemoryMembership::new()));
        let executor = match self.executor {
            Some(executor) => executor,
            None => Self::default_executor(&config)?,
        };

        let configs = match self.configs {
            Some(configs) => configs,
            None => {
                let mut factory = IntegrationFactory::new(config.external_url.clone());
                if let Some(email) = self.email {
                    factory = factory.with_email_sender(email);
                }
                let store = ConfigStore::new(
                    SecretsService::new(config.secret_key.as_bytes()),
                    factory,
                    Arc::clone(&clock),
                );
                match &state_dir {
                    Some(dir) => store.with_snapshot(dir),
                    None => store,
                }
            }
        };
        let admin = self.admin.unwrap_or_else(|| match &state_dir {
            Some(dir) => AdminConfigStore::new().with_snapshot(dir),
            None => AdminConfigStore::new(),
        });
        let remote = self.remote.unwrap_or_else(|| {
            Arc::new(HttpRemoteAlertmanager::default().with_timeout(config.notifications.timeout))
        });
        let distributor = Distributor::new(
            admin,
            configs.clone(),
            remote,
            metrics.clone(),
            Arc::clone(&clock),
        )
        .with_poll_interval(config.admin_config_poll_interval);

        let dispatch = DispatchConfig::default()
            .with_timeout(config.notifications.timeout)
            .with_max_attempts(config.notifications.max_attempts);
        let mut notify = MultiOrgAlertmanager::new(configs, distributor, metrics.clone(), Arc::clone(&clock))
            .with_dispatch_config(dispatch);
        if let Some(dir) = &state_dir {
            notify = notify.with_state_dir(dir.clone());
        }
        let notify = Arc::new(notify);
        notify.load_all();

        let tracker = Arc::new(StateTracker::new(
            Arc::clone(&states),
            TrackerConfig::default()
                .with_resend_delay(config.resend_delay)
                .with_resolved_retention(config.resolved_retention)
                .with_external_url(config.external_url.clone()),
            metrics.clone(),
        ));
        let sink: Arc<dyn AlertSink> = Arc::clone(&notify) as Arc<dyn AlertSink>;
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::default()
                .with_base_interval(config.base_interval)
                .with_max_concurrent_evaluations(config.max_concurrent_evaluations),
            Evaluator::new(executor).with_timeout(config.evaluation_timeout),
            tracker,
            sink,
            Arc::clone(&clock),
            metrics.clone(),
        ));

        let coordinator = Arc::new(Coordinator::new(
            HaConfig::new(config.ha.peer_name.clone())
                .with_heartbeat_interval(config.ha.heartbeat_interval)
                .with_peer_timeout(config.ha.peer_timeout)
                .with_single_node_evaluation(config.ha.single_node_evaluation),
            membership,
            Arc::clone(&clock),
            metrics.clone(),
        ));

        let access = self
            .access
            .unwrap_or_else(|| Arc::new(BasicAccessControl::new()));

        info!(
            peer = %config.ha.peer_name,
            single_node_evaluation = config.ha.single_node_evaluation,
            persistent = state_dir.is_some(),
            "engine built"
        );

        Ok(AppState {
            config: Arc::new(config),
            clock,
            metrics,
            rules,
            states,
            scheduler,
            coordinator,
            notify,
            access,
            start_time: Instant::now(),
        })
    }
}

impl AppState {
    /// Starts the HA heartbeat, the scheduler and the notification loops.
    /// Everything stops when `shutdown` flips to `true`; the returned
    /// handles finish once the scheduler has drained.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let gate: Arc<dyn EvaluationGate> = Arc::clone(&self.coordinator) as Arc<dyn EvaluationGate>;
        let handles = vec![
            tokio::spawn(Arc::clone(&self.coordinator).run(shutdown.clone())),
            tokio::spawn(Arc::clone(&self.scheduler).run(
                gate,
                Some(Arc::clone(&self.rules)),
                shutdown.clone(),
            )),
        ];
        self.notify.start(shutdown);
        info!(peer = %self.config.ha.peer_name, "engine started");
        handles
    }

    /// Runs one heartbeat and one scheduler step in the caller's task.
    pub async fn step(&self) -> Option<TickSummary> {
        let role = self.coordinator.refresh().await;
        let summary = self
            .scheduler
            .step(self.coordinator.as_ref(), Some(self.rules.as_ref()))
            .await;
        if summary.as_ref().is_some_and(|s| s.missed > 0) {
            warn!(role = ?role, "evaluations missed this tick");
        }
        summary
    }

    /// Waits until no evaluation is in flight.
    pub async fn wait_idle(&self) {
        while self.scheduler.in_flight() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use vigil_alerts::{AlertQuery, AlertRule, InstanceState, ManualClock, Role, RuleGroup};

    fn firing_group() -> RuleGroup {
        let rule = AlertRule::builder("always", "A")
            .uid("r1")
            .query(AlertQuery::new("A", json!({"value": 1})).datasource("__constant__"))
            .build()
            .unwrap();
        RuleGroup::new(1, "folder", "group", Duration::from_secs(10), vec![rule])
    }

    #[test]
    fn test_build_with_defaults() {
        let state = EngineBuilder::new(ServerConfig::default().with_peer_name("a"))
            .build()
            .unwrap();
        assert_eq!(state.config().ha.peer_name, "a");
        assert!(state.notify().orgs().is_empty());
        assert_eq!(state.coordinator().role(), Role::Follower);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = ServerConfig::default().with_base_interval(Duration::ZERO);
        assert!(EngineBuilder::new(config).build().is_err());
    }

    #[test]
    fn test_build_with_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let state = EngineBuilder::new(ServerConfig::default().with_state_dir(dir.path()))
            .build()
            .unwrap();
        state.notify().org(1).unwrap();
        assert!(dir.path().join("alertmanager_configs.json").exists());
    }

    #[tokio::test]
    async fn test_step_evaluates_rules_from_the_store() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let state = EngineBuilder::new(ServerConfig::default().with_peer_name("solo"))
            .with_clock(clock.clone())
            .build()
            .unwrap();
        state.rules().replace_group(firing_group()).await.unwrap();

        let summary = state.step().await.unwrap();
        assert_eq!(summary.scheduled, 1);
        state.wait_idle().await;

        assert_eq!(state.coordinator().role(), Role::Evaluator);
        let instances = state.states().list(1).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].state, InstanceState::Alerting);
    }
}
