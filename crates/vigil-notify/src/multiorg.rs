//! One [`Alertmanager`] per organisation.
//!
//! Organisations are created on first use from their stored configuration,
//! or from the default one if they have none. Configuration changes go
//! through the [`ConfigStore`] first so an invalid document is never
//! persisted or applied.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vigil_alerts::{AlertSink, AlertingMetrics, Clock, PostableAlert};

use crate::alertmanager::Alertmanager;
use crate::config::AlertmanagerConfig;
use crate::config_store::{ConfigStore, SaveOutcome};
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::distributor::{AdminConfigStore, Distributor};
use crate::error::Result;
use crate::silence::Silences;

/// The Alertmanagers of every organisation.
#[derive(Debug)]
pub struct MultiOrgAlertmanager {
    orgs: RwLock<BTreeMap<i64, Arc<Alertmanager>>>,
    configs: ConfigStore,
    distributor: Arc<Distributor>,
    dispatch: DispatchConfig,
    metrics: AlertingMetrics,
    clock: Arc<dyn Clock>,
    state_dir: Option<PathBuf>,
    shutdown: Mutex<Option<watch::Receiver<bool>>>,
}

impl MultiOrgAlertmanager {
    /// Creates an empty set of organisations.
    pub fn new(
        configs: ConfigStore,
        distributor: Distributor,
        metrics: AlertingMetrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orgs: RwLock::new(BTreeMap::new()),
            configs,
            distributor: Arc::new(distributor),
            dispatch: DispatchConfig::default(),
            metrics,
            clock,
            state_dir: None,
            shutdown: Mutex::new(None),
        }
    }

    /// Sets retry and timeout settings for notifications.
    #[must_use]
    pub fn with_dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatch = config;
        self
    }

    /// Persists silences under `dir`.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Configuration history.
    #[must_use]
    pub const fn configs(&self) -> &ConfigStore {
        &self.configs
    }

    /// Admin configurations.
    #[must_use]
    pub fn admin(&self) -> &AdminConfigStore {
        self.distributor.admin()
    }

    /// External Alertmanager sync.
    #[must_use]
    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    /// Organisations that have an Alertmanager.
    #[must_use]
    pub fn orgs(&self) -> Vec<i64> {
        self.orgs.read().keys().copied().collect()
    }

    /// The Alertmanager of an organisation, if it was created.
    #[must_use]
    pub fn existing(&self, org_id: i64) -> Option<Arc<Alertmanager>> {
        self.orgs.read().get(&org_id).cloned()
    }

    /// The Alertmanager of an organisation, created on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored configuration cannot be decrypted or
    /// built.
    pub fn org(&self, org_id: i64) -> Result<Arc<Alertmanager>> {
        if let Some(am) = self.existing(org_id) {
            return Ok(am);
        }
        let mut orgs = self.orgs.write();
        if let Some(am) = orgs.get(&org_id) {
            return Ok(Arc::clone(am));
        }

        let (config, entry) = match (self.configs.decrypted(org_id)?, self.configs.current(org_id)) {
            (Some(config), Some(entry)) => (config, entry.id),
            _ => {
                let saved = self.configs.reset(org_id)?;
                (saved.config, saved.id)
            }
        };
        let mut silences = Silences::new(Arc::clone(&self.clock));
        if let Some(dir) = &self.state_dir {
            silences = silences.with_snapshot(dir, &format!("silences_{org_id}"));
        }
        let am = Arc::new(Alertmanager::new(
            org_id,
            config,
            self.configs.factory().clone(),
            silences,
            Dispatcher::new(org_id, self.dispatch.clone(), self.metrics.clone()),
            Arc::clone(&self.clock),
        )?);
        self.configs.mark_applied(org_id, entry);
        orgs.insert(org_id, Arc::clone(&am));
        drop(orgs);

        if let Some(shutdown) = self.shutdown.lock().clone() {
            tokio::spawn(Arc::clone(&am).run(shutdown));
        }
        info!(org_id, "alertmanager started");
        Ok(am)
    }

    /// Creates the Alertmanager of every organisation with a stored
    /// configuration. Organisations that fail to load are logged and skipped.
    pub fn load_all(&self) {
        for org_id in self.configs.orgs() {
            if let Err(e) = self.org(org_id) {
                warn!(org_id, error = %e, "failed to load alertmanager");
            }
        }
    }

    /// Starts the flush loop of every organisation, current and future, and
    /// the external Alertmanager sync. Everything stops when `shutdown`
    /// flips to `true`.
    pub fn start(&self, shutdown: watch::Receiver<bool>) {
        *self.shutdown.lock() = Some(shutdown.clone());
        for am in self.orgs.read().values() {
            tokio::spawn(Arc::clone(am).run(shutdown.clone()));
        }
        tokio::spawn(Arc::clone(&self.distributor).run(shutdown));
    }

    fn apply(&self, org_id: i64, outcome: SaveOutcome) -> Result<SaveOutcome> {
        let am = self.org(org_id)?;
        am.apply_config(outcome.config.clone())?;
        self.configs.mark_applied(org_id, outcome.id);
        Ok(outcome)
    }

    /// Validates, stores and applies a configuration.
    ///
    /// # Errors
    ///
    /// Returns the validation error; nothing is stored in that case.
    pub fn apply_config(&self, org_id: i64, config: AlertmanagerConfig) -> Result<SaveOutcome> {
        let outcome = self.configs.save(org_id, config)?;
        debug!(org_id, id = outcome.id, changed = outcome.changed, "configuration saved");
        self.apply(org_id, outcome)
    }

    /// Re-applies a history entry.
    ///
    /// # Errors
    ///
    /// See [`ConfigStore::activate`].
    pub fn activate(&self, org_id: i64, id: u64) -> Result<SaveOutcome> {
        let outcome = self.configs.activate(org_id, id)?;
        self.apply(org_id, outcome)
    }

    /// Replaces an organisation's configuration with the default one.
    ///
    /// # Errors
    ///
    /// See [`ConfigStore::save`].
    pub fn reset(&self, org_id: i64) -> Result<SaveOutcome> {
        let outcome = self.configs.reset(org_id)?;
        self.apply(org_id, outcome)
    }

    /// Accepts alerts posted directly to an organisation's Alertmanager.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::InvalidAlert` for malformed alerts.
    pub fn put_alerts(&self, org_id: i64, alerts: Vec<PostableAlert>) -> Result<()> {
        self.org(org_id)?.put_alerts(alerts)
    }
}

#[async_trait]
impl AlertSink for MultiOrgAlertmanager {
    async fn send(&self, org_id: i64, alerts: Vec<PostableAlert>) {
        if alerts.is_empty() {
            return;
        }
        let choice = self.admin().send_alerts_to(org_id);
        if choice.external() {
            self.distributor.forward(org_id, &alerts).await;
        }
        if choice.internal() {
            if let Err(e) = self.put_alerts(org_id, alerts) {
                warn!(org_id, error = %e, "failed to route alerts");
            }
        }
    }
}
