//! Shared state for the HTTP API and background loops.

use std::sync::Arc;
use std::time::Instant;

use vigil_alerts::{
    AlertingMetrics, Clock, Coordinator, RuleKey, RuleStore, Scheduler, StateStore,
};
use vigil_notify::{Alertmanager, MultiOrgAlertmanager};

use crate::auth::{AccessControl, Action, Scope, User};
use crate::config::ServerConfig;
use crate::error::{ApiError, ApiResult};

/// Everything a replica runs, wired together by
/// [`EngineBuilder`](crate::engine::EngineBuilder).
#[derive(Debug)]
pub struct AppState {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: AlertingMetrics,
    pub(crate) rules: Arc<dyn RuleStore>,
    pub(crate) states: Arc<dyn StateStore>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) coordinator: Arc<Coordinator>,
    pub(crate) notify: Arc<MultiOrgAlertmanager>,
    pub(crate) access: Arc<dyn AccessControl>,
    pub(crate) start_time: Instant,
}

impl AppState {
    /// Server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Clock shared by every component.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Metrics registry.
    #[must_use]
    pub const fn metrics(&self) -> &AlertingMetrics {
        &self.metrics
    }

    /// Rule storage shared by all replicas.
    #[must_use]
    pub fn rules(&self) -> &Arc<dyn RuleStore> {
        &self.rules
    }

    /// Alert instance storage shared by all replicas.
    #[must_use]
    pub fn states(&self) -> &Arc<dyn StateStore> {
        &self.states
    }

    /// This replica's scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// This replica's HA coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Per-organisation Alertmanagers.
    #[must_use]
    pub const fn notify(&self) -> &Arc<MultiOrgAlertmanager> {
        &self.notify
    }

    /// Permission checks.
    #[must_use]
    pub fn access(&self) -> &Arc<dyn AccessControl> {
        &self.access
    }

    /// Seconds since the state was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// The Alertmanager of the user's organisation.
    pub(crate) fn alertmanager(&self, user: &User) -> ApiResult<Arc<Alertmanager>> {
        Ok(self.notify.org(user.org_id)?)
    }

    /// Fails with `Forbidden` unless `user` may perform `action` on `scope`.
    pub(crate) fn authorize(&self, user: &User, action: Action, scope: Scope<'_>) -> ApiResult<()> {
        if self.access.allowed(user, action, scope) {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    /// Folder of a rule, if the rule exists.
    pub(crate) async fn rule_folder(&self, org_id: i64, uid: &str) -> ApiResult<Option<String>> {
        Ok(self
            .rules
            .get_rule(&RuleKey::new(org_id, uid))
            .await?
            .map(|r| r.folder_uid))
    }
}
