//! External Alertmanagers.
//!
//! Each organisation may name external Alertmanagers in its
//! [`AdminConfiguration`]. The [`Distributor`] periodically pushes the
//! organisation's configuration to every one of them and checks that they
//! answer, and forwards alerts to them when the organisation sends alerts
//! externally.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vigil_alerts::{AlertingMetrics, Clock, JsonStore, PostableAlert};

use crate::config::AlertmanagerConfig;
use crate::config_store::ConfigStore;
use crate::error::{NotifyError, Result};

/// Default period between syncs.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Where an organisation's alerts go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendAlertsTo {
    /// Only the built-in Alertmanager.
    #[default]
    Internal,
    /// Only the external Alertmanagers.
    External,
    /// Both.
    All,
}

impl SendAlertsTo {
    /// True if alerts are routed internally.
    #[must_use]
    pub const fn internal(self) -> bool {
        matches!(self, Self::Internal | Self::All)
    }

    /// True if alerts are forwarded to external Alertmanagers.
    #[must_use]
    pub const fn external(self) -> bool {
        matches!(self, Self::External | Self::All)
    }
}

/// External Alertmanagers of an organisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfiguration {
    /// Owning organisation; filled in from the request context.
    #[serde(default)]
    pub org_id: i64,
    /// Base URLs.
    #[serde(default)]
    pub alertmanagers: Vec<String>,
    /// Where alerts go.
    #[serde(default, alias = "alertmanagersChoice")]
    pub send_alerts_to: SendAlertsTo,
}

impl AdminConfiguration {
    /// Checks URLs and the delivery choice.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::InvalidConfig` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        for raw in &self.alertmanagers {
            let url = reqwest::Url::parse(raw)
                .map_err(|e| NotifyError::invalid_config(format!("invalid alertmanager URL {raw:?}: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(NotifyError::invalid_config(format!(
                    "unsupported scheme {:?} in alertmanager URL",
                    url.scheme()
                )));
            }
        }
        if self.send_alerts_to == SendAlertsTo::External && self.alertmanagers.is_empty() {
            return Err(NotifyError::invalid_config(
                "at least one Alertmanager must be provided to choose this option",
            ));
        }
        Ok(())
    }
}

/// Admin configurations of every organisation.
#[derive(Debug, Clone, Default)]
pub struct AdminConfigStore {
    configs: Arc<RwLock<BTreeMap<i64, AdminConfiguration>>>,
    snapshot: Option<JsonStore>,
}

impl AdminConfigStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists to `<dir>/admin_configs.json`, loading what is there.
    #[must_use]
    pub fn with_snapshot(mut self, dir: &Path) -> Self {
        let store = JsonStore::new(dir, "admin_configs");
        let loaded: Vec<AdminConfiguration> = store.load();
        *self.configs.write() = loaded.into_iter().map(|c| (c.org_id, c)).collect();
        self.snapshot = Some(store);
        self
    }

    fn persist(&self) {
        if let Some(store) = &self.snapshot {
            let snapshot = || {
                self.configs
                    .read()
                    .values()
                    .cloned()
                    .collect::<Vec<AdminConfiguration>>()
            };
            if let Err(e) = store.save_with(snapshot) {
                warn!(path = %store.path().display(), error = %e, "failed to persist admin configurations");
            }
        }
    }

    /// Configuration of an organisation.
    #[must_use]
    pub fn get(&self, org_id: i64) -> Option<AdminConfiguration> {
        self.configs.read().get(&org_id).cloned()
    }

    /// Validates and stores a configuration.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::InvalidConfig` if it does not validate.
    pub fn set(&self, mut config: AdminConfiguration) -> Result<()> {
        config.validate()?;
        for url in &mut config.alertmanagers {
            *url = url.trim_end_matches('/').to_string();
        }
        config.alertmanagers.dedup();
        info!(
            org_id = config.org_id,
            alertmanagers = config.alertmanagers.len(),
            send_alerts_to = ?config.send_alerts_to,
            "admin configuration updated"
        );
        self.configs.write().insert(config.org_id, config);
        self.persist();
        Ok(())
    }

    /// Removes an organisation's configuration. Returns `false` if it had none.
    pub fn delete(&self, org_id: i64) -> bool {
        let removed = self.configs.write().remove(&org_id).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    /// Where an organisation's alerts go.
    #[must_use]
    pub fn send_alerts_to(&self, org_id: i64) -> SendAlertsTo {
        self.get(org_id).map(|c| c.send_alerts_to).unwrap_or_default()
    }

    /// Every stored configuration.
    #[must_use]
    pub fn all(&self) -> Vec<AdminConfiguration> {
        self.configs.read().values().cloned().collect()
    }
}

/// Client for the endpoints of an external Alertmanager.
#[async_trait]
pub trait RemoteAlertmanager: Send + Sync + fmt::Debug {
    /// Replaces the remote configuration.
    async fn push_config(&self, url: &str, config: &AlertmanagerConfig) -> Result<()>;

    /// Checks that the remote is ready.
    async fn status(&self, url: &str) -> Result<()>;

    /// Sends alerts.
    async fn send_alerts(&self, url: &str, alerts: &[PostableAlert]) -> Result<()>;
}

/// [`RemoteAlertmanager`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemoteAlertmanager {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for HttpRemoteAlertmanager {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl HttpRemoteAlertmanager {
    /// Creates a client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(10),
        }
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send(&self, url: &str, request: reqwest::RequestBuilder) -> Result<()> {
        let remote = |reason: String| NotifyError::Remote {
            url: redact_url(url),
            reason,
        };
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| remote(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(remote(format!("unexpected status {status}: {}", body.trim())))
    }
}

#[async_trait]
impl RemoteAlertmanager for HttpRemoteAlertmanager {
    async fn push_config(&self, url: &str, config: &AlertmanagerConfig) -> Result<()> {
        let request = self.client.post(format!("{url}/config/api/v1/alerts")).json(config);
        self.send(url, request).await
    }

    async fn status(&self, url: &str) -> Result<()> {
        let request = self.client.get(format!("{url}/api/v2/status"));
        self.send(url, request).await
    }

    async fn send_alerts(&self, url: &str, alerts: &[PostableAlert]) -> Result<()> {
        let request = self.client.post(format!("{url}/api/v2/alerts")).json(alerts);
        self.send(url, request).await
    }
}

/// Replaces a password in a URL's userinfo.
#[must_use]
pub fn redact_url(raw: &str) -> String {
    match reqwest::Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some("xxxxx")).is_ok() {
                url.to_string().trim_end_matches('/').to_string()
            } else {
                raw.to_string()
            }
        }
        _ => raw.to_string(),
    }
}

/// Sync state of an external Alertmanager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteState {
    /// The last sync succeeded.
    Active,
    /// Not synced yet, or the last sync failed.
    Dropped,
}

/// Sync status of one external Alertmanager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    /// Base URL, password redacted.
    pub url: String,
    /// Active or dropped.
    pub state: RemoteState,
    /// Time of the last sync attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    /// Error of the last attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Keeps external Alertmanagers in sync with each organisation.
#[derive(Debug, Clone)]
pub struct Distributor {
    admin: AdminConfigStore,
    configs: ConfigStore,
    remote: Arc<dyn RemoteAlertmanager>,
    metrics: AlertingMetrics,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    statuses: Arc<RwLock<HashMap<i64, BTreeMap<String, RemoteStatus>>>>,
}

impl Distributor {
    /// Creates a distributor.
    pub fn new(
        admin: AdminConfigStore,
        configs: ConfigStore,
        remote: Arc<dyn RemoteAlertmanager>,
        metrics: AlertingMetrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            admin,
            configs,
            remote,
            metrics,
            clock,
            poll_interval: DEFAULT_POLL_INTERVAL,
            statuses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Sets the sync period.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The admin configurations this distributor follows.
    #[must_use]
    pub const fn admin(&self) -> &AdminConfigStore {
        &self.admin
    }

    async fn sync_one(&self, org_id: i64, url: &str, config: &AlertmanagerConfig) -> RemoteStatus {
        let result = match self.remote.push_config(url, config).await {
            Ok(()) => self.remote.status(url).await,
            Err(e) => Err(e),
        };
        let up = result.is_ok();
        self.metrics.set_external_alertmanager_up(org_id, url, up);
        let last_error = result.err().map(|e| {
            warn!(org_id, url = %redact_url(url), error = %e, "external alertmanager sync failed");
            e.to_string()
        });
        RemoteStatus {
            url: redact_url(url),
            state: if up { RemoteState::Active } else { RemoteState::Dropped },
            last_sync: Some(self.clock.now()),
            last_error,
        }
    }

    /// Pushes the current configuration of an organisation to each of its
    /// external Alertmanagers and checks their status.
    ///
    /// A failure on one URL does not affect the others.
    pub async fn sync_org(&self, org_id: i64) -> Vec<RemoteStatus> {
        let Some(admin) = self.admin.get(org_id).filter(|c| !c.alertmanagers.is_empty()) else {
            self.statuses.write().remove(&org_id);
            return Vec::new();
        };
        let config = match self.configs.decrypted(org_id) {
            Ok(Some(config)) => config,
            Ok(None) => AlertmanagerConfig::default(),
            Err(e) => {
                warn!(org_id, error = %e, "cannot read configuration for external alertmanagers");
                return self.alertmanagers(org_id);
            }
        };

        let results = join_all(
            admin
                .alertmanagers
                .iter()
                .map(|url| self.sync_one(org_id, url, &config)),
        )
        .await;
        let active = results.iter().filter(|s| s.state == RemoteState::Active).count();
        debug!(org_id, active, total = results.len(), "external alertmanagers synced");

        let by_url: BTreeMap<String, RemoteStatus> = admin
            .alertmanagers
            .iter()
            .cloned()
            .zip(results.iter().cloned())
            .collect();
        self.statuses.write().insert(org_id, by_url);
        results
    }

    /// Syncs every organisation with an admin configuration.
    pub async fn sync_all(&self) {
        let orgs: Vec<i64> = self.admin.all().iter().map(|c| c.org_id).collect();
        let known: Vec<i64> = self.statuses.read().keys().copied().collect();
        for org_id in known.into_iter().filter(|o| !orgs.contains(o)) {
            self.statuses.write().remove(&org_id);
        }
        join_all(orgs.into_iter().map(|org_id| self.sync_org(org_id))).await;
    }

    /// Status of each configured external Alertmanager of an organisation.
    ///
    /// URLs not synced yet are reported as dropped.
    #[must_use]
    pub fn alertmanagers(&self, org_id: i64) -> Vec<RemoteStatus> {
        let Some(admin) = self.admin.get(org_id) else {
            return Vec::new();
        };
        let statuses = self.statuses.read();
        let known = statuses.get(&org_id);
        admin
            .alertmanagers
            .iter()
            .map(|url| {
                known.and_then(|k| k.get(url)).cloned().unwrap_or_else(|| RemoteStatus {
                    url: redact_url(url),
                    state: RemoteState::Dropped,
                    last_sync: None,
                    last_error: None,
                })
            })
            .collect()
    }

    /// Forwards alerts to every external Alertmanager of an organisation.
    pub async fn forward(&self, org_id: i64, alerts: &[PostableAlert]) {
        let Some(admin) = self.admin.get(org_id) else {
            return;
        };
        if alerts.is_empty() {
            return;
        }
        let results = join_all(
            admin
                .alertmanagers
                .iter()
                .map(|url| async move { (url, self.remote.send_alerts(url, alerts).await) }),
        )
        .await;
        for (url, result) in results {
            if let Err(e) = result {
                warn!(org_id, url = %redact_url(url), error = %e, "failed to forward alerts");
            }
        }
    }

    /// Syncs every poll interval until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::IntegrationFactory;
    use crate::secrets::SecretsService;
    use crate::testutil::serve;
    use axum::http::StatusCode;
    use vigil_alerts::SystemClock;

    fn distributor(admin: AdminConfigStore) -> Distributor {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let configs = ConfigStore::new(
            SecretsService::new(b"test master key"),
            IntegrationFactory::new("http://vigil.local"),
            Arc::clone(&clock),
        );
        Distributor::new(
            admin,
            configs,
            Arc::new(HttpRemoteAlertmanager::default()),
            AlertingMetrics::new(),
            clock,
        )
    }

    mod admin_config_tests {
        use super::*;

        #[test]
        fn external_requires_alertmanagers() {
            let config = AdminConfiguration {
                org_id: 1,
                alertmanagers: Vec::new(),
                send_alerts_to: SendAlertsTo::External,
            };
            assert!(config.validate().is_err());
        }

        #[test]
        fn rejects_bad_urls() {
            let store = AdminConfigStore::new();
            let config = AdminConfiguration {
                org_id: 1,
                alertmanagers: vec!["ftp://am.example.com".to_string()],
                send_alerts_to: SendAlertsTo::All,
            };
            assert!(store.set(config).is_err());
            assert!(store.get(1).is_none());
        }

        #[test]
        fn accepts_grafana_field_name() {
            let config: AdminConfiguration = serde_json::from_value(serde_json::json!({
                "alertmanagers": ["http://am:9093/"],
                "alertmanagersChoice": "all"
            }))
            .unwrap();
            assert_eq!(config.send_alerts_to, SendAlertsTo::All);
            assert!(config.send_alerts_to.internal());
            assert!(config.send_alerts_to.external());
        }

        #[test]
        fn snapshot_survives_restart() {
            let dir = tempfile::tempdir().unwrap();
            let store = AdminConfigStore::new().with_snapshot(dir.path());
            store
                .set(AdminConfiguration {
                    org_id: 3,
                    alertmanagers: vec!["http://am:9093/".to_string()],
                    send_alerts_to: SendAlertsTo::External,
                })
                .unwrap();
            let reloaded = AdminConfigStore::new().with_snapshot(dir.path());
            assert_eq!(reloaded.get(3).unwrap().alertmanagers, vec!["http://am:9093"]);
            assert_eq!(reloaded.send_alerts_to(3), SendAlertsTo::External);
            assert_eq!(reloaded.send_alerts_to(4), SendAlertsTo::Internal);
        }

        #[test]
        fn redacts_passwords() {
            assert_eq!(
                redact_url("http://admin:secret@am:9093"),
                "http://admin:xxxxx@am:9093"
            );
            assert_eq!(redact_url("http://am:9093"), "http://am:9093");
        }
    }

    mod sync_tests {
        use super::*;

        #[tokio::test]
        async fn healthy_remotes_become_active() {
            let (first, first_requests) = serve(StatusCode::OK, "{}").await;
            let (second, _) = serve(StatusCode::OK, "{}").await;
            let admin = AdminConfigStore::new();
            admin
                .set(AdminConfiguration {
                    org_id: 1,
                    alertmanagers: vec![first.clone(), second],
                    send_alerts_to: SendAlertsTo::All,
                })
                .unwrap();
            let distributor = distributor(admin);

            assert!(
                distributor
                    .alertmanagers(1)
                    .iter()
                    .all(|s| s.state == RemoteState::Dropped)
            );
            distributor.sync_all().await;
            let statuses = distributor.alertmanagers(1);
            assert_eq!(statuses.len(), 2);
            assert!(statuses.iter().all(|s| s.state == RemoteState::Active));

            let paths: Vec<String> = first_requests.lock().iter().map(|r| r.path.clone()).collect();
            assert_eq!(paths, vec!["/config/api/v1/alerts", "/api/v2/status"]);
            assert!(first_requests.lock()[0].body["alertmanager_config"]["route"].is_object());
        }

        #[tokio::test]
        async fn failing_remote_is_dropped_without_affecting_others() {
            let (good, _) = serve(StatusCode::OK, "{}").await;
            let (bad, _) = serve(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;
            let admin = AdminConfigStore::new();
            admin
                .set(AdminConfiguration {
                    org_id: 1,
                    alertmanagers: vec![good.clone(), bad.clone()],
                    send_alerts_to: SendAlertsTo::External,
                })
                .unwrap();
            let distributor = distributor(admin);
            distributor.sync_org(1).await;

            let statuses = distributor.alertmanagers(1);
            assert_eq!(statuses[0].state, RemoteState::Active);
            assert_eq!(statuses[1].state, RemoteState::Dropped);
            assert!(statuses[1].last_error.as_deref().unwrap_or("").contains("500"));
        }

        #[tokio::test]
        async fn forwards_alerts() {
            let (url, requests) = serve(StatusCode::OK, "").await;
            let admin = AdminConfigStore::new();
            admin
                .set(AdminConfiguration {
                    org_id: 2,
                    alertmanagers: vec![url],
                    send_alerts_to: SendAlertsTo::External,
                })
                .unwrap();
            let distributor = distributor(admin);
            let now = Utc::now();
            let alert = PostableAlert {
                labels: vigil_alerts::Labels::new().with("alertname", "Disk"),
                annotations: BTreeMap::new(),
                starts_at: now,
                ends_at: now + chrono::Duration::minutes(5),
                generator_url: String::new(),
            };
            distributor.forward(2, &[alert]).await;

            let requests = requests.lock();
            assert_eq!(requests[0].path, "/api/v2/alerts");
            assert_eq!(requests[0].body[0]["labels"]["alertname"], "Disk");
        }

        #[tokio::test]
        async fn removed_admin_config_clears_status() {
            let (url, _) = serve(StatusCode::OK, "{}").await;
            let admin = AdminConfigStore::new();
            admin
                .set(AdminConfiguration {
                    org_id: 1,
                    alertmanagers: vec![url],
                    send_alerts_to: SendAlertsTo::All,
                })
                .unwrap();
            let distributor = distributor(admin.clone());
            distributor.sync_all().await;
            assert!(admin.delete(1));
            distributor.sync_all().await;
            assert!(distributor.alertmanagers(1).is_empty());
        }
    }
}
