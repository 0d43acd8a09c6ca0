//! Server configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial document
//! is enough. Durations use humantime strings (`"10s"`, `"5m"`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Default key used to encrypt integration secrets.
pub const DEFAULT_SECRET_KEY: &str = "vigil-change-me";

/// HA membership settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaSettings {
    /// Name of this replica in the cluster.
    pub peer_name: String,
    /// Only the first live peer evaluates.
    pub single_node_evaluation: bool,
    /// Lease renewal period.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Leases older than this are dead.
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,
}

impl Default for HaSettings {
    fn default() -> Self {
        Self {
            peer_name: format!("vigil-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            single_node_evaluation: true,
            heartbeat_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(15),
        }
    }
}

/// Notification delivery settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Per-attempt timeout of one integration.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Attempts per integration and notification.
    pub max_attempts: u32,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

/// A Prometheus-compatible datasource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    /// UID referenced by rule queries.
    pub uid: String,
    /// Base URL of the Prometheus HTTP API.
    pub url: String,
}

/// Configuration for the Vigil server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API listens on.
    pub bind_addr: SocketAddr,
    /// Public URL of this service, used in generator and silence links.
    pub external_url: String,
    /// Directory for JSON snapshots; in-memory only when unset.
    pub state_dir: Option<PathBuf>,
    /// Key material for integration secrets.
    pub secret_key: String,
    /// Scheduler tick.
    #[serde(with = "humantime_serde")]
    pub base_interval: Duration,
    /// Evaluations running at once.
    pub max_concurrent_evaluations: usize,
    /// Timeout of one rule evaluation.
    #[serde(with = "humantime_serde")]
    pub evaluation_timeout: Duration,
    /// Minimum time between re-sends of an unchanged firing alert.
    #[serde(with = "humantime_serde")]
    pub resend_delay: Duration,
    /// How long resolved instances are kept.
    #[serde(with = "humantime_serde")]
    pub resolved_retention: Duration,
    /// HA membership.
    pub ha: HaSettings,
    /// Notification delivery.
    pub notifications: NotificationSettings,
    /// Sync period for external Alertmanagers.
    #[serde(with = "humantime_serde")]
    pub admin_config_poll_interval: Duration,
    /// Query backends.
    pub datasources: Vec<DatasourceConfig>,
    /// Datasource used for queries whose UID is not configured.
    pub default_datasource: Option<String>,
    /// Allowed CORS origins; any origin when empty.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9093)),
            external_url: "http://localhost:9093".to_string(),
            state_dir: None,
            secret_key: DEFAULT_SECRET_KEY.to_string(),
            base_interval: Duration::from_secs(10),
            max_concurrent_evaluations: 64,
            evaluation_timeout: Duration::from_secs(30),
            resend_delay: Duration::from_secs(30),
            resolved_retention: Duration::from_secs(15 * 60),
            ha: HaSettings::default(),
            notifications: NotificationSettings::default(),
            admin_config_poll_interval: Duration::from_secs(60),
            datasources: Vec::new(),
            default_datasource: None,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ServerError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self, ServerError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| ServerError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the bind address.
    #[must_use]
    pub const fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the snapshot directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Set the scheduler tick.
    #[must_use]
    pub const fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }

    /// Set the replica name.
    #[must_use]
    pub fn with_peer_name(mut self, name: impl Into<String>) -> Self {
        self.ha.peer_name = name.into();
        self
    }

    /// Enable or disable single-node evaluation.
    #[must_use]
    pub const fn with_single_node_evaluation(mut self, enabled: bool) -> Self {
        self.ha.single_node_evaluation = enabled;
        self
    }

    /// Set the external URL.
    #[must_use]
    pub fn with_external_url(mut self, url: impl Into<String>) -> Self {
        self.external_url = url.into();
        self
    }

    /// Add a Prometheus datasource.
    #[must_use]
    pub fn with_datasource(mut self, uid: impl Into<String>, url: impl Into<String>) -> Self {
        self.datasources.push(DatasourceConfig {
            uid: uid.into(),
            url: url.into(),
        });
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<(), ServerError> {
        let invalid = |reason: &str| Err(ServerError::Config(reason.to_string()));

        if self.base_interval.is_zero() {
            return invalid("base_interval must be greater than zero");
        }
        if self.base_interval.subsec_nanos() != 0 {
            return invalid("base_interval must be a whole number of seconds");
        }
        if self.max_concurrent_evaluations == 0 {
            return invalid("max_concurrent_evaluations must be at least 1");
        }
        if self.evaluation_timeout.is_zero() {
            return invalid("evaluation_timeout must be greater than zero");
        }
        if self.secret_key.is_empty() {
            return invalid("secret_key cannot be empty");
        }
        if self.ha.peer_name.trim().is_empty() {
            return invalid("ha.peer_name cannot be empty");
        }
        if self.ha.heartbeat_interval.is_zero() {
            return invalid("ha.heartbeat_interval must be greater than zero");
        }
        if self.ha.peer_timeout <= self.ha.heartbeat_interval {
            return invalid("ha.peer_timeout must be longer than ha.heartbeat_interval");
        }
        if self.notifications.max_attempts == 0 {
            return invalid("notifications.max_attempts must be at least 1");
        }
        if self.admin_config_poll_interval.is_zero() {
            return invalid("admin_config_poll_interval must be greater than zero");
        }
        for ds in &self.datasources {
            if ds.uid.is_empty() {
                return invalid("datasource uid cannot be empty");
            }
            if !ds.url.starts_with("http://") && !ds.url.starts_with("https://") {
                return Err(ServerError::Config(format!(
                    "datasource {:?} must have an http(s) URL",
                    ds.uid
                )));
            }
        }
        if let Some(default) = &self.default_datasource {
            if !self.datasources.iter().any(|ds| &ds.uid == default) {
                return Err(ServerError::Config(format!(
                    "default_datasource {default:?} is not a configured datasource"
                )));
            }
        }
        Ok(())
    }
}
