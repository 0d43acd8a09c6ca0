//! Versioned storage of per-organisation Alertmanager configurations.
//!
//! Every accepted configuration becomes a history entry. Secure settings
//! are encrypted before they are stored and never leave the store in
//! plaintext except through [`ConfigStore::decrypted`]. Saving a
//! configuration identical to the current one is a no-op.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vigil_alerts::{Clock, JsonStore};

use crate::config::AlertmanagerConfig;
use crate::error::{NotifyError, Result};
use crate::integrations::IntegrationFactory;
use crate::secrets::SecretsService;

/// Number of history entries kept per organisation.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// One stored configuration version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Entry ID, unique across organisations.
    pub id: u64,
    /// Owning organisation.
    pub org_id: i64,
    /// Configuration with encrypted secure settings.
    pub config: AlertmanagerConfig,
    /// Hash of the plaintext configuration.
    pub hash: String,
    /// When the entry was saved.
    pub created_at: DateTime<Utc>,
    /// When the entry was last applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<DateTime<Utc>>,
}

/// Result of [`ConfigStore::save`].
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    /// Current entry ID.
    pub id: u64,
    /// False if the configuration was identical to the current one.
    pub changed: bool,
    /// The configuration with decrypted secure settings, ready to apply.
    pub config: AlertmanagerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    next_id: u64,
    entries: Vec<HistoryEntry>,
    current: BTreeMap<i64, u64>,
}

impl Snapshot {
    fn current(&self, org_id: i64) -> Option<&HistoryEntry> {
        let id = self.current.get(&org_id)?;
        self.entries.iter().find(|e| e.id == *id)
    }
}

/// Configuration history for every organisation.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<Snapshot>>,
    secrets: SecretsService,
    factory: IntegrationFactory,
    clock: Arc<dyn Clock>,
    history_limit: usize,
    snapshot: Option<JsonStore>,
}

fn redact(config: &mut AlertmanagerConfig) {
    for integration in config.integrations_mut() {
        for key in std::mem::take(&mut integration.secure_settings).into_keys() {
            integration.secure_fields.insert(key, true);
        }
    }
}

/// Gives integrations posted without a UID the UID of the stored
/// integration with the same receiver, name and type.
fn inherit_uids(config: &mut AlertmanagerConfig, previous: &AlertmanagerConfig) {
    let mut used: HashSet<String> = config
        .integrations()
        .filter(|i| !i.uid.is_empty())
        .map(|i| i.uid.clone())
        .collect();
    for receiver in &mut config.alertmanager_config.receivers {
        let Some(old) = previous.receiver(&receiver.name) else {
            continue;
        };
        for integration in receiver.integrations.iter_mut().filter(|i| i.uid.is_empty()) {
            let candidate = old.integrations.iter().find(|o| {
                o.name == integration.name && o.kind == integration.kind && !used.contains(&o.uid)
            });
            if let Some(o) = candidate {
                integration.uid.clone_from(&o.uid);
                used.insert(o.uid.clone());
            }
        }
    }
}

impl ConfigStore {
    /// Creates an in-memory store.
    pub fn new(secrets: SecretsService, factory: IntegrationFactory, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Snapshot::default())),
            secrets,
            factory,
            clock,
            history_limit: DEFAULT_HISTORY_LIMIT,
            snapshot: None,
        }
    }

    /// Persists to `<dir>/alertmanager_configs.json`, loading what is there.
    #[must_use]
    pub fn with_snapshot(mut self, dir: &Path) -> Self {
        let store = JsonStore::new(dir, "alertmanager_configs");
        let loaded: Snapshot = store.load();
        debug!(entries = loaded.entries.len(), "loaded alertmanager configuration history");
        *self.inner.write() = loaded;
        self.snapshot = Some(store);
        self
    }

    /// Sets how many entries are kept per organisation.
    #[must_use]
    pub const fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// The integration factory used for validation.
    #[must_use]
    pub const fn factory(&self) -> &IntegrationFactory {
        &self.factory
    }

    fn persist(&self) {
        if let Some(store) = &self.snapshot {
            if let Err(e) = store.save_with(|| self.inner.read().clone()) {
                warn!(path = %store.path().display(), error = %e, "failed to persist alertmanager configurations");
            }
        }
    }

    /// Validates and stores a configuration for an organisation.
    ///
    /// Integrations without a UID get one. A secure setting omitted from an
    /// integration that already exists keeps its stored value unless
    /// `secureFields` marks it `false`.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::InvalidConfig` or `NotifyError::Template` if
    /// the configuration is invalid, and `NotifyError::Secret` if stored
    /// secrets cannot be decrypted.
    pub fn save(&self, org_id: i64, mut config: AlertmanagerConfig) -> Result<SaveOutcome> {
        let current = self.inner.read().current(org_id).cloned();

        if let Some(current) = &current {
            let mut previous = current.config.clone();
            self.secrets.decrypt_config(&mut previous)?;
            inherit_uids(&mut config, &previous);
            let previous: BTreeMap<String, _> = previous
                .integrations()
                .map(|i| (i.uid.clone(), i.secure_settings.clone()))
                .collect();
            for integration in config.integrations_mut() {
                let Some(stored) = previous.get(&integration.uid) else {
                    continue;
                };
                for (key, value) in stored {
                    let removed = integration.secure_fields.get(key) == Some(&false);
                    if !removed && !integration.secure_settings.contains_key(key) {
                        integration.secure_settings.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        config.assign_uids();
        for integration in config.integrations_mut() {
            integration.secure_fields.clear();
        }

        self.factory.validate(&config)?;
        let hash = config.fingerprint();

        if let Some(current) = current.filter(|c| c.hash == hash) {
            debug!(org_id, id = current.id, "alertmanager configuration unchanged");
            return Ok(SaveOutcome {
                id: current.id,
                changed: false,
                config,
            });
        }

        let mut encrypted = config.clone();
        self.secrets.encrypt_config(&mut encrypted)?;
        let id = {
            let mut inner = self.inner.write();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.entries.push(HistoryEntry {
                id,
                org_id,
                config: encrypted,
                hash,
                created_at: self.clock.now(),
                last_applied: None,
            });
            inner.current.insert(org_id, id);

            let mut org_entries: Vec<u64> = inner
                .entries
                .iter()
                .filter(|e| e.org_id == org_id)
                .map(|e| e.id)
                .collect();
            if org_entries.len() > self.history_limit {
                org_entries.sort_unstable();
                let cutoff = org_entries[org_entries.len() - self.history_limit];
                inner.entries.retain(|e| e.org_id != org_id || e.id >= cutoff);
            }
            id
        };
        self.persist();
        info!(org_id, id, "alertmanager configuration saved");
        Ok(SaveOutcome {
            id,
            changed: true,
            config,
        })
    }

    /// Records that the current configuration of an organisation was applied.
    pub fn mark_applied(&self, org_id: i64, id: u64) {
        let now = self.clock.now();
        {
            let mut inner = self.inner.write();
            if let Some(entry) = inner.entries.iter_mut().find(|e| e.id == id && e.org_id == org_id) {
                entry.last_applied = Some(now);
            }
        }
        self.persist();
    }

    /// Current entry of an organisation, secrets encrypted.
    #[must_use]
    pub fn current(&self, org_id: i64) -> Option<HistoryEntry> {
        self.inner.read().current(org_id).cloned()
    }

    /// Current configuration with secure settings replaced by `secureFields`.
    #[must_use]
    pub fn redacted(&self, org_id: i64) -> Option<AlertmanagerConfig> {
        self.current(org_id).map(|e| {
            let mut config = e.config;
            redact(&mut config);
            config
        })
    }

    /// Current configuration with secure settings decrypted.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Secret` if a value cannot be decrypted.
    pub fn decrypted(&self, org_id: i64) -> Result<Option<AlertmanagerConfig>> {
        let Some(entry) = self.current(org_id) else {
            return Ok(None);
        };
        let mut config = entry.config;
        self.secrets.decrypt_config(&mut config)?;
        Ok(Some(config))
    }

    /// Replaces the current configuration with the default one.
    ///
    /// # Errors
    ///
    /// See [`ConfigStore::save`].
    pub fn reset(&self, org_id: i64) -> Result<SaveOutcome> {
        self.save(org_id, AlertmanagerConfig::default())
    }

    /// History of an organisation, newest first, secrets redacted.
    #[must_use]
    pub fn history(&self, org_id: i64, limit: usize) -> Vec<HistoryEntry> {
        let mut entries: Vec<HistoryEntry> = self
            .inner
            .read()
            .entries
            .iter()
            .filter(|e| e.org_id == org_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        entries.truncate(limit);
        for entry in &mut entries {
            redact(&mut entry.config);
        }
        entries
    }

    /// Makes a history entry current again.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::NotFound` if the organisation has no such entry,
    /// or the validation error if the entry no longer validates.
    pub fn activate(&self, org_id: i64, id: u64) -> Result<SaveOutcome> {
        let entry = self
            .inner
            .read()
            .entries
            .iter()
            .find(|e| e.id == id && e.org_id == org_id)
            .cloned()
            .ok_or_else(|| NotifyError::NotFound {
                kind: "configuration history entry",
                name: id.to_string(),
            })?;
        let mut config = entry.config;
        self.secrets.decrypt_config(&mut config)?;
        self.factory.validate(&config)?;
        self.inner.write().current.insert(org_id, id);
        self.persist();
        info!(org_id, id, "alertmanager configuration activated from history");
        Ok(SaveOutcome {
            id,
            changed: true,
            config,
        })
    }

    /// Organisations with a stored configuration.
    #[must_use]
    pub fn orgs(&self) -> Vec<i64> {
        self.inner.read().current.keys().copied().collect()
    }
}
