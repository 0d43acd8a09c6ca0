//! Alert instance storage.
//!
//! The [`StateStore`] is the single source of truth for instance state shared
//! by every replica. Writes carry the instance version and an older version
//! never overwrites a newer one, so a stale evaluator cannot resurrect state
//! after a failover.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::instance::{AlertInstance, InstanceKey};
use crate::persist::JsonStore;
use crate::rule::RuleKey;

/// Result of a batch write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Instances written.
    pub written: usize,
    /// Instances rejected because the store holds a newer version.
    pub rejected: Vec<InstanceKey>,
}

/// Persistent storage for alert instances.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Writes instances, skipping any whose version is older than the stored one.
    async fn save(&self, instances: &[AlertInstance]) -> Result<SaveOutcome>;

    /// Deletes instances.
    async fn delete(&self, keys: &[InstanceKey]) -> Result<()>;

    /// Deletes every instance of a rule.
    async fn delete_rule(&self, rule: &RuleKey) -> Result<()>;

    /// Lists instances of an organisation.
    async fn list(&self, org_id: i64) -> Result<Vec<AlertInstance>>;

    /// Lists instances of one rule.
    async fn list_for_rule(&self, rule: &RuleKey) -> Result<Vec<AlertInstance>>;

    /// Lists every instance.
    async fn list_all(&self) -> Result<Vec<AlertInstance>>;
}

/// In-memory [`StateStore`], optionally snapshotted to a JSON file.
#[derive(Debug)]
pub struct MemoryStateStore {
    instances: Arc<RwLock<HashMap<InstanceKey, AlertInstance>>>,
    snapshot: Option<JsonStore>,
}

impl MemoryStateStore {
    /// Creates an empty, purely in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            snapshot: None,
        }
    }

    /// Creates a store backed by `<dir>/alert_instances.json`, loading existing state.
    pub fn with_snapshot(dir: &Path) -> Self {
        let store = JsonStore::new(dir, "alert_instances");
        let loaded: Vec<AlertInstance> = store.load();
        debug!(count = loaded.len(), "loaded alert instances from disk");
        let instances = loaded.into_iter().map(|i| (i.key(), i)).collect();
        Self {
            instances: Arc::new(RwLock::new(instances)),
            snapshot: Some(store),
        }
    }

    /// Number of stored instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    /// True when the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Returns one instance.
    #[must_use]
    pub fn get(&self, key: &InstanceKey) -> Option<AlertInstance> {
        self.instances.read().get(key).cloned()
    }

    fn persist(&self) {
        if let Some(store) = &self.snapshot {
            let snapshot = || self.instances.read().values().cloned().collect::<Vec<AlertInstance>>();
            if let Err(e) = store.save_with(snapshot) {
                warn!(error = %e, "failed to snapshot alert instances");
            }
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryStateStore {
    fn clone(&self) -> Self {
        Self {
            instances: Arc::clone(&self.instances),
            snapshot: self.snapshot.clone(),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, instances: &[AlertInstance]) -> Result<SaveOutcome> {
        let mut outcome = SaveOutcome::default();
        {
            let mut map = self.instances.write();
            for instance in instances {
                let key = instance.key();
                match map.get(&key) {
                    Some(existing) if existing.version > instance.version => {
                        outcome.rejected.push(key);
                    }
                    _ => {
                        map.insert(key, instance.clone());
                        outcome.written += 1;
                    }
                }
            }
        }
        if !outcome.rejected.is_empty() {
            debug!(rejected = outcome.rejected.len(), "skipped stale instance writes");
        }
        self.persist();
        Ok(outcome)
    }

    async fn delete(&self, keys: &[InstanceKey]) -> Result<()> {
        {
            let mut map = self.instances.write();
            for key in keys {
                map.remove(key);
            }
        }
        self.persist();
        Ok(())
    }

    async fn delete_rule(&self, rule: &RuleKey) -> Result<()> {
        self.instances.write().retain(|k, _| &k.rule != rule);
        self.persist();
        Ok(())
    }

    async fn list(&self, org_id: i64) -> Result<Vec<AlertInstance>> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| i.rule.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn list_for_rule(&self, rule: &RuleKey) -> Result<Vec<AlertInstance>> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| &i.rule == rule)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<AlertInstance>> {
        Ok(self.instances.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;
    use chrono::Utc;

    fn instance(uid: &str, version: u64) -> AlertInstance {
        let mut i = AlertInstance::new(
            RuleKey::new(1, uid),
            "folder",
            Labels::new().with("alertname", uid),
            Utc::now(),
        );
        i.version = version;
        i
    }

    #[tokio::test]
    async fn save_and_list() {
        let store = MemoryStateStore::new();
        store.save(&[instance("a", 1), instance("b", 1)]).await.unwrap();
        assert_eq!(store.list(1).await.unwrap().len(), 2);
        assert!(store.list(2).await.unwrap().is_empty());
        assert_eq!(
            store.list_for_rule(&RuleKey::new(1, "a")).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn older_version_is_rejected() {
        let store = MemoryStateStore::new();
        store.save(&[instance("a", 5)]).await.unwrap();
        let outcome = store.save(&[instance("a", 3)]).await.unwrap();
        assert_eq!(outcome.written, 0);
        assert_eq!(outcome.rejected.len(), 1);
        let stored = store.get(&instance("a", 0).key()).unwrap();
        assert_eq!(stored.version, 5);
    }

    #[tokio::test]
    async fn equal_version_last_writer_wins() {
        let store = MemoryStateStore::new();
        let mut first = instance("a", 2);
        first.error = Some("first".to_string());
        let mut second = instance("a", 2);
        second.error = Some("second".to_string());
        store.save(&[first]).await.unwrap();
        store.save(&[second]).await.unwrap();
        let stored = store.get(&instance("a", 0).key()).unwrap();
        assert_eq!(stored.error.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn delete_rule_removes_all_instances() {
        let store = MemoryStateStore::new();
        store.save(&[instance("a", 1), instance("b", 1)]).await.unwrap();
        store.delete_rule(&RuleKey::new(1, "a")).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = MemoryStateStore::new();
        let other = store.clone();
        store.save(&[instance("a", 1)]).await.unwrap();
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStateStore::with_snapshot(dir.path());
            store.save(&[instance("a", 4)]).await.unwrap();
        }
        let store = MemoryStateStore::with_snapshot(dir.path());
        let stored = store.get(&instance("a", 0).key()).unwrap();
        assert_eq!(stored.version, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_all_reach_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStateStore::with_snapshot(dir.path());

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..32 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .save(&[instance(&format!("rule-{n}"), 1)])
                    .await
                    .unwrap();
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let reloaded = MemoryStateStore::with_snapshot(dir.path());
        assert_eq!(reloaded.len(), 32);
    }
}
