//! Rule group storage.
//!
//! Rule groups are replaced as a whole. Replacing a group assigns UIDs to new
//! rules, bumps the version of changed rules, enforces title uniqueness per
//! folder and rejects writes that carry a stale rule version.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AlertError, Result};
use crate::persist::JsonStore;
use crate::rule::{AlertRule, GroupKey, RuleGroup, RuleKey, conflicting_title};

/// What a group write changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupChange {
    /// The stored group after the write, `None` if it was deleted.
    pub group: Option<RuleGroup>,
    /// Rules created by the write.
    pub added: Vec<RuleKey>,
    /// Rules whose definition changed.
    pub updated: Vec<RuleKey>,
    /// Rules removed by the write.
    pub deleted: Vec<RuleKey>,
}

impl GroupChange {
    /// True when nothing changed.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Persistent storage for rule groups.
#[async_trait]
pub trait RuleStore: Send + Sync + std::fmt::Debug {
    /// Lists the groups of an organisation, optionally restricted to one folder.
    async fn list_groups(&self, org_id: i64, folder_uid: Option<&str>) -> Result<Vec<RuleGroup>>;

    /// Lists every group of every organisation.
    async fn list_all(&self) -> Result<Vec<RuleGroup>>;

    /// Returns one group.
    async fn get_group(&self, key: &GroupKey) -> Result<Option<RuleGroup>>;

    /// Returns one rule.
    async fn get_rule(&self, key: &RuleKey) -> Result<Option<AlertRule>>;

    /// Replaces a group. An empty rule list deletes the group.
    async fn replace_group(&self, group: RuleGroup) -> Result<GroupChange>;

    /// Deletes a group.
    async fn delete_group(&self, key: &GroupKey) -> Result<GroupChange>;

    /// Counter bumped on every change; replicas poll it to resync.
    fn revision(&self) -> u64;
}

/// In-memory [`RuleStore`], optionally snapshotted to a JSON file.
#[derive(Debug)]
pub struct MemoryRuleStore {
    groups: Arc<RwLock<BTreeMap<GroupKey, RuleGroup>>>,
    revision: Arc<AtomicU64>,
    snapshot: Option<JsonStore>,
}

impl MemoryRuleStore {
    /// Creates an empty, purely in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            groups: Arc::new(RwLock::new(BTreeMap::new())),
            revision: Arc::new(AtomicU64::new(0)),
            snapshot: None,
        }
    }

    /// Creates a store backed by `<dir>/rule_groups.json`, loading existing groups.
    pub fn with_snapshot(dir: &Path) -> Self {
        let store = JsonStore::new(dir, "rule_groups");
        let loaded: Vec<RuleGroup> = store.load();
        debug!(count = loaded.len(), "loaded rule groups from disk");
        let groups = loaded.into_iter().map(|g| (g.key(), g)).collect();
        Self {
            groups: Arc::new(RwLock::new(groups)),
            revision: Arc::new(AtomicU64::new(1)),
            snapshot: Some(store),
        }
    }

    fn commit(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
        if let Some(store) = &self.snapshot {
            let snapshot = || self.groups.read().values().cloned().collect::<Vec<RuleGroup>>();
            if let Err(e) = store.save_with(snapshot) {
                warn!(error = %e, "failed to snapshot rule groups");
            }
        }
    }

    fn merge_group(
        groups: &BTreeMap<GroupKey, RuleGroup>,
        mut incoming: RuleGroup,
    ) -> Result<(RuleGroup, GroupChange)> {
        let key = incoming.key();
        let existing: BTreeMap<&str, &AlertRule> = groups
            .get(&key)
            .map(|g| g.rules.iter().map(|r| (r.uid.as_str(), r)).collect())
            .unwrap_or_default();

        let other_titles: HashSet<&str> = groups
            .iter()
            .filter(|(k, _)| {
                k.org_id == key.org_id && k.folder_uid == key.folder_uid && **k != key
            })
            .flat_map(|(_, g)| g.rules.iter().map(|r| r.title.as_str()))
            .collect();
        let other_uids: HashSet<&str> = groups
            .iter()
            .filter(|(k, _)| **k != key)
            .flat_map(|(_, g)| g.rules.iter().map(|r| r.uid.as_str()))
            .collect();

        let now = Utc::now();
        let mut change = GroupChange::default();
        let mut seen = HashSet::new();

        for rule in &mut incoming.rules {
            if other_titles.contains(rule.title.as_str()) {
                return Err(conflicting_title());
            }
            if rule.uid.is_empty() {
                rule.uid = Uuid::new_v4().to_string();
            }
            if other_uids.contains(rule.uid.as_str()) {
                return Err(AlertError::Conflict {
                    reason: format!("rule UID {:?} belongs to another rule group", rule.uid),
                });
            }
            seen.insert(rule.uid.clone());

            match existing.get(rule.uid.as_str()) {
                Some(current) => {
                    if rule.version != 0 && rule.version != current.version {
                        return Err(AlertError::Conflict {
                            reason: format!(
                                "rule {:?} has version {} but version {} was submitted",
                                rule.uid, current.version, rule.version
                            ),
                        });
                    }
                    if same_definition(rule, current) {
                        rule.version = current.version;
                        rule.updated = current.updated;
                    } else {
                        rule.version = current.version + 1;
                        rule.updated = now;
                        change.updated.push(rule.key());
                    }
                }
                None => {
                    rule.version = 1;
                    rule.updated = now;
                    change.added.push(rule.key());
                }
            }
        }

        for uid in existing.keys() {
            if !seen.contains(*uid) {
                change.deleted.push(RuleKey::new(key.org_id, *uid));
            }
        }

        Ok((incoming, change))
    }
}

/// Compares rule definitions, ignoring bookkeeping fields.
fn same_definition(a: &AlertRule, b: &AlertRule) -> bool {
    let mut a = a.clone();
    a.version = b.version;
    a.updated = b.updated;
    a == *b
}

impl Default for MemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryRuleStore {
    fn clone(&self) -> Self {
        Self {
            groups: Arc::clone(&self.groups),
            revision: Arc::clone(&self.revision),
            snapshot: self.snapshot.clone(),
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn list_groups(&self, org_id: i64, folder_uid: Option<&str>) -> Result<Vec<RuleGroup>> {
        Ok(self
            .groups
            .read()
            .values()
            .filter(|g| g.org_id == org_id && folder_uid.is_none_or(|f| g.folder_uid == f))
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<RuleGroup>> {
        Ok(self.groups.read().values().cloned().collect())
    }

    async fn get_group(&self, key: &GroupKey) -> Result<Option<RuleGroup>> {
        Ok(self.groups.read().get(key).cloned())
    }

    async fn get_rule(&self, key: &RuleKey) -> Result<Option<AlertRule>> {
        Ok(self
            .groups
            .read()
            .values()
            .filter(|g| g.org_id == key.org_id)
            .flat_map(|g| g.rules.iter())
            .find(|r| r.uid == key.uid)
            .cloned())
    }

    async fn replace_group(&self, mut group: RuleGroup) -> Result<GroupChange> {
        group.normalize();
        if group.rules.is_empty() {
            return self.delete_group(&group.key()).await;
        }

        let key = group.key();
        let change = {
            let mut groups = self.groups.write();
            let (merged, mut change) = Self::merge_group(&groups, group)?;
            let unchanged = change.is_noop() && groups.get(&key) == Some(&merged);
            groups.insert(key.clone(), merged.clone());
            change.group = Some(merged);
            if unchanged {
                return Ok(change);
            }
            change
        };

        info!(
            group = %key,
            added = change.added.len(),
            updated = change.updated.len(),
            deleted = change.deleted.len(),
            "rule group stored"
        );
        self.commit();
        Ok(change)
    }

    async fn delete_group(&self, key: &GroupKey) -> Result<GroupChange> {
        let removed = self.groups.write().remove(key);
        let Some(removed) = removed else {
            return Err(AlertError::GroupNotFound {
                namespace: key.folder_uid.clone(),
                group: key.name.clone(),
            });
        };
        info!(group = %key, rules = removed.rules.len(), "rule group deleted");
        self.commit();
        Ok(GroupChange {
            group: None,
            added: Vec::new(),
            updated: Vec::new(),
            deleted: removed.rules.iter().map(AlertRule::key).collect(),
        })
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::AlertQuery;
    use std::time::Duration;

    fn rule(title: &str) -> AlertRule {
        let mut r = AlertRule::builder(title, "A")
            .query(AlertQuery::new("A", serde_json::json!({"expr": "1"})))
            .build()
            .unwrap();
        r.uid = String::new();
        r.version = 0;
        r
    }

    fn group(folder: &str, name: &str, rules: Vec<AlertRule>) -> RuleGroup {
        RuleGroup::new(1, folder, name, Duration::from_secs(10), rules)
    }

    #[tokio::test]
    async fn replace_assigns_uids_and_versions() {
        let store = MemoryRuleStore::new();
        let change = store
            .replace_group(group("f", "g", vec![rule("a"), rule("b")]))
            .await
            .unwrap();
        assert_eq!(change.added.len(), 2);
        let stored = change.group.unwrap();
        assert!(stored.rules.iter().all(|r| !r.uid.is_empty() && r.version == 1));
        assert_eq!(store.revision(), 1);
    }

    #[tokio::test]
    async fn unchanged_rule_keeps_version() {
        let store = MemoryRuleStore::new();
        let stored = store
            .replace_group(group("f", "g", vec![rule("a")]))
            .await
            .unwrap()
            .group
            .unwrap();
        let change = store.replace_group(stored.clone()).await.unwrap();
        assert!(change.is_noop());
        assert_eq!(change.group.unwrap().rules[0].version, 1);
        assert_eq!(store.revision(), 1);
    }

    #[tokio::test]
    async fn changed_rule_bumps_version() {
        let store = MemoryRuleStore::new();
        let mut stored = store
            .replace_group(group("f", "g", vec![rule("a")]))
            .await
            .unwrap()
            .group
            .unwrap();
        stored.rules[0].for_duration = Duration::from_secs(60);
        let change = store.replace_group(stored).await.unwrap();
        assert_eq!(change.updated.len(), 1);
        assert_eq!(change.group.unwrap().rules[0].version, 2);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = MemoryRuleStore::new();
        let mut stored = store
            .replace_group(group("f", "g", vec![rule("a")]))
            .await
            .unwrap()
            .group
            .unwrap();
        stored.rules[0].version = 7;
        let err = store.replace_group(stored).await.unwrap_err();
        assert!(matches!(err, AlertError::Conflict { .. }));
    }

    #[tokio::test]
    async fn title_must_be_unique_in_folder() {
        let store = MemoryRuleStore::new();
        store
            .replace_group(group("f", "g1", vec![rule("a")]))
            .await
            .unwrap();
        let err = store
            .replace_group(group("f", "g2", vec![rule("a")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("a conflicting alert rule is found"));
        // Same title in another folder is fine.
        store
            .replace_group(group("other", "g2", vec![rule("a")]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn omitted_rules_are_deleted() {
        let store = MemoryRuleStore::new();
        let stored = store
            .replace_group(group("f", "g", vec![rule("a"), rule("b")]))
            .await
            .unwrap()
            .group
            .unwrap();
        let keep = vec![stored.rules[0].clone()];
        let change = store.replace_group(group("f", "g", keep)).await.unwrap();
        assert_eq!(change.deleted.len(), 1);
    }

    #[tokio::test]
    async fn empty_group_deletes() {
        let store = MemoryRuleStore::new();
        store
            .replace_group(group("f", "g", vec![rule("a")]))
            .await
            .unwrap();
        let change = store.replace_group(group("f", "g", vec![])).await.unwrap();
        assert!(change.group.is_none());
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_missing_group_is_not_found() {
        let store = MemoryRuleStore::new();
        let err = store
            .delete_group(&GroupKey::new(1, "f", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, AlertError::GroupNotFound { .. }));
    }

    #[tokio::test]
    async fn list_filters_by_folder() {
        let store = MemoryRuleStore::new();
        store
            .replace_group(group("f1", "g", vec![rule("a")]))
            .await
            .unwrap();
        store
            .replace_group(group("f2", "g", vec![rule("b")]))
            .await
            .unwrap();
        assert_eq!(store.list_groups(1, Some("f1")).await.unwrap().len(), 1);
        assert_eq!(store.list_groups(1, None).await.unwrap().len(), 2);
        assert!(store.list_groups(2, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_rule_by_uid() {
        let store = MemoryRuleStore::new();
        let stored = store
            .replace_group(group("f", "g", vec![rule("a")]))
            .await
            .unwrap()
            .group
            .unwrap();
        let key = stored.rules[0].key();
        assert_eq!(store.get_rule(&key).await.unwrap().unwrap().title, "a");
    }
}
