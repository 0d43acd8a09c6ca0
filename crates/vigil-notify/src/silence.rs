//! Silences.
//!
//! A silence mutes every alert matched by all of its matchers while
//! `starts_at <= now < ends_at`. Silences are checked at flush time, never
//! cached on the alert. Every change bumps [`Silences::revision`] and wakes
//! [`Silences::changed`] waiters, and [`Silences::silenced_until`] tells the
//! pipeline when a muted alert becomes deliverable again.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use vigil_alerts::clock::chrono_duration;
use vigil_alerts::labels::RULE_UID_LABEL;
use vigil_alerts::{Clock, JsonStore, Labels, Matchers};

use crate::error::{NotifyError, Result};

/// Default time expired silences are kept before being expunged.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Lifecycle state of a silence, derived from the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SilenceState {
    /// Currently muting.
    Active,
    /// Starts in the future.
    Pending,
    /// Ended.
    Expired,
}

/// A stored silence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Silence {
    /// Generated ID.
    pub id: String,
    /// Alerts matching all of these are muted.
    pub matchers: Matchers,
    /// Start of the muting window.
    pub starts_at: DateTime<Utc>,
    /// End of the muting window.
    pub ends_at: DateTime<Utc>,
    /// Author.
    pub created_by: String,
    /// Reason.
    pub comment: String,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl Silence {
    /// State at `now`.
    #[must_use]
    pub fn state(&self, now: DateTime<Utc>) -> SilenceState {
        if now < self.starts_at {
            SilenceState::Pending
        } else if now < self.ends_at {
            SilenceState::Active
        } else {
            SilenceState::Expired
        }
    }

    /// True if the silence mutes `labels` at `now`.
    #[must_use]
    pub fn mutes(&self, labels: &Labels, now: DateTime<Utc>) -> bool {
        self.state(now) == SilenceState::Active && self.matchers.matches(labels)
    }

    /// Rule UID the silence is scoped to, if it has an equality matcher on
    /// the rule UID label.
    #[must_use]
    pub fn rule_uid(&self) -> Option<&str> {
        rule_scope(&self.matchers)
    }
}

/// Rule UID a set of silence matchers is scoped to.
#[must_use]
pub fn rule_scope(matchers: &Matchers) -> Option<&str> {
    matchers.equality_value(RULE_UID_LABEL)
}

/// A silence as posted to the API. With `id` set it updates an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostableSilence {
    /// Existing silence to update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Matchers.
    pub matchers: Matchers,
    /// Start time.
    pub starts_at: DateTime<Utc>,
    /// End time.
    pub ends_at: DateTime<Utc>,
    /// Author.
    #[serde(default)]
    pub created_by: String,
    /// Reason.
    #[serde(default)]
    pub comment: String,
}

/// Status block of a [`GettableSilence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilenceStatus {
    /// Derived state.
    pub state: SilenceState,
}

/// A silence as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GettableSilence {
    /// The silence.
    #[serde(flatten)]
    pub silence: Silence,
    /// Derived status.
    pub status: SilenceStatus,
}

/// The silences of one organisation.
#[derive(Debug)]
pub struct Silences {
    silences: Arc<RwLock<HashMap<String, Silence>>>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    snapshot: Option<JsonStore>,
    revision: Arc<AtomicU64>,
    changes: Arc<Notify>,
}

impl Clone for Silences {
    fn clone(&self) -> Self {
        Self {
            silences: Arc::clone(&self.silences),
            clock: Arc::clone(&self.clock),
            retention: self.retention,
            snapshot: self.snapshot.clone(),
            revision: Arc::clone(&self.revision),
            changes: Arc::clone(&self.changes),
        }
    }
}

impl Silences {
    /// Creates an empty in-memory set.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            silences: Arc::new(RwLock::new(HashMap::new())),
            clock,
            retention: DEFAULT_RETENTION,
            snapshot: None,
            revision: Arc::new(AtomicU64::new(0)),
            changes: Arc::new(Notify::new()),
        }
    }

    /// Persists to `<dir>/<name>.json`, loading what is already there.
    #[must_use]
    pub fn with_snapshot(mut self, dir: &Path, name: &str) -> Self {
        let store = JsonStore::new(dir, name);
        let loaded: Vec<Silence> = store.load();
        if !loaded.is_empty() {
            debug!(count = loaded.len(), path = %store.path().display(), "loaded silences");
        }
        *self.silences.write() = loaded.into_iter().map(|s| (s.id.clone(), s)).collect();
        self.snapshot = Some(store);
        self
    }

    /// Sets how long expired silences are kept.
    #[must_use]
    pub const fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Counter bumped by every create, update, expiry and expunge.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Resolves after the next change to the set.
    pub async fn changed(&self) {
        self.changes.notified().await;
    }

    fn persist(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
        self.changes.notify_one();
        if let Some(store) = &self.snapshot {
            let snapshot = || self.silences.read().values().cloned().collect::<Vec<Silence>>();
            if let Err(e) = store.save_with(snapshot) {
                warn!(path = %store.path().display(), error = %e, "failed to persist silences");
            }
        }
    }

    fn validate(silence: &PostableSilence, now: DateTime<Utc>) -> Result<()> {
        let invalid = |reason: &str| {
            Err(NotifyError::InvalidSilence {
                reason: reason.to_string(),
            })
        };
        if silence.matchers.is_empty() {
            return invalid("at least one matcher is required");
        }
        if silence.matchers.iter().all(|m| m.matches_value("")) {
            return invalid("at least one matcher must not match the empty string");
        }
        if silence.ends_at < silence.starts_at {
            return invalid("end time must not be before start time");
        }
        if silence.ends_at <= now {
            return invalid("end time can't be in the past");
        }
        Ok(())
    }

    /// Creates a silence, or updates the one named by `id`.
    ///
    /// Updating a pending or active silence changes it in place; updating an
    /// expired one creates a new silence. Returns the resulting ID.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::InvalidSilence` if the silence is malformed and
    /// `NotifyError::SilenceNotFound` if `id` is unknown.
    pub fn upsert(&self, posted: PostableSilence) -> Result<String> {
        let now = self.clock.now();
        Self::validate(&posted, now)?;

        let id = {
            let mut silences = self.silences.write();
            let existing = match &posted.id {
                Some(id) if !id.is_empty() => Some(
                    silences
                        .get(id)
                        .cloned()
                        .ok_or_else(|| NotifyError::SilenceNotFound { id: id.clone() })?,
                ),
                _ => None,
            };

            match existing {
                Some(current) if current.state(now) != SilenceState::Expired => {
                    let updated = Silence {
                        id: current.id.clone(),
                        matchers: posted.matchers,
                        starts_at: if current.state(now) == SilenceState::Active {
                            current.starts_at
                        } else {
                            posted.starts_at.max(now)
                        },
                        ends_at: posted.ends_at,
                        created_by: posted.created_by,
                        comment: posted.comment,
                        updated_at: now,
                    };
                    silences.insert(updated.id.clone(), updated);
                    info!(silence_id = %current.id, "silence updated");
                    current.id
                }
                _ => {
                    let silence = Silence {
                        id: uuid::Uuid::new_v4().to_string(),
                        matchers: posted.matchers,
                        starts_at: posted.starts_at.max(now),
                        ends_at: posted.ends_at,
                        created_by: posted.created_by,
                        comment: posted.comment,
                        updated_at: now,
                    };
                    let id = silence.id.clone();
                    info!(silence_id = %id, created_by = %silence.created_by, "silence created");
                    silences.insert(id.clone(), silence);
                    id
                }
            }
        };
        self.persist();
        Ok(id)
    }

    /// Ends a silence now. Expiring an expired silence is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::SilenceNotFound` if the ID is unknown.
    pub fn expire(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        {
            let mut silences = self.silences.write();
            let silence = silences
                .get_mut(id)
                .ok_or_else(|| NotifyError::SilenceNotFound { id: id.to_string() })?;
            match silence.state(now) {
                SilenceState::Expired => return Ok(()),
                SilenceState::Pending => {
                    silence.starts_at = now;
                    silence.ends_at = now;
                }
                SilenceState::Active => silence.ends_at = now,
            }
            silence.updated_at = now;
        }
        info!(silence_id = %id, "silence expired");
        self.persist();
        Ok(())
    }

    /// Returns one silence.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::SilenceNotFound` if the ID is unknown.
    pub fn get(&self, id: &str) -> Result<GettableSilence> {
        let now = self.clock.now();
        self.silences
            .read()
            .get(id)
            .map(|s| gettable(s, now))
            .ok_or_else(|| NotifyError::SilenceNotFound { id: id.to_string() })
    }

    /// Lists silences whose equality matchers satisfy `filter`, active
    /// first, then pending, then expired.
    #[must_use]
    pub fn list(&self, filter: &Matchers) -> Vec<GettableSilence> {
        let now = self.clock.now();
        let mut out: Vec<GettableSilence> = self
            .silences
            .read()
            .values()
            .filter(|s| {
                let labels: Labels = s
                    .matchers
                    .iter()
                    .map(|m| (m.name().to_string(), m.value().to_string()))
                    .collect();
                filter.matches(&labels)
            })
            .map(|s| gettable(s, now))
            .collect();
        out.sort_by(|a, b| {
            a.status
                .state
                .cmp(&b.status.state)
                .then_with(|| a.silence.ends_at.cmp(&b.silence.ends_at))
        });
        out
    }

    /// IDs of the active silences muting `labels` right now.
    #[must_use]
    pub fn mutes(&self, labels: &Labels) -> Vec<String> {
        let now = self.clock.now();
        let mut ids: Vec<String> = self
            .silences
            .read()
            .values()
            .filter(|s| s.mutes(labels, now))
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// True if some active silence mutes `labels`.
    #[must_use]
    pub fn is_silenced(&self, labels: &Labels) -> bool {
        self.silenced_until(labels).is_some()
    }

    /// When `labels` stop being muted: the latest end among the active
    /// silences muting them, `None` if none does.
    #[must_use]
    pub fn silenced_until(&self, labels: &Labels) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.silences
            .read()
            .values()
            .filter(|s| s.mutes(labels, now))
            .map(|s| s.ends_at)
            .max()
    }

    /// Drops silences that expired more than the retention period ago.
    pub fn expunge(&self) -> usize {
        let cutoff = self.clock.now() - chrono_duration(self.retention);
        let removed = {
            let mut silences = self.silences.write();
            let before = silences.len();
            silences.retain(|_, s| s.ends_at > cutoff);
            before - silences.len()
        };
        if removed > 0 {
            debug!(removed, "expunged old silences");
            self.persist();
        }
        removed
    }

    /// Number of stored silences, in any state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.silences.read().len()
    }

    /// True if there are no stored silences.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.silences.read().is_empty()
    }
}

fn gettable(silence: &Silence, now: DateTime<Utc>) -> GettableSilence {
    GettableSilence {
        silence: silence.clone(),
        status: SilenceStatus {
            state: silence.state(now),
        },
    }
}
