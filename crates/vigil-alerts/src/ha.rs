//! High-availability coordination between replicas.
//!
//! Every replica heartbeats into a shared [`MembershipStore`]. Live peers are
//! ordered by `(joined_at, name)`; with single-node evaluation enabled only
//! the peer at position 0 evaluates rules. If the membership store cannot be
//! reached the replica falls back to evaluating on its own (degraded mode),
//! accepting duplicates over silence.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::{Clock, chrono_duration};
use crate::error::{AlertError, Result};
use crate::metrics::AlertingMetrics;

/// Decides whether this process evaluates rules right now.
pub trait EvaluationGate: Send + Sync + std::fmt::Debug {
    /// True if rule evaluation should run.
    fn should_evaluate(&self) -> bool;
}

/// Gate for single-replica deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEvaluate;

impl EvaluationGate for AlwaysEvaluate {
    fn should_evaluate(&self) -> bool {
        true
    }
}

/// A live peer as seen in the membership store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer name.
    pub name: String,
    /// When the peer's current lease started.
    pub joined_at: DateTime<Utc>,
    /// Last heartbeat.
    pub last_seen: DateTime<Utc>,
}

/// Shared view of cluster membership.
#[async_trait]
pub trait MembershipStore: Send + Sync + std::fmt::Debug {
    /// Records a heartbeat. A peer whose lease expired rejoins with a new
    /// `joined_at`.
    async fn heartbeat(&self, peer: &str, now: DateTime<Utc>, ttl: Duration) -> Result<()>;

    /// Lists peers whose last heartbeat is within `ttl` of `now`.
    async fn members(&self, now: DateTime<Utc>, ttl: Duration) -> Result<Vec<PeerRecord>>;

    /// Removes a peer.
    async fn leave(&self, peer: &str) -> Result<()>;
}

/// In-process membership store shared between replicas of a test cluster.
#[derive(Debug, Clone)]
pub struct MemoryMembership {
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMembership {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Makes every call fail while `false`, simulating a partition.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AlertError::Membership {
                reason: "membership store unreachable".to_string(),
            })
        }
    }
}

#[async_trait]
impl MembershipStore for MemoryMembership {
    async fn heartbeat(&self, peer: &str, now: DateTime<Utc>, ttl: Duration) -> Result<()> {
        self.check()?;
        let ttl = chrono_duration(ttl);
        let mut peers = self.peers.write();
        match peers.get_mut(peer) {
            Some(record) if now.signed_duration_since(record.last_seen) <= ttl => {
                record.last_seen = now;
            }
            _ => {
                peers.insert(
                    peer.to_string(),
                    PeerRecord {
                        name: peer.to_string(),
                        joined_at: now,
                        last_seen: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn members(&self, now: DateTime<Utc>, ttl: Duration) -> Result<Vec<PeerRecord>> {
        self.check()?;
        let ttl = chrono_duration(ttl);
        Ok(self
            .peers
            .read()
            .values()
            .filter(|p| now.signed_duration_since(p.last_seen) <= ttl)
            .cloned()
            .collect())
    }

    async fn leave(&self, peer: &str) -> Result<()> {
        self.check()?;
        self.peers.write().remove(peer);
        Ok(())
    }
}

/// HA settings.
#[derive(Debug, Clone)]
pub struct HaConfig {
    /// This replica's name.
    pub peer_name: String,
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Peers silent for longer than this are considered gone.
    pub peer_timeout: Duration,
    /// Only the first peer evaluates.
    pub single_node_evaluation: bool,
}

impl HaConfig {
    /// Creates a config with default timings.
    pub fn new(peer_name: impl Into<String>) -> Self {
        Self {
            peer_name: peer_name.into(),
            heartbeat_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(15),
            single_node_evaluation: true,
        }
    }

    /// Sets the heartbeat period.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the peer timeout.
    #[must_use]
    pub const fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    /// Enables or disables single-node evaluation.
    #[must_use]
    pub const fn with_single_node_evaluation(mut self, enabled: bool) -> Self {
        self.single_node_evaluation = enabled;
        self
    }
}

/// What this replica does in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Evaluates rules.
    Evaluator,
    /// Serves the API only.
    Follower,
    /// Membership unknown; evaluates on its own.
    Degraded,
}

/// Tracks membership and announces role changes.
#[derive(Debug)]
pub struct Coordinator {
    config: HaConfig,
    store: Arc<dyn MembershipStore>,
    clock: Arc<dyn Clock>,
    metrics: AlertingMetrics,
    role_tx: watch::Sender<Role>,
    peers: RwLock<Vec<PeerRecord>>,
}

impl Coordinator {
    /// Creates a coordinator. The role stays `Follower` until the first
    /// refresh unless single-node evaluation is off.
    pub fn new(
        config: HaConfig,
        store: Arc<dyn MembershipStore>,
        clock: Arc<dyn Clock>,
        metrics: AlertingMetrics,
    ) -> Self {
        let initial = if config.single_node_evaluation {
            Role::Follower
        } else {
            Role::Evaluator
        };
        let (role_tx, _) = watch::channel(initial);
        Self {
            config,
            store,
            clock,
            metrics,
            role_tx,
            peers: RwLock::new(Vec::new()),
        }
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> Role {
        *self.role_tx.borrow()
    }

    /// Subscribes to role changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    /// Live peers ordered by position, as of the last refresh.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.read().clone()
    }

    /// This replica's position among live peers.
    #[must_use]
    pub fn position(&self) -> Option<usize> {
        self.peers
            .read()
            .iter()
            .position(|p| p.name == self.config.peer_name)
    }

    /// Heartbeats, reloads membership and recomputes the role.
    pub async fn refresh(&self) -> Role {
        let now = self.clock.now();
        let ttl = self.config.peer_timeout;
        let membership = match self.store.heartbeat(&self.config.peer_name, now, ttl).await {
            Ok(()) => self.store.members(now, ttl).await,
            Err(e) => Err(e),
        };

        let role = match membership {
            Ok(mut peers) => {
                peers.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.name.cmp(&b.name)));
                let position = peers.iter().position(|p| p.name == self.config.peer_name);
                self.metrics.set_ha_position(position, peers.len());
                *self.peers.write() = peers;
                if !self.config.single_node_evaluation || position == Some(0) {
                    Role::Evaluator
                } else {
                    Role::Follower
                }
            }
            Err(e) => {
                warn!(peer = %self.config.peer_name, error = %e, "membership unavailable, evaluating locally");
                self.peers.write().clear();
                self.metrics.set_ha_position(None, 0);
                Role::Degraded
            }
        };

        self.metrics.set_ha_evaluator(role != Role::Follower);
        let changed = self.role_tx.send_if_modified(|current| {
            if *current == role {
                false
            } else {
                *current = role;
                true
            }
        });
        if changed {
            info!(peer = %self.config.peer_name, role = ?role, "HA role changed");
        }
        role
    }

    /// Heartbeats until `shutdown` flips to `true`, then leaves the cluster.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.store.leave(&self.config.peer_name).await {
            warn!(peer = %self.config.peer_name, error = %e, "failed to leave cluster");
        } else {
            debug!(peer = %self.config.peer_name, "left cluster");
        }
    }
}

impl EvaluationGate for Coordinator {
    fn should_evaluate(&self) -> bool {
        self.role() != Role::Follower
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn coordinator(name: &str, store: &MemoryMembership, clock: &ManualClock) -> Coordinator {
        Coordinator::new(
            HaConfig::new(name),
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            AlertingMetrics::new(),
        )
    }

    mod membership_tests {
        use super::*;

        #[tokio::test]
        async fn expired_lease_rejoins_with_new_join_time() {
            let store = MemoryMembership::new();
            let t0 = Utc::now();
            let ttl = Duration::from_secs(15);
            store.heartbeat("a", t0, ttl).await.unwrap();
            store
                .heartbeat("a", t0 + chrono::Duration::seconds(5), ttl)
                .await
                .unwrap();
            assert_eq!(store.members(t0, ttl).await.unwrap()[0].joined_at, t0);

            let later = t0 + chrono::Duration::seconds(60);
            assert!(store.members(later, ttl).await.unwrap().is_empty());
            store.heartbeat("a", later, ttl).await.unwrap();
            assert_eq!(store.members(later, ttl).await.unwrap()[0].joined_at, later);
        }

        #[tokio::test]
        async fn unavailable_store_errors() {
            let store = MemoryMembership::new();
            store.set_available(false);
            assert!(store.heartbeat("a", Utc::now(), Duration::from_secs(1)).await.is_err());
        }
    }

    mod role_tests {
        use super::*;

        #[tokio::test]
        async fn first_joined_peer_evaluates() {
            let store = MemoryMembership::new();
            let clock = ManualClock::new(Utc::now());
            let a = coordinator("a", &store, &clock);
            let b = coordinator("b", &store, &clock);

            assert_eq!(a.refresh().await, Role::Evaluator);
            clock.advance(Duration::from_secs(1));
            assert_eq!(b.refresh().await, Role::Follower);
            assert_eq!(b.position(), Some(1));
            assert!(a.should_evaluate());
            assert!(!b.should_evaluate());
        }

        #[tokio::test]
        async fn follower_takes_over_after_peer_timeout() {
            let store = MemoryMembership::new();
            let clock = ManualClock::new(Utc::now());
            let a = coordinator("a", &store, &clock);
            let b = coordinator("b", &store, &clock);
            a.refresh().await;
            clock.advance(Duration::from_secs(1));
            b.refresh().await;

            let mut changes = b.subscribe();
            clock.advance(Duration::from_secs(20));
            assert_eq!(b.refresh().await, Role::Evaluator);
            assert!(changes.has_changed().unwrap());
            assert_eq!(*changes.borrow_and_update(), Role::Evaluator);

            // The old leader comes back with a fresh lease and stays behind.
            clock.advance(Duration::from_secs(1));
            assert_eq!(a.refresh().await, Role::Follower);
        }

        #[tokio::test]
        async fn partition_degrades_to_local_evaluation() {
            let store = MemoryMembership::new();
            let clock = ManualClock::new(Utc::now());
            let a = coordinator("a", &store, &clock);
            let b = coordinator("b", &store, &clock);
            a.refresh().await;
            b.refresh().await;
            assert!(!b.should_evaluate());

            store.set_available(false);
            assert_eq!(b.refresh().await, Role::Degraded);
            assert!(b.should_evaluate());
            assert!(b.peers().is_empty());
        }

        #[tokio::test]
        async fn without_single_node_evaluation_everyone_evaluates() {
            let store = MemoryMembership::new();
            let clock = ManualClock::new(Utc::now());
            let a = coordinator("a", &store, &clock);
            let b = Coordinator::new(
                HaConfig::new("b").with_single_node_evaluation(false),
                Arc::new(store.clone()),
                Arc::new(clock.clone()),
                AlertingMetrics::new(),
            );
            a.refresh().await;
            assert_eq!(b.refresh().await, Role::Evaluator);
        }
    }
}
