//! End-to-end tests for HA evaluation.
//!
//! These tests verify:
//! 1. Exactly one of three replicas evaluates
//! 2. When the evaluator stops heartbeating, another replica takes over
//!    once its lease expires
//! 3. The new evaluator continues the existing alert instead of starting
//!    a new one

mod helpers;

use helpers::{Cluster, always_firing, group, send};
use vigil_alerts::{InstanceState, Role, RuleStore, StateStore};

#[tokio::test]
async fn test_single_evaluator_among_three_replicas() {
    let cluster = Cluster::start(3);
    cluster
        .rules
        .replace_group(group("folder", "g", vec![always_firing("r1", "Always")]))
        .await
        .unwrap();

    cluster.rounds(2).await;

    assert_eq!(cluster.evaluators(), vec![0]);
    assert!(cluster.replicas[0].scheduler().is_evaluating());
    assert!(!cluster.replicas[1].scheduler().is_evaluating());
    assert!(!cluster.replicas[2].scheduler().is_evaluating());
    assert_eq!(cluster.replicas[2].coordinator().position(), Some(2));
    assert_eq!(cluster.states.list(1).await.unwrap().len(), 1);

    let (_, health) = send(&cluster.router(1), "GET", "/api/health", None, None).await;
    assert_eq!(health["role"], "follower");
    assert_eq!(health["peers"], 3);
    assert_eq!(health["position"], 1);
}

#[tokio::test]
async fn test_failover_preserves_alert_start() {
    let cluster = Cluster::start(3);
    cluster
        .rules
        .replace_group(group("folder", "g", vec![always_firing("r1", "Always")]))
        .await
        .unwrap();

    cluster.rounds(1).await;
    let before = cluster.states.list(1).await.unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].state, InstanceState::Alerting);
    let started = before[0].starts_at;

    // Replica 0 stops: its lease is still fresh after one interval.
    cluster.round(&[1, 2]).await;
    assert_eq!(cluster.replicas[1].coordinator().role(), Role::Follower);

    // Two intervals exceed the peer timeout.
    cluster.round(&[1, 2]).await;
    assert_eq!(cluster.replicas[1].coordinator().role(), Role::Evaluator);
    assert_eq!(cluster.replicas[2].coordinator().role(), Role::Follower);

    cluster.round(&[1, 2]).await;
    let after = cluster.states.list(1).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].state, InstanceState::Alerting);
    assert_eq!(after[0].starts_at, started);
    assert!(after[0].last_evaluation_at > before[0].last_evaluation_at);
}

#[tokio::test]
async fn test_replicas_follow_until_first_heartbeat() {
    let cluster = Cluster::start(2);
    for replica in &cluster.replicas {
        assert_eq!(replica.coordinator().role(), Role::Follower);
    }
    cluster.rounds(1).await;
    assert_eq!(cluster.evaluators(), vec![0]);
}
