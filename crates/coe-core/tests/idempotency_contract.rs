//! Architectural Contract Test: Idempotent Convergence
//!
//! This test verifies that reconciliation issues a datastore write only when
//! the datastore differs from the translated endpoint.
//!
//! Constraints verified:
//! - A redelivered create produces exactly one write
//! - A newer event with identical content produces no second write
//! - Restarting over a converged datastore issues no writes
//! - Deleting an identity that was never bound writes nothing

mod common;

use common::*;
use coe_core::{EngineEvent, MappingState, OrchestrationEvent};
use std::time::Duration;

/// Test: Replayed and repeated creates converge with a single write
///
/// Verifies that:
/// 1. The same event delivered twice is dropped as stale
/// 2. A newer create with the same endpoint finds the node already converged
/// 3. Exactly one commit touched the binding node
#[tokio::test]
async fn test_duplicate_create_writes_once() {
    let harness = Harness::new(fast_config());
    harness.service.start().await.unwrap();
    let mut events = harness.service.take_events().unwrap();

    let endpoint = pod("w1", "10.0.0.5");
    harness.source.emit(OrchestrationEvent::create(1, endpoint.clone()));
    harness.source.emit(OrchestrationEvent::create(1, endpoint.clone()));
    assert!(harness.bound(&pod_id("w1")).await);

    harness.source.create(endpoint);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        harness.datastore.writes_to(&pod_path("w1")),
        1,
        "Identical creates must converge with one write"
    );

    harness.service.stop().await;

    let mut stale = 0;
    let mut unchanged = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::StaleDropped { seq: 1, .. } => stale += 1,
            EngineEvent::Unchanged { .. } => unchanged += 1,
            _ => {}
        }
    }
    assert_eq!(stale, 1, "Redelivered seq 1 should be dropped once");
    assert!(unchanged >= 1, "Second create should find the node converged");
}

/// Test: Restart over a converged datastore is write-free
///
/// Verifies that:
/// 1. Rehydration rebuilds the bound entries from the datastore
/// 2. No create, update or delete is issued on startup
#[tokio::test]
async fn test_restart_issues_no_writes() {
    let harness = Harness::new(fast_config());
    harness.service.start().await.unwrap();

    harness.source.create(pod("w1", "10.0.0.5"));
    harness.source.create(pod("w2", "10.0.0.6"));
    assert!(harness.bound(&pod_id("w1")).await);
    assert!(harness.bound(&pod_id("w2")).await);
    harness.service.stop().await;

    let commits_before = harness.datastore.commits().len();
    assert_eq!(commits_before, 2);

    let restarted = harness.restart(fast_config());
    restarted.service.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let entry = restarted.service.entry(&pod_id("w1")).unwrap().unwrap();
    assert_eq!(entry.state, MappingState::Bound);
    assert_eq!(restarted.service.snapshot().unwrap().len(), 2);
    assert_eq!(
        restarted.datastore.commits().len(),
        commits_before,
        "Restart must not write to a converged datastore"
    );

    restarted.service.stop().await;
}

/// Test: Deleting unknown identities is a no-op
///
/// Verifies that:
/// 1. A delete for an identity never seen issues no commit
/// 2. Deleting twice issues at most one commit
#[tokio::test]
async fn test_delete_of_absent_identity_is_noop() {
    let harness = Harness::new(fast_config());
    harness.service.start().await.unwrap();

    harness.source.delete(pod("ghost", "10.0.0.9"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.datastore.commits().is_empty());

    harness.source.create(pod("w1", "10.0.0.5"));
    assert!(harness.bound(&pod_id("w1")).await);
    harness.source.delete(pod("w1", "10.0.0.5"));
    harness.source.delete(pod("w1", "10.0.0.5"));
    assert!(harness.absent(&pod_id("w1")).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        harness.datastore.writes_to(&pod_path("w1")),
        2,
        "One put and one delete, nothing for the repeated delete"
    );
    assert!(harness.datastore.get(&pod_path("w1")).is_none());

    harness.service.stop().await;
}
