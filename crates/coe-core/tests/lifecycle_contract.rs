//! Architectural Contract Test: Service Lifecycle
//!
//! This test verifies the start/stop contract of `CoeService`.
//!
//! Constraints verified:
//! - `start()` on a running service fails with `AlreadyStarted`
//! - Invalid configuration fails `start()` with `FatalConfig`
//! - `stop()` is idempotent and completes in bounded time
//! - Queries fail before the first start and keep answering after stop
//! - A restart resumes the feed after the saved checkpoint
//! - Tasks that cannot finish within the grace period are discarded and
//!   keep the checkpoint from advancing past them

mod common;

use common::*;
use coe_core::{EngineConfig, EngineEvent, Error, InjectedFailure, MappingState};
use std::time::Duration;

#[tokio::test]
async fn test_double_start_is_rejected() {
    let harness = Harness::new(fast_config());
    harness.service.start().await.unwrap();

    assert!(matches!(
        harness.service.start().await,
        Err(Error::AlreadyStarted)
    ));
    assert!(harness.service.is_running().await);

    harness.service.stop().await;
}

#[tokio::test]
async fn test_invalid_config_is_fatal() {
    let mut config = fast_config();
    config.engine.max_attempts = 0;
    let harness = Harness::new(config);

    assert!(matches!(
        harness.service.start().await,
        Err(Error::FatalConfig(_))
    ));
    assert!(!harness.service.is_running().await);
}

/// Test: Stop is idempotent and bounded
///
/// Verifies that:
/// 1. Stopping an idle service completes within a timeout
/// 2. A second stop returns an empty report
/// 3. The engine reports that it stopped
#[tokio::test]
async fn test_stop_twice() {
    let harness = Harness::new(fast_config());
    harness.service.start().await.unwrap();
    let mut events = harness.service.take_events().unwrap();

    let report = tokio::time::timeout(Duration::from_secs(2), harness.service.stop())
        .await
        .expect("stop() should complete");
    assert_eq!(report.processed, 0);
    assert_eq!(report.discarded, 0);

    let second = tokio::time::timeout(Duration::from_millis(100), harness.service.stop())
        .await
        .expect("second stop() should return immediately");
    assert_eq!(second, Default::default());
    assert!(!harness.service.is_running().await);

    let mut stopped = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::Stopped { .. }) {
            stopped = true;
        }
    }
    assert!(stopped);
}

#[tokio::test]
async fn test_queries_before_start_and_after_stop() {
    let harness = Harness::new(fast_config());
    assert!(matches!(
        harness.service.current_binding(&pod_id("w1")),
        Err(Error::NotFound(_))
    ));

    harness.service.start().await.unwrap();
    harness.source.create(pod("w1", "10.0.0.5"));
    assert!(harness.bound(&pod_id("w1")).await);
    harness.service.stop().await;

    let binding = harness.service.current_binding(&pod_id("w1")).unwrap();
    assert_eq!(binding.endpoint, pod_id("w1"));
    assert!(matches!(
        harness.service.current_binding(&pod_id("nope")),
        Err(Error::NotFound(_))
    ));
}

/// Test: Restart resumes after the checkpoint
///
/// Verifies that:
/// 1. The checkpoint covers every processed event at stop
/// 2. Events published while stopped are applied after restart
/// 3. The same service instance can be started again
#[tokio::test]
async fn test_restart_resumes_after_checkpoint() {
    let harness = Harness::new(fast_config());
    harness.service.start().await.unwrap();

    harness.source.create(pod("w1", "10.0.0.5"));
    assert!(harness.bound(&pod_id("w1")).await);
    harness.service.stop().await;
    assert_eq!(harness.checkpoints.seq().await, Some(1));

    harness.source.create(pod("w2", "10.0.0.6"));
    harness.source.delete(pod("w1", "10.0.0.5"));

    harness.service.start().await.unwrap();
    assert!(harness.bound(&pod_id("w2")).await);
    assert!(harness.absent(&pod_id("w1")).await);
    assert!(harness.datastore.get(&pod_path("w1")).is_none());

    harness.service.stop().await;
    assert_eq!(harness.checkpoints.seq().await, Some(3));
    assert_eq!(harness.source.subscription_count(), 2);
}

/// Test: Drain discards work that cannot finish in the grace period
///
/// Verifies that:
/// 1. A task stuck in backoff is abandoned once the grace period ends
/// 2. The report counts it and the queued task behind it as discarded
/// 3. The checkpoint does not cover the discarded events
#[tokio::test]
async fn test_drain_discards_unfinished_tasks() {
    let mut config = fast_config();
    config.engine = EngineConfig {
        max_attempts: 10,
        retry_base_delay_ms: 200,
        retry_max_delay_ms: 1_000,
        shutdown_grace_ms: 50,
        ..config.engine
    };
    let harness = Harness::new(config);
    harness.service.start().await.unwrap();

    harness.datastore.fail_next_commits(InjectedFailure::Unavailable, 100);
    harness.source.create(pod("w1", "10.0.0.5"));
    harness.source.create(pod("w2", "10.0.0.6"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = tokio::time::timeout(Duration::from_secs(2), harness.service.stop())
        .await
        .expect("stop() should honour the grace period");

    assert_eq!(report.processed, 0);
    assert_eq!(report.discarded, 2);
    assert!(
        harness.checkpoints.seq().await.unwrap_or(0) < 1,
        "Checkpoint must not cover discarded events"
    );

    let entry = harness.service.entry(&pod_id("w1")).unwrap();
    assert!(entry.is_none_or(|e| !matches!(e.state, MappingState::Bound)));
}
