//! Test doubles and common utilities for reconciliation contract tests
//!
//! The in-memory datastore and event source from `coe_core` are real
//! implementations with failure hooks; this module adds a counting
//! checkpoint store, endpoint builders and a harness around `CoeService`.

#![allow(dead_code)]

use coe_core::traits::{Checkpoint, CheckpointStore};
use coe_core::{
    CoeConfig, CoeService, DataPath, EndpointId, EngineConfig, MemoryCheckpointStore,
    MemoryDatastore, MemoryEventSource, Result, WorkloadEndpoint,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Default bindings root
pub fn root() -> DataPath {
    DataPath::new("coe/bindings")
}

/// Datastore path of a pod binding in namespace `a`
pub fn pod_path(name: &str) -> DataPath {
    EndpointId::pod("a", name).binding_path(&root())
}

pub fn pod_id(name: &str) -> EndpointId {
    EndpointId::pod("a", name)
}

/// Running pod in namespace `a` with an IP
pub fn pod(name: &str, ip: &str) -> WorkloadEndpoint {
    WorkloadEndpoint::active(pod_id(name)).with_ip(ip.parse().expect("valid ip"))
}

/// Running pod in namespace `a` without an IP yet
pub fn pod_without_ip(name: &str) -> WorkloadEndpoint {
    WorkloadEndpoint::active(pod_id(name))
}

/// Engine settings with short delays
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        max_attempts: 3,
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 20,
        shutdown_grace_ms: 1_000,
        resubscribe_delay_ms: 10,
        ..EngineConfig::default()
    }
}

pub fn fast_config() -> CoeConfig {
    CoeConfig {
        engine: fast_engine_config(),
        ..CoeConfig::default()
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` expires
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Checkpoint store that counts calls
pub struct CountingCheckpointStore {
    inner: MemoryCheckpointStore,
    save_call_count: Arc<AtomicUsize>,
    flush_call_count: Arc<AtomicUsize>,
}

impl CountingCheckpointStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            save_call_count: Arc::new(AtomicUsize::new(0)),
            flush_call_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a store that shares state and counters with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            inner: other.inner.clone(),
            save_call_count: Arc::clone(&other.save_call_count),
            flush_call_count: Arc::clone(&other.flush_call_count),
        }
    }

    pub fn save_call_count(&self) -> usize {
        self.save_call_count.load(Ordering::SeqCst)
    }

    pub fn flush_call_count(&self) -> usize {
        self.flush_call_count.load(Ordering::SeqCst)
    }

    pub async fn seq(&self) -> Option<u64> {
        self.inner.seq().await
    }
}

#[async_trait::async_trait]
impl CheckpointStore for CountingCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        self.inner.load().await
    }

    async fn save(&self, seq: u64) -> Result<()> {
        self.save_call_count.fetch_add(1, Ordering::SeqCst);
        self.inner.save(seq).await
    }

    async fn flush(&self) -> Result<()> {
        self.flush_call_count.fetch_add(1, Ordering::SeqCst);
        self.inner.flush().await
    }
}

/// Service wired to in-memory collaborators the test keeps handles to
pub struct Harness {
    pub datastore: MemoryDatastore,
    pub source: MemoryEventSource,
    pub checkpoints: MemoryCheckpointStore,
    pub service: CoeService,
}

impl Harness {
    pub fn new(config: CoeConfig) -> Self {
        Self::with_parts(
            MemoryDatastore::new(),
            MemoryEventSource::new(),
            MemoryCheckpointStore::new(),
            config,
        )
    }

    /// Build a second service over the same collaborators (a restart)
    pub fn restart(&self, config: CoeConfig) -> Self {
        Self::with_parts(
            self.datastore.clone(),
            self.source.clone(),
            self.checkpoints.clone(),
            config,
        )
    }

    pub fn with_parts(
        datastore: MemoryDatastore,
        source: MemoryEventSource,
        checkpoints: MemoryCheckpointStore,
        config: CoeConfig,
    ) -> Self {
        let service = CoeService::new(
            Arc::new(datastore.clone()),
            Arc::new(source.clone()),
            Arc::new(checkpoints.clone()),
            config,
        );
        Self {
            datastore,
            source,
            checkpoints,
            service,
        }
    }

    /// Wait until `id` is bound, returning whether it happened in time
    pub async fn bound(&self, id: &EndpointId) -> bool {
        eventually(Duration::from_secs(2), || {
            self.service.current_binding(id).is_ok()
        })
        .await
    }

    /// Wait until `id` has no entry
    pub async fn absent(&self, id: &EndpointId) -> bool {
        eventually(Duration::from_secs(2), || {
            matches!(self.service.entry(id), Ok(None))
        })
        .await
    }
}
