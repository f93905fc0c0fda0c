// # Memory Checkpoint Store
//
// In-memory implementation of CheckpointStore.
//
// ## Crash Behavior
//
// The watermark is lost on restart; the next run replays the whole
// orchestration feed. Replays are harmless (every write is idempotent) but
// slower on large clusters.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::config::CheckpointConfig;
use crate::traits::checkpoint_store::{Checkpoint, CheckpointStore, CheckpointStoreFactory};

/// In-memory checkpoint store
///
/// Clones share the same watermark, so a test can keep a handle and observe
/// what the engine saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<RwLock<Option<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing watermark
    pub fn with_seq(seq: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(Checkpoint::new(seq)))),
        }
    }

    /// Current watermark, if any
    pub async fn seq(&self) -> Option<u64> {
        self.inner.read().await.as_ref().map(|c| c.seq)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>, Error> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, seq: u64) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        if guard.as_ref().is_some_and(|c| c.seq >= seq) {
            return Ok(());
        }
        *guard = Some(Checkpoint::new(seq));
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Factory for the `memory` checkpoint type
pub struct MemoryCheckpointStoreFactory;

#[async_trait]
impl CheckpointStoreFactory for MemoryCheckpointStoreFactory {
    async fn create(&self, config: &CheckpointConfig) -> Result<Arc<dyn CheckpointStore>, Error> {
        match config {
            CheckpointConfig::Memory => Ok(Arc::new(MemoryCheckpointStore::new())),
            other => Err(Error::config(format!(
                "memory checkpoint factory cannot build '{}'",
                other.type_name()
            ))),
        }
    }
}
