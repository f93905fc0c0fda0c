// # Checkpoint Store Trait
//
// Defines the interface for persisting the orchestration feed watermark.
//
// ## Purpose
//
// The checkpoint is the highest sequence number below which every
// orchestration event has been fully reconciled. After a restart the
// northbound provider resubscribes after it, so no event is lost and only a
// bounded tail is replayed.
//
// ## Implementations
//
// - File-based: `coe_core::checkpoint::FileCheckpointStore`
// - In-memory: `coe_core::checkpoint::MemoryCheckpointStore`

use async_trait::async_trait;
use std::sync::Arc;

/// Persisted watermark of the orchestration feed
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Checkpoint {
    /// Every event with `seq <= self.seq` has been processed
    pub seq: u64,
    /// When the watermark last advanced
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    pub(crate) fn new(seq: u64) -> Self {
        Self {
            seq,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Check if the checkpoint is older than the given duration
    pub fn is_stale(&self, max_age: chrono::Duration) -> bool {
        chrono::Utc::now().signed_duration_since(self.updated_at) > max_age
    }
}

/// Trait for checkpoint store implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
///
/// # Guidelines
///
/// - `save` must never move the watermark backwards
/// - `flush()` must persist all pending changes
/// - No background tasks; the engine decides when to save and flush
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the last saved checkpoint
    ///
    /// # Returns
    ///
    /// - `Ok(Some(Checkpoint))`: the stored watermark
    /// - `Ok(None)`: nothing processed yet
    /// - `Err(Error)`: storage error
    async fn load(&self) -> Result<Option<Checkpoint>, crate::Error>;

    /// Advance the watermark to `seq`
    ///
    /// Lower values than the stored one are ignored.
    async fn save(&self, seq: u64) -> Result<(), crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;
}

/// Helper trait for constructing checkpoint stores from configuration
#[async_trait]
pub trait CheckpointStoreFactory: Send + Sync {
    async fn create(
        &self,
        config: &crate::config::CheckpointConfig,
    ) -> Result<Arc<dyn CheckpointStore>, crate::Error>;
}
