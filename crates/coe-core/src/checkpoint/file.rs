// # File Checkpoint Store
//
// File-based implementation of CheckpointStore with crash recovery.
//
// ## Crash Recovery
//
// - Atomic writes: write-then-rename
// - Backup: the previous file is kept as `.backup` before every rename
// - Recovery: a file that fails to parse falls back to the backup; a lower
//   watermark only means a longer replay
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "checkpoint": { "seq": 42, "updated_at": "2025-01-09T12:00:00Z" }
// }
// ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::Error;
use crate::config::CheckpointConfig;
use crate::traits::checkpoint_store::{Checkpoint, CheckpointStore, CheckpointStoreFactory};

const CHECKPOINT_FILE_VERSION: &str = "1.0";

/// File-based checkpoint store with crash recovery
///
/// # Example
///
/// ```rust,no_run
/// use coe_core::checkpoint::FileCheckpointStore;
/// use coe_core::traits::CheckpointStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileCheckpointStore::new("/var/lib/coe/checkpoint.json").await?;
///
///     store.save(42).await?;
///     assert_eq!(store.load().await?.map(|c| c.seq), Some(42));
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    state: RwLock<FileState>,
}

#[derive(Debug)]
struct FileState {
    checkpoint: Option<Checkpoint>,
    dirty: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CheckpointFileFormat {
    version: String,
    checkpoint: Option<Checkpoint>,
}

impl FileCheckpointStore {
    /// Create or load a file checkpoint store
    ///
    /// Missing parent directories are created. A corrupted file is replaced
    /// by its backup; if both are unreadable the store starts empty.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::config(format!(
                        "Failed to create checkpoint directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let checkpoint = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            state: RwLock::new(FileState {
                checkpoint,
                dirty: false,
            }),
        })
    }

    async fn load_with_recovery(path: &Path) -> Result<Option<Checkpoint>, Error> {
        match Self::load_file(path).await {
            Ok(checkpoint) => Ok(checkpoint),
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "Checkpoint file {} is corrupted: {}. Attempting recovery from backup.",
                    path.display(),
                    e
                );

                let backup_path = Self::backup_path(path);
                match Self::load_file(&backup_path).await {
                    Ok(checkpoint) => {
                        tracing::info!(
                            "Recovered checkpoint {:?} from backup",
                            checkpoint.as_ref().map(|c| c.seq)
                        );
                        if let Err(restore_err) = fs::copy(&backup_path, path).await {
                            tracing::error!(
                                "Failed to restore checkpoint file from backup: {}",
                                restore_err
                            );
                        }
                        Ok(checkpoint)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Checkpoint backup unusable: {}. Replaying the feed from the start.",
                            backup_err
                        );
                        Ok(None)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn load_file(path: &Path) -> Result<Option<Checkpoint>, Error> {
        if !path.exists() {
            tracing::debug!("Checkpoint file does not exist: {}", path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::checkpoint_store(format!(
                "Failed to read checkpoint file {}: {}",
                path.display(),
                e
            ))
        })?;

        let file: CheckpointFileFormat = serde_json::from_str(&content)?;
        if file.version != CHECKPOINT_FILE_VERSION {
            tracing::warn!(
                "Checkpoint file version mismatch: expected {}, got {}",
                CHECKPOINT_FILE_VERSION,
                file.version
            );
        }

        Ok(file.checkpoint)
    }

    async fn write_file(&self) -> Result<(), Error> {
        let mut guard = self.state.write().await;

        let json = serde_json::to_string_pretty(&CheckpointFileFormat {
            version: CHECKPOINT_FILE_VERSION.to_string(),
            checkpoint: guard.checkpoint.clone(),
        })?;

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::checkpoint_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await?;
            file.flush().await?;
        }

        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await {
                tracing::warn!("Failed to create checkpoint backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::checkpoint_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        guard.dirty = false;
        tracing::trace!("Checkpoint written to {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>, Error> {
        Ok(self.state.read().await.checkpoint.clone())
    }

    async fn save(&self, seq: u64) -> Result<(), Error> {
        {
            let mut guard = self.state.write().await;
            if guard.checkpoint.as_ref().is_some_and(|c| c.seq >= seq) {
                return Ok(());
            }
            guard.checkpoint = Some(Checkpoint::new(seq));
            guard.dirty = true;
        }

        self.write_file().await
    }

    async fn flush(&self) -> Result<(), Error> {
        if self.state.read().await.dirty {
            self.write_file().await
        } else {
            Ok(())
        }
    }
}

/// Factory for the `file` checkpoint type
pub struct FileCheckpointStoreFactory;

#[async_trait]
impl CheckpointStoreFactory for FileCheckpointStoreFactory {
    async fn create(&self, config: &CheckpointConfig) -> Result<Arc<dyn CheckpointStore>, Error> {
        match config {
            CheckpointConfig::File { path } => Ok(Arc::new(FileCheckpointStore::new(path).await?)),
            other => Err(Error::config(format!(
                "file checkpoint factory cannot build '{}'",
                other.type_name()
            ))),
        }
    }
}
