//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|------------------|
// | FileCheckpointStore     | Checkpoint persisted as a JSON file               | load, save        |
// | MemoryCheckpointStore   | Checkpoint kept in memory (tests, demo mode)      | load, save        |
//--------------------------------------------------------------------------------------------------

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{ChangeSourceError, CheckpointStore, SourceResult};
use crate::domain::models::types::Checkpoint;

/// Stores the checkpoint as a single JSON document on disk.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// target, so a crash mid-write leaves the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> SourceResult<Option<Checkpoint>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No checkpoint at {:?}, starting from the live end of the feed", self.path);
                return Ok(None);
            }
            Err(e) => {
                return Err(ChangeSourceError::Checkpoint(format!(
                    "failed to read {:?}: {}",
                    self.path, e
                )));
            }
        };

        let checkpoint: Checkpoint = serde_json::from_str(&contents).map_err(|e| {
            ChangeSourceError::Checkpoint(format!("corrupt checkpoint {:?}: {}", self.path, e))
        })?;

        info!(
            "Loaded checkpoint from {:?}: last event id {}",
            self.path, checkpoint.last_event_id
        );
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> SourceResult<()> {
        let json = serde_json::to_vec(checkpoint)
            .map_err(|e| ChangeSourceError::Checkpoint(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ChangeSourceError::Checkpoint(e.to_string()))?;
            }
        }

        let temp_path = self.temp_path();
        let write = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &self.path).await
        };
        write.await.map_err(|e| {
            ChangeSourceError::Checkpoint(format!("failed to write {:?}: {}", self.path, e))
        })?;

        debug!("Saved checkpoint at event {}", checkpoint.last_event_id);
        Ok(())
    }
}

/// Keeps the checkpoint in memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoint: Mutex<Option<Checkpoint>>,
    saves: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `checkpoint`.
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint: Mutex::new(Some(checkpoint)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Returns the last saved checkpoint.
    pub fn current(&self) -> Option<Checkpoint> {
        self.checkpoint.lock().clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> SourceResult<Option<Checkpoint>> {
        Ok(self.current())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> SourceResult<()> {
        *self.checkpoint.lock() = Some(checkpoint.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
