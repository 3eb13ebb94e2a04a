//! Durable checkpoints for in-flight turns.
//!
//! A checkpoint is written when a turn starts, refreshed at phase
//! boundaries (always before narrative streaming), and deleted when the
//! turn completes. After a crash or abort, [`RetryService::restore`]
//! hands back the context and the last completed phase so the turn can
//! resume instead of paying for the narrative again.

use crate::capability::StoreError;
use crate::entry::StoryId;
use crate::pipeline::context::{Phase, PipelineContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// A saved in-flight turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryCheckpoint {
    /// Format version for compatibility checking.
    pub version: u32,
    pub story_id: StoryId,
    pub saved_at: DateTime<Utc>,
    /// `None` when no phase had completed yet.
    pub last_completed: Option<Phase>,
    pub context: PipelineContext,
}

/// A checkpoint read back for resumption.
#[derive(Debug, Clone)]
pub struct RestoredTurn {
    pub context: PipelineContext,
    pub last_completed: Option<Phase>,
    pub saved_at: DateTime<Utc>,
}

impl RestoredTurn {
    /// The phase a resumed turn starts with.
    pub fn next_phase(&self) -> Phase {
        Phase::resume_point(self.last_completed, &self.context.config)
    }
}

/// Raw checkpoint storage keyed by story.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn write(&self, story_id: &StoryId, data: String) -> Result<(), StoreError>;

    /// `Ok(None)` when there is no checkpoint.
    async fn read(&self, story_id: &StoryId) -> Result<Option<String>, StoreError>;

    /// Deleting a missing checkpoint is not an error.
    async fn delete(&self, story_id: &StoryId) -> Result<(), StoreError>;
}

/// In-memory checkpoints, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<StoryId, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the raw stored data, bypassing serialization.
    pub async fn put_raw(&self, story_id: &StoryId, data: impl Into<String>) {
        self.checkpoints.write().await.insert(story_id.clone(), data.into());
    }

    pub async fn contains(&self, story_id: &StoryId) -> bool {
        self.checkpoints.read().await.contains_key(story_id)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn write(&self, story_id: &StoryId, data: String) -> Result<(), StoreError> {
        self.checkpoints.write().await.insert(story_id.clone(), data);
        Ok(())
    }

    async fn read(&self, story_id: &StoryId) -> Result<Option<String>, StoreError> {
        Ok(self.checkpoints.read().await.get(story_id).cloned())
    }

    async fn delete(&self, story_id: &StoryId) -> Result<(), StoreError> {
        self.checkpoints.write().await.remove(story_id);
        Ok(())
    }
}

/// One JSON file per story under a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the checkpoint file for `story_id`.
    ///
    /// ASCII letters, digits and `-` are kept; every other byte is written
    /// as `_` plus two hex digits, so distinct ids never share a file.
    pub fn path_for(&self, story_id: &StoryId) -> PathBuf {
        let mut name = String::with_capacity(story_id.as_str().len());
        for byte in story_id.as_str().bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                name.push(byte as char);
            } else {
                name.push_str(&format!("_{byte:02x}"));
            }
        }
        self.dir.join(format!("{name}.checkpoint.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn write(&self, story_id: &StoryId, data: String) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(story_id);
        let tmp = path.with_extension("json.tmp");

        // Write-then-rename so a crash never leaves a half-written checkpoint
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read(&self, story_id: &StoryId) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(story_id)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, story_id: &StoryId) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(story_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Saves, restores and discards turn checkpoints.
#[derive(Clone)]
pub struct RetryService {
    store: Arc<dyn CheckpointStore>,
}

impl RetryService {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Persist `context` with its last completed phase.
    pub async fn save(&self, context: &PipelineContext, last_completed: Option<Phase>) -> Result<(), StoreError> {
        let checkpoint = RetryCheckpoint {
            version: CHECKPOINT_VERSION,
            story_id: context.story_id.clone(),
            saved_at: Utc::now(),
            last_completed,
            context: context.clone(),
        };
        let json = serde_json::to_string_pretty(&checkpoint)?;
        self.store.write(&context.story_id, json).await?;
        debug!(story_id = %context.story_id, last_completed = ?last_completed, "Checkpoint saved");
        Ok(())
    }

    /// Load the checkpoint for `story_id`.
    ///
    /// A checkpoint that cannot be parsed, has another format version or
    /// belongs to another story counts as absent.
    pub async fn restore(&self, story_id: &StoryId) -> Result<Option<RestoredTurn>, StoreError> {
        let Some(data) = self.store.read(story_id).await? else {
            return Ok(None);
        };

        let checkpoint: RetryCheckpoint = match serde_json::from_str(&data) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(story_id = %story_id, error = %e, "Ignoring corrupt checkpoint");
                return Ok(None);
            }
        };
        if checkpoint.version != CHECKPOINT_VERSION {
            warn!(
                story_id = %story_id,
                expected = CHECKPOINT_VERSION,
                found = checkpoint.version,
                "Ignoring checkpoint with unknown version"
            );
            return Ok(None);
        }
        if checkpoint.story_id != *story_id || checkpoint.context.story_id != *story_id {
            warn!(story_id = %story_id, found = %checkpoint.story_id, "Ignoring checkpoint for another story");
            return Ok(None);
        }

        Ok(Some(RestoredTurn {
            context: checkpoint.context,
            last_completed: checkpoint.last_completed,
            saved_at: checkpoint.saved_at,
        }))
    }

    /// Delete the checkpoint for `story_id`.
    pub async fn discard(&self, story_id: &StoryId) -> Result<(), StoreError> {
        self.store.delete(story_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineConfig;
    use tokio_util::sync::CancellationToken;

    fn context(story: &str) -> PipelineContext {
        let mut ctx = PipelineContext::new(
            story.into(),
            4,
            "I open the door",
            PipelineConfig::default(),
            CancellationToken::new(),
        );
        ctx.narrative = "The door creaks.".to_string();
        ctx
    }

    #[tokio::test]
    async fn test_save_restore_discard() {
        let retry = RetryService::new(Arc::new(MemoryCheckpointStore::new()));
        let ctx = context("s1");

        retry.save(&ctx, Some(Phase::Narrative)).await.unwrap();
        let restored = retry.restore(&ctx.story_id).await.unwrap().unwrap();
        assert_eq!(restored.last_completed, Some(Phase::Narrative));
        assert_eq!(restored.context.narrative, "The door creaks.");
        assert_eq!(restored.next_phase(), Phase::Classification);

        retry.discard(&ctx.story_id).await.unwrap();
        assert!(retry.restore(&ctx.story_id).await.unwrap().is_none());
        retry.discard(&ctx.story_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_absent() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let retry = RetryService::new(store.clone());
        let story: StoryId = "s1".into();

        store.put_raw(&story, "{not json").await;
        assert!(retry.restore(&story).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_version_mismatch_is_absent() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let retry = RetryService::new(store.clone());
        let ctx = context("s1");
        retry.save(&ctx, None).await.unwrap();

        let raw = store.read(&ctx.story_id).await.unwrap().unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        value["version"] = serde_json::json!(CHECKPOINT_VERSION + 1);
        store.put_raw(&ctx.story_id, value.to_string()).await;

        assert!(retry.restore(&ctx.story_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        let retry = RetryService::new(Arc::new(store.clone()));
        let ctx = context("story/with:odd chars");

        assert!(retry.restore(&ctx.story_id).await.unwrap().is_none());
        retry.save(&ctx, Some(Phase::Retrieval)).await.unwrap();

        let path = store.path_for(&ctx.story_id);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "story_2fwith_3aodd_20chars.checkpoint.json"
        );
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let restored = retry.restore(&ctx.story_id).await.unwrap().unwrap();
        assert_eq!(restored.last_completed, Some(Phase::Retrieval));
        assert_eq!(restored.context.user_input, "I open the door");

        retry.discard(&ctx.story_id).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_file_store_keeps_similar_ids_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let retry = RetryService::new(Arc::new(store.clone()));

        let ids = ["a/b", "a_b", "a.b", "a_2fb"];
        let paths: std::collections::HashSet<PathBuf> =
            ids.iter().map(|id| store.path_for(&(*id).into())).collect();
        assert_eq!(paths.len(), ids.len());

        let mut first = context("a/b");
        first.narrative = "Across the bridge.".to_string();
        retry.save(&first, Some(Phase::Narrative)).await.unwrap();
        retry.save(&context("a_b"), Some(Phase::Retrieval)).await.unwrap();

        let restored = retry.restore(&first.story_id).await.unwrap().unwrap();
        assert_eq!(restored.last_completed, Some(Phase::Narrative));
        assert_eq!(restored.context.narrative, "Across the bridge.");
        let other = retry.restore(&"a_b".into()).await.unwrap().unwrap();
        assert_eq!(other.last_completed, Some(Phase::Retrieval));
    }
}
