//! Local journal of uploads that have not been recorded yet.
//!
//! Before an encrypted blob is pushed to storage, it is written here together
//! with everything needed to record the track afterwards. Checkpoints from the
//! uploader are folded into the entry, so an interrupted upload can continue
//! from its last confirmed offset after a restart. Once the blob is committed
//! the resulting remote file is kept too, so only the track record is retried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::uploader::{CheckpointSink, UploadCheckpoint};
use soundvault_common::{Error, RemotePath, Result, UserId};
use soundvault_crypto::WrappedFileKey;
use soundvault_storage::RemoteFile;

const REGISTRY_FILE: &str = "pending_uploads.json";
const BLOB_DIR: &str = "blobs";

/// An upload that has been staged but not yet recorded as a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpload {
    pub id: String,
    pub user_id: UserId,
    /// Name the user picked the file by.
    pub file_name: String,
    pub title: String,
    pub mime_type: String,
    /// Requested remote path.
    pub dest: RemotePath,
    pub wrapped_key: WrappedFileKey,
    /// Master key generation `wrapped_key` is sealed under.
    pub key_generation: u32,
    pub total_size: u64,
    /// Last offset the server confirmed, once the session is open.
    pub checkpoint: Option<UploadCheckpoint>,
    /// Remote file the blob was committed as, once the upload finished.
    #[serde(default)]
    pub committed: Option<RemoteFile>,
    pub staged_at: DateTime<Utc>,
}

/// Persistent registry of pending uploads with their staged ciphertext.
pub struct UploadJournal {
    blob_dir: PathBuf,
    registry_path: PathBuf,
    entries: Mutex<HashMap<String, PendingUpload>>,
}

impl UploadJournal {
    /// Open (or create) a journal under `base_dir`.
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref();
        let blob_dir = base_dir.join(BLOB_DIR);
        let registry_path = base_dir.join(REGISTRY_FILE);

        fs::create_dir_all(&blob_dir).await?;

        let entries = if fs::try_exists(&registry_path).await? {
            let content = fs::read_to_string(&registry_path).await?;
            serde_json::from_str(&content).map_err(|e| {
                Error::Serialization(format!("Upload journal is unreadable: {}", e))
            })?
        } else {
            HashMap::new()
        };

        Ok(Self {
            blob_dir,
            registry_path,
            entries: Mutex::new(entries),
        })
    }

    /// Stage an encrypted blob and its metadata.
    pub async fn stage(&self, entry: PendingUpload, blob: &[u8]) -> Result<()> {
        fs::write(self.blob_path(&entry.id), blob).await?;

        let mut entries = self.entries.lock().await;
        debug!(id = %entry.id, size = blob.len(), "Upload staged");
        entries.insert(entry.id.clone(), entry);
        self.persist(&entries).await
    }

    /// Pending uploads of `user`, oldest first.
    pub async fn pending_for(&self, user: &UserId) -> Vec<PendingUpload> {
        let entries = self.entries.lock().await;
        let mut pending: Vec<PendingUpload> = entries
            .values()
            .filter(|e| &e.user_id == user)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.staged_at);
        pending
    }

    /// A single entry.
    pub async fn get(&self, id: &str) -> Option<PendingUpload> {
        self.entries.lock().await.get(id).cloned()
    }

    /// Number of pending uploads.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Read the staged ciphertext of an entry.
    pub async fn read_blob(&self, id: &str) -> Result<Vec<u8>> {
        fs::read(self.blob_path(id)).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("Staged blob for upload {} is missing", id))
            }
            _ => Error::Io(e),
        })
    }

    /// Record the latest confirmed position of an entry.
    pub async fn record_checkpoint(&self, id: &str, checkpoint: &UploadCheckpoint) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Pending upload not found: {}", id)))?;
        entry.checkpoint = Some(checkpoint.clone());
        self.persist(&entries).await
    }

    /// Record the remote file an entry's blob was committed as.
    pub async fn record_committed(&self, id: &str, remote: &RemoteFile) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Pending upload not found: {}", id)))?;
        entry.checkpoint = None;
        entry.committed = Some(remote.clone());
        self.persist(&entries).await
    }

    /// Forget the upload session of an entry so the next attempt starts over.
    pub async fn reset_checkpoint(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.checkpoint = None;
        }
        self.persist(&entries).await
    }

    /// Remove an entry and its staged blob.
    pub async fn complete(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(id).is_none() {
            return Err(Error::NotFound(format!("Pending upload not found: {}", id)));
        }

        let blob = self.blob_path(id);
        if fs::try_exists(&blob).await? {
            fs::remove_file(&blob).await?;
        }
        self.persist(&entries).await
    }

    /// Checkpoint sink bound to one entry.
    pub fn sink<'a>(&'a self, id: &'a str) -> JournalSink<'a> {
        JournalSink { journal: self, id }
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.blob_dir.join(format!("{}.blob", id))
    }

    async fn persist(&self, entries: &HashMap<String, PendingUpload>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let tmp = self.registry_path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.registry_path).await?;
        Ok(())
    }
}

/// Writes uploader checkpoints into a journal entry.
pub struct JournalSink<'a> {
    journal: &'a UploadJournal,
    id: &'a str,
}

#[async_trait]
impl CheckpointSink for JournalSink<'_> {
    async fn checkpoint(&self, checkpoint: &UploadCheckpoint) -> Result<()> {
        self.journal.record_checkpoint(self.id, checkpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use soundvault_storage::UploadCursor;
    use tempfile::TempDir;

    fn entry(id: &str, user: &str) -> PendingUpload {
        PendingUpload {
            id: id.to_string(),
            user_id: UserId::new(user).unwrap(),
            file_name: "song.mp3".to_string(),
            title: "song".to_string(),
            mime_type: "audio/mpeg".to_string(),
            dest: RemotePath::parse(&format!("/{}-song.mp3", id)).unwrap(),
            wrapped_key: WrappedFileKey::new("wrapped"),
            key_generation: 0,
            total_size: 3,
            checkpoint: None,
            committed: None,
            staged_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_stage_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let journal = UploadJournal::open(dir.path()).await.unwrap();
            journal.stage(entry("a", "u1"), &[1, 2, 3]).await.unwrap();
            let checkpoint = UploadCheckpoint {
                cursor: UploadCursor::new("sess", 2),
                dest: RemotePath::parse("/a-song.mp3").unwrap(),
                total_size: 3,
            };
            journal
                .sink("a")
                .checkpoint(&checkpoint)
                .await
                .unwrap();
        }

        let journal = UploadJournal::open(dir.path()).await.unwrap();
        let pending = journal.pending_for(&UserId::new("u1").unwrap()).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].checkpoint.as_ref().unwrap().cursor.offset, 2);
        assert_eq!(journal.read_blob("a").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_complete_removes_blob() {
        let dir = TempDir::new().unwrap();
        let journal = UploadJournal::open(dir.path()).await.unwrap();
        journal.stage(entry("a", "u1"), &[9]).await.unwrap();

        journal.complete("a").await.unwrap();
        assert!(journal.is_empty().await);
        assert!(matches!(
            journal.read_blob("a").await,
            Err(Error::NotFound(_))
        ));
        assert!(journal.complete("a").await.is_err());
    }

    #[tokio::test]
    async fn test_pending_is_per_user() {
        let dir = TempDir::new().unwrap();
        let journal = UploadJournal::open(dir.path()).await.unwrap();
        journal.stage(entry("a", "u1"), &[1]).await.unwrap();
        journal.stage(entry("b", "u2"), &[2]).await.unwrap();

        assert_eq!(journal.len().await, 2);
        let pending = journal.pending_for(&UserId::new("u2").unwrap()).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
    }

    #[tokio::test]
    async fn test_committed_file_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let remote = RemoteFile {
            id: "id:a".to_string(),
            name: "a-song.mp3".to_string(),
            path: RemotePath::parse("/a-song.mp3").unwrap(),
            size: 3,
            rev: Some("1".to_string()),
            modified: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        };
        {
            let journal = UploadJournal::open(dir.path()).await.unwrap();
            journal.stage(entry("a", "u1"), &[1, 2, 3]).await.unwrap();
            journal.record_committed("a", &remote).await.unwrap();
        }

        let journal = UploadJournal::open(dir.path()).await.unwrap();
        let stored = journal.get("a").await.unwrap();
        assert_eq!(stored.committed, Some(remote));
        assert!(stored.checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_unknown_entry() {
        let dir = TempDir::new().unwrap();
        let journal = UploadJournal::open(dir.path()).await.unwrap();
        let checkpoint = UploadCheckpoint {
            cursor: UploadCursor::new("sess", 1),
            dest: RemotePath::root(),
            total_size: 1,
        };
        assert!(matches!(
            journal.record_checkpoint("missing", &checkpoint).await,
            Err(Error::NotFound(_))
        ));
    }
}
