//! Track upload with client-side encryption.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::config::VaultConfig;
use crate::journal::{PendingUpload, UploadJournal};
use crate::session::{KeyLease, VaultSession};
use crate::store::TrackStore;
use crate::track::{is_audio_file, mime_type_for, title_from_filename, NewTrack, Track};
use crate::uploader::{ChunkedUploader, UploadProgress};
use soundvault_common::{Error, Result};
use soundvault_crypto::{encrypt_content_in_place, wrap_file_key, FileKey};
use soundvault_storage::{CloudStorage, RemoteFile};

/// Encrypting upload front end.
///
/// Every upload is staged in the journal before the first byte leaves the
/// machine and recorded in the track store only after storage confirms the
/// commit.
pub struct VaultOperations {
    session: Arc<VaultSession>,
    storage: Arc<dyn CloudStorage>,
    tracks: Arc<dyn TrackStore>,
    journal: Arc<UploadJournal>,
    config: VaultConfig,
}

impl VaultOperations {
    /// Create new operations handler.
    ///
    /// # Errors
    /// - Configuration fails validation
    pub fn new(
        session: Arc<VaultSession>,
        storage: Arc<dyn CloudStorage>,
        tracks: Arc<dyn TrackStore>,
        journal: Arc<UploadJournal>,
        config: VaultConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            session,
            storage,
            tracks,
            journal,
            config,
        })
    }

    /// Encrypt and upload an audio file, then record it as a track.
    ///
    /// # Preconditions
    /// - Session must be active
    /// - `file_name` has an accepted audio extension
    /// - `content` is non-empty
    ///
    /// # Postconditions
    /// - The ciphertext is stored at `<upload folder>/<uuid>-<file name>`
    ///   (or an autorenamed sibling)
    /// - A track is recorded with the wrapped key and the final path
    /// - The plaintext buffer is wiped
    ///
    /// # Errors
    /// - `InvalidInput` for a rejected file
    /// - `Locked` if the session ends before the track is recorded
    /// - Storage errors; the staged upload then stays in the journal
    pub async fn upload_track<F>(
        &self,
        file_name: &str,
        mut content: Vec<u8>,
        artist: Option<String>,
        progress: F,
    ) -> Result<Track>
    where
        F: FnMut(UploadProgress) + Send,
    {
        if !is_audio_file(file_name, &self.config.audio_extensions) {
            content.zeroize();
            return Err(Error::InvalidInput(format!(
                "'{}' is not a supported audio file",
                file_name
            )));
        }
        if content.is_empty() {
            return Err(Error::InvalidInput(format!("'{}' is empty", file_name)));
        }

        let lease = self.session.lease()?;

        let file_key = FileKey::generate();
        let blob = encrypt_content_in_place(content, &file_key)?;
        let wrapped_key = wrap_file_key(&file_key, lease.key())?;
        drop(file_key);

        let id = Uuid::new_v4().to_string();
        let dest = self
            .config
            .upload_folder
            .join(&format!("{}-{}", id, file_name))?;

        let entry = PendingUpload {
            id,
            user_id: lease.user_id().clone(),
            file_name: file_name.to_string(),
            title: title_from_filename(file_name),
            mime_type: mime_type_for(file_name).to_string(),
            dest,
            wrapped_key,
            key_generation: lease.generation(),
            total_size: blob.len() as u64,
            checkpoint: None,
            committed: None,
            staged_at: chrono::Utc::now(),
        };
        self.journal.stage(entry.clone(), &blob).await?;
        debug!(id = %entry.id, dest = %entry.dest, size = blob.len(), "Upload staged");

        self.push(&entry, &blob, &lease, artist, progress).await
    }

    /// Finish uploads left in the journal by an earlier run.
    ///
    /// Entries sealed under an older master key generation can no longer be
    /// unwrapped and are discarded.
    ///
    /// # Errors
    /// - `Locked` if nobody is signed in
    /// - The first upload error; later entries stay pending
    pub async fn resume_pending(&self) -> Result<Vec<Track>> {
        let lease = self.session.lease()?;
        let pending = self.journal.pending_for(lease.user_id()).await;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = pending.len(), "Resuming pending uploads");

        let mut recorded = Vec::with_capacity(pending.len());
        for entry in pending {
            if entry.key_generation != lease.generation() {
                warn!(
                    id = %entry.id,
                    file = %entry.file_name,
                    generation = entry.key_generation,
                    "Discarding pending upload sealed under a retired key"
                );
                self.journal.complete(&entry.id).await?;
                continue;
            }

            let blob = self.journal.read_blob(&entry.id).await?;
            let track = self.push(&entry, &blob, &lease, None, |_| {}).await?;
            recorded.push(track);
        }
        Ok(recorded)
    }

    /// Pending uploads of the signed-in user.
    pub async fn pending(&self) -> Result<Vec<PendingUpload>> {
        let lease = self.session.lease()?;
        Ok(self.journal.pending_for(lease.user_id()).await)
    }

    /// Upload a staged blob unless it is already committed, then record the track.
    async fn push<F>(
        &self,
        entry: &PendingUpload,
        blob: &[u8],
        lease: &KeyLease,
        artist: Option<String>,
        mut progress: F,
    ) -> Result<Track>
    where
        F: FnMut(UploadProgress) + Send,
    {
        let remote = match &entry.committed {
            Some(remote) => {
                debug!(id = %entry.id, path = %remote.path, "Blob already committed; recording track");
                remote.clone()
            }
            None => {
                let remote = self.transfer(entry, blob, &mut progress).await?;
                self.journal.record_committed(&entry.id, &remote).await?;
                remote
            }
        };

        lease.ensure_current()?;

        let track = self
            .tracks
            .insert_track(NewTrack {
                user_id: entry.user_id.clone(),
                title: entry.title.clone(),
                artist,
                duration_secs: None,
                cloud_path: remote.path,
                wrapped_key: entry.wrapped_key.clone(),
                key_generation: entry.key_generation,
                mime_type: entry.mime_type.clone(),
            })
            .await?;
        self.journal.complete(&entry.id).await?;

        info!(track_id = %track.id, path = %track.cloud_path, "Track uploaded");
        Ok(track)
    }

    /// Move the staged blob to storage, resuming its session if one is open.
    async fn transfer<F>(
        &self,
        entry: &PendingUpload,
        blob: &[u8],
        progress: &mut F,
    ) -> Result<RemoteFile>
    where
        F: FnMut(UploadProgress) + Send,
    {
        let uploader = ChunkedUploader::new(self.storage.clone(), self.config.chunk_size)?;
        let sink = self.journal.sink(&entry.id);

        match &entry.checkpoint {
            Some(checkpoint) => match uploader.resume(blob, checkpoint, &sink, &mut *progress).await {
                Err(Error::Protocol(reason)) => {
                    warn!(id = %entry.id, reason = %reason, "Upload session unusable; starting over");
                    self.journal.reset_checkpoint(&entry.id).await?;
                    uploader.upload(blob, &entry.dest, &sink, &mut *progress).await
                }
                other => other,
            },
            None => uploader.upload(blob, &entry.dest, &sink, &mut *progress).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTracks;
    use crate::session::derive_master_key;
    use soundvault_common::UserId;
    use soundvault_crypto::{decrypt_content, unwrap_file_key, KdfParams};
    use soundvault_storage::{InjectedFailure, MemoryStorage, StorageOp};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        session: Arc<VaultSession>,
        storage: MemoryStorage,
        tracks: Arc<MemoryTracks>,
        journal: Arc<UploadJournal>,
        ops: VaultOperations,
    }

    async fn harness(chunk_size: usize) -> Harness {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(VaultSession::new());
        let (key, _) = derive_master_key("correct-horse-1", None, KdfParams::default())
            .await
            .unwrap();
        session.install(UserId::new("listener").unwrap(), key, 0);

        let storage = MemoryStorage::new();
        let tracks = Arc::new(MemoryTracks::new());
        let journal = Arc::new(UploadJournal::open(dir.path()).await.unwrap());
        let config = VaultConfig {
            chunk_size,
            ..Default::default()
        };
        let ops = VaultOperations::new(
            session.clone(),
            Arc::new(storage.clone()),
            tracks.clone(),
            journal.clone(),
            config,
        )
        .unwrap();

        Harness {
            _dir: dir,
            session,
            storage,
            tracks,
            journal,
            ops,
        }
    }

    #[tokio::test]
    async fn test_upload_records_track() {
        let h = harness(16).await;
        let audio: Vec<u8> = (0..100u8).collect();

        let track = h
            .ops
            .upload_track("Intro.mp3", audio.clone(), Some("Band".to_string()), |_| {})
            .await
            .unwrap();

        assert_eq!(track.title, "Intro");
        assert_eq!(track.mime_type, "audio/mpeg");
        assert_eq!(track.artist.as_deref(), Some("Band"));
        assert_eq!(track.key_generation, 0);
        assert!(track.cloud_path.name().unwrap().ends_with("-Intro.mp3"));
        assert!(h.journal.is_empty().await);

        // Stored bytes are ciphertext that decrypts back to the input
        let stored = h.storage.object(&track.cloud_path).unwrap();
        assert_ne!(&stored[12..112], &audio[..]);
        let lease = h.session.lease().unwrap();
        let file_key = unwrap_file_key(&track.wrapped_key, lease.key()).unwrap();
        assert_eq!(decrypt_content(stored, &file_key).unwrap().as_bytes(), &audio[..]);
    }

    #[tokio::test]
    async fn test_rejects_non_audio_and_empty() {
        let h = harness(16).await;
        let err = h
            .ops
            .upload_track("cover.jpg", vec![1, 2, 3], None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = h
            .ops
            .upload_track("silence.wav", Vec::new(), None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(h.storage.calls().is_empty());
    }

    #[tokio::test]
    async fn test_upload_requires_session() {
        let h = harness(16).await;
        h.session.sign_out();
        let err = h
            .ops
            .upload_track("a.mp3", vec![1], None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Locked(_)));
    }

    #[tokio::test]
    async fn test_failed_upload_stays_pending_and_resumes() {
        let h = harness(16).await;
        h.storage.fail_on(StorageOp::Append, 2, InjectedFailure::Network);

        let err = h
            .ops
            .upload_track("long.flac", vec![5u8; 100], None, |_| {})
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(h.tracks.is_empty().await);

        let pending = h.ops.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        let offset = pending[0].checkpoint.as_ref().unwrap().cursor.offset;
        assert_eq!(offset, 32);

        let starts = h.storage.count(StorageOp::Start);
        let recorded = h.ops.resume_pending().await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].mime_type, "audio/flac");
        assert_eq!(h.storage.count(StorageOp::Start), starts);
        assert_eq!(h.tracks.len().await, 1);
        assert!(h.journal.is_empty().await);
    }

    #[tokio::test]
    async fn test_resume_after_failed_record_skips_upload() {
        let h = harness(16).await;
        h.tracks.fail_inserts(true).await;

        let err = h
            .ops
            .upload_track("outro.mp3", vec![3u8; 40], None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(h.storage.count(StorageOp::Finish), 1);

        let pending = h.ops.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        let committed = pending[0].committed.clone().unwrap();
        assert_eq!(committed.path, pending[0].dest);

        h.tracks.fail_inserts(false).await;
        let recorded = h.ops.resume_pending().await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].cloud_path, committed.path);
        assert_eq!(h.storage.count(StorageOp::Start), 1);
        assert_eq!(h.storage.count(StorageOp::Finish), 1);
        assert!(h.journal.is_empty().await);
    }

    #[tokio::test]
    async fn test_resume_discards_retired_generation() {
        let h = harness(16).await;
        h.storage.fail_on(StorageOp::Start, 1, InjectedFailure::Network);
        assert!(h
            .ops
            .upload_track("a.ogg", vec![1u8; 10], None, |_| {})
            .await
            .is_err());

        let (key, _) = derive_master_key("battery-staple-2", None, KdfParams::default())
            .await
            .unwrap();
        h.session.install(UserId::new("listener").unwrap(), key, 1);

        let recorded = h.ops.resume_pending().await.unwrap();
        assert!(recorded.is_empty());
        assert!(h.journal.is_empty().await);
        assert!(h.tracks.is_empty().await);
    }
}
