//! Chunked upload over a start/append/finish session.
//!
//! The first chunk opens the session, every later chunk is appended at the
//! running offset, and an empty finish commits the object. A checkpoint is
//! emitted after every confirmed chunk so an interrupted upload can continue
//! from the last offset the server accepted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use soundvault_common::{Error, RemotePath, Result};
use soundvault_storage::{CloudStorage, CommitInfo, RemoteFile, UploadCursor};

/// Protocol phase an upload progress event was emitted after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    Start,
    Append,
    Finish,
}

/// Upload progress, emitted after each confirmed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub completed_chunks: usize,
    pub total_chunks: usize,
    pub phase: UploadPhase,
}

impl UploadProgress {
    /// Completion in percent.
    pub fn percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        self.completed_chunks as f64 * 100.0 / self.total_chunks as f64
    }
}

/// Last confirmed position of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    pub cursor: UploadCursor,
    pub dest: RemotePath,
    pub total_size: u64,
}

/// Receives checkpoints as an upload advances.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    /// Persist a checkpoint. A failure aborts the upload.
    async fn checkpoint(&self, checkpoint: &UploadCheckpoint) -> Result<()>;
}

/// Sink that discards checkpoints.
pub struct NoCheckpoint;

#[async_trait]
impl CheckpointSink for NoCheckpoint {
    async fn checkpoint(&self, _checkpoint: &UploadCheckpoint) -> Result<()> {
        Ok(())
    }
}

/// Pushes encrypted blobs through the storage upload session protocol.
pub struct ChunkedUploader {
    storage: Arc<dyn CloudStorage>,
    chunk_size: usize,
}

impl ChunkedUploader {
    /// Create an uploader.
    ///
    /// # Errors
    /// - `InvalidInput` if `chunk_size` is zero
    pub fn new(storage: Arc<dyn CloudStorage>, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidInput("Chunk size cannot be zero".to_string()));
        }
        Ok(Self {
            storage,
            chunk_size,
        })
    }

    /// Number of data chunks a blob of `len` bytes is split into.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Upload `blob` to `dest`.
    ///
    /// # Preconditions
    /// - `blob` is non-empty
    ///
    /// # Postconditions
    /// - Exactly one Start, `chunk_count - 1` Appends and one Finish are issued,
    ///   in that order
    /// - Progress is non-decreasing and ends at `total_chunks`
    ///
    /// # Errors
    /// - `InvalidInput` for an empty blob
    /// - Any storage error aborts the remaining phases; the partial session
    ///   is left to expire on the server
    pub async fn upload<F>(
        &self,
        blob: &[u8],
        dest: &RemotePath,
        sink: &dyn CheckpointSink,
        mut progress: F,
    ) -> Result<RemoteFile>
    where
        F: FnMut(UploadProgress) + Send,
    {
        if blob.is_empty() {
            return Err(Error::InvalidInput(
                "Cannot upload an empty blob".to_string(),
            ));
        }

        let total_chunks = self.chunk_count(blob.len());
        let first = blob.len().min(self.chunk_size);
        debug!(dest = %dest, size = blob.len(), total_chunks, "Starting upload session");

        let session_id = self
            .storage
            .upload_session_start(blob[..first].to_vec())
            .await?;
        let cursor = UploadCursor::new(session_id, first as u64);
        sink.checkpoint(&UploadCheckpoint {
            cursor: cursor.clone(),
            dest: dest.clone(),
            total_size: blob.len() as u64,
        })
        .await?;
        progress(UploadProgress {
            completed_chunks: 1,
            total_chunks,
            phase: UploadPhase::Start,
        });

        self.drive(blob, cursor, dest, sink, &mut progress).await
    }

    /// Continue an interrupted upload from its last checkpoint.
    ///
    /// # Errors
    /// - `Protocol` if the checkpoint does not describe `blob` or its offset
    ///   is not on a chunk boundary
    /// - `Protocol` from the backend if the session expired or moved on
    pub async fn resume<F>(
        &self,
        blob: &[u8],
        checkpoint: &UploadCheckpoint,
        sink: &dyn CheckpointSink,
        mut progress: F,
    ) -> Result<RemoteFile>
    where
        F: FnMut(UploadProgress) + Send,
    {
        let len = blob.len() as u64;
        let offset = checkpoint.cursor.offset;
        if checkpoint.total_size != len {
            return Err(Error::Protocol(format!(
                "Checkpoint is for {} bytes, blob has {}",
                checkpoint.total_size, len
            )));
        }
        if offset == 0 || offset > len || (offset % self.chunk_size as u64 != 0 && offset != len)
        {
            return Err(Error::Protocol(format!(
                "Checkpoint offset {} is not a chunk boundary of a {} byte blob",
                offset, len
            )));
        }

        info!(
            dest = %checkpoint.dest,
            session_id = %checkpoint.cursor.session_id,
            offset,
            "Resuming upload session"
        );
        self.drive(
            blob,
            checkpoint.cursor.clone(),
            &checkpoint.dest,
            sink,
            &mut progress,
        )
        .await
    }

    /// Append the remaining chunks after `cursor` and commit.
    async fn drive<F>(
        &self,
        blob: &[u8],
        mut cursor: UploadCursor,
        dest: &RemotePath,
        sink: &dyn CheckpointSink,
        progress: &mut F,
    ) -> Result<RemoteFile>
    where
        F: FnMut(UploadProgress) + Send,
    {
        let total_chunks = self.chunk_count(blob.len());
        let total_size = blob.len() as u64;

        while (cursor.offset as usize) < blob.len() {
            let start = cursor.offset as usize;
            let end = (start + self.chunk_size).min(blob.len());

            self.storage
                .upload_session_append(&cursor, blob[start..end].to_vec())
                .await
                .inspect_err(|e| {
                    warn!(session_id = %cursor.session_id, offset = cursor.offset, error = %e, "Append failed");
                })?;
            cursor.offset = end as u64;

            sink.checkpoint(&UploadCheckpoint {
                cursor: cursor.clone(),
                dest: dest.clone(),
                total_size,
            })
            .await?;
            progress(UploadProgress {
                completed_chunks: self.chunk_count(end),
                total_chunks,
                phase: UploadPhase::Append,
            });
            debug!(session_id = %cursor.session_id, offset = cursor.offset, "Chunk appended");
        }

        let remote = self
            .storage
            .upload_session_finish(&cursor, &CommitInfo::add(dest.clone()), Vec::new())
            .await?;
        progress(UploadProgress {
            completed_chunks: total_chunks,
            total_chunks,
            phase: UploadPhase::Finish,
        });

        info!(path = %remote.path, size = remote.size, "Upload committed");
        Ok(remote)
    }
}
