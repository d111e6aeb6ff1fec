//! Cloud storage trait definition.
//!
//! The trait mirrors the upload-session protocol of the remote drive: a blob
//! is pushed as a `start`, zero or more `append`s and a `finish` that commits
//! it to a path. Downloads go through short-lived temporary links.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use soundvault_common::{RemotePath, Result};

/// Position inside an open upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCursor {
    /// Server-assigned session id.
    pub session_id: String,
    /// Bytes the server has already accepted for this session.
    pub offset: u64,
}

impl UploadCursor {
    /// Create a cursor.
    pub fn new(session_id: impl Into<String>, offset: u64) -> Self {
        Self {
            session_id: session_id.into(),
            offset,
        }
    }
}

/// How a commit treats an existing object at the target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Never replace an existing object.
    Add,
    /// Replace whatever is at the path.
    Overwrite,
}

/// Where and how to commit a finished upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub path: RemotePath,
    pub mode: WriteMode,
    /// Pick a free name instead of failing when the path is taken.
    pub autorename: bool,
}

impl CommitInfo {
    /// Commit as a new object, renaming on collision.
    pub fn add(path: RemotePath) -> Self {
        Self {
            path,
            mode: WriteMode::Add,
            autorename: true,
        }
    }
}

/// The `n`th autorename candidate for `path`, e.g. `/song (2).mp3`.
pub(crate) fn autorenamed(path: &RemotePath, n: usize) -> Result<RemotePath> {
    let name = path.name().ok_or_else(|| {
        soundvault_common::Error::InvalidInput("Cannot commit to the root path".to_string())
    })?;
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    path.parent()
        .unwrap_or_else(RemotePath::root)
        .join(&format!("{} ({}){}", stem, n, ext))
}

/// Metadata for a committed remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Backend object id.
    pub id: String,
    /// Last path component.
    pub name: String,
    /// Final path, which may differ from the requested one after autorename.
    pub path: RemotePath,
    pub size: u64,
    /// Revision id, changes on every write.
    pub rev: Option<String>,
    pub modified: DateTime<Utc>,
}

/// A short-lived URL from which a blob can be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryLink {
    pub url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Remote blob store holding encrypted track content.
///
/// Implementations must handle their own authentication. They never see
/// plaintext or key material.
#[async_trait]
pub trait CloudStorage: Send + Sync {
    /// Get the backend name (e.g., "dropbox", "local", "memory").
    fn name(&self) -> &str;

    /// Open an upload session carrying the first chunk.
    ///
    /// # Postconditions
    /// - Returns the session id; the server offset equals `chunk.len()`
    ///
    /// # Errors
    /// - Network or authentication errors
    async fn upload_session_start(&self, chunk: Vec<u8>) -> Result<String>;

    /// Append a chunk at `cursor.offset`.
    ///
    /// # Errors
    /// - `Protocol` if the offset does not match what the server has, or the
    ///   session is unknown
    async fn upload_session_append(&self, cursor: &UploadCursor, chunk: Vec<u8>) -> Result<()>;

    /// Append the final chunk (possibly empty) and commit the session.
    ///
    /// # Postconditions
    /// - The object is visible at the returned path
    ///
    /// # Errors
    /// - `Protocol` on offset mismatch
    /// - `AlreadyExists` for `WriteMode::Add` without autorename on a taken path
    async fn upload_session_finish(
        &self,
        cursor: &UploadCursor,
        commit: &CommitInfo,
        chunk: Vec<u8>,
    ) -> Result<RemoteFile>;

    /// Get a temporary download link for a path.
    ///
    /// # Errors
    /// - `NotFound` if nothing is stored at `path`
    async fn temporary_link(&self, path: &RemotePath) -> Result<TemporaryLink>;

    /// Fetch the bytes behind a temporary link.
    ///
    /// # Errors
    /// - `Fetch` on any non-success response
    async fn fetch(&self, link: &TemporaryLink) -> Result<Vec<u8>>;

    /// Replace the object at `path` in a single request.
    async fn overwrite(&self, path: &RemotePath, data: Vec<u8>) -> Result<RemoteFile>;

    /// List files directly inside a folder.
    async fn list_folder(&self, path: &RemotePath) -> Result<Vec<RemoteFile>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_info_add_defaults() {
        let commit = CommitInfo::add(RemotePath::parse("/a.mp3").unwrap());
        assert_eq!(commit.mode, WriteMode::Add);
        assert!(commit.autorename);
    }

    #[test]
    fn test_cursor_serialization() {
        let cursor = UploadCursor::new("sess-1", 8 * 1024 * 1024);
        let json = serde_json::to_string(&cursor).unwrap();
        let back: UploadCursor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cursor);
    }

    #[test]
    fn test_write_mode_wire_names() {
        assert_eq!(serde_json::to_string(&WriteMode::Add).unwrap(), "\"add\"");
        assert_eq!(
            serde_json::to_string(&WriteMode::Overwrite).unwrap(),
            "\"overwrite\""
        );
    }
}
