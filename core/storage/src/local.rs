//! Local filesystem storage backend.
//!
//! Upload sessions are partial files under `<root>/.upload_sessions`; a
//! finished session is renamed into place. Temporary links are `file://` URLs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::provider::{
    autorenamed, CloudStorage, CommitInfo, RemoteFile, TemporaryLink, UploadCursor, WriteMode,
};
use soundvault_common::{Error, RemotePath, Result};

const SESSIONS_DIR: &str = ".upload_sessions";

/// Local filesystem storage backend.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a new local backend rooted at `root`.
    ///
    /// # Postconditions
    /// - Root and session directories exist
    /// - Root is stored as an absolute path
    ///
    /// # Errors
    /// - Permission denied or invalid path
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();

        // Create root if it doesn't exist (sync for constructor)
        std::fs::create_dir_all(root.join(SESSIONS_DIR))?;
        let root = root.canonicalize()?;

        Ok(Self { root })
    }

    fn to_fs_path(&self, path: &RemotePath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf> {
        if session_id.is_empty() || !session_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::Protocol(format!(
                "Malformed upload session id '{}'",
                session_id
            )));
        }
        Ok(self
            .root
            .join(SESSIONS_DIR)
            .join(format!("{}.part", session_id)))
    }

    fn remote_file(path: &RemotePath, fs_meta: &std::fs::Metadata) -> RemoteFile {
        let modified: DateTime<Utc> = fs_meta
            .modified()
            .map(|t| t.into())
            .unwrap_or_else(|_| Utc::now());

        RemoteFile {
            id: path.to_string_path(),
            name: path.name().unwrap_or("/").to_string(),
            path: path.clone(),
            size: fs_meta.len(),
            rev: Some(format!(
                "{}-{}",
                modified.timestamp_nanos_opt().unwrap_or_default(),
                fs_meta.len()
            )),
            modified,
        }
    }

    /// Append `chunk` to the session file after checking the offset.
    async fn append_checked(&self, cursor: &UploadCursor, chunk: &[u8]) -> Result<PathBuf> {
        let part = self.session_path(&cursor.session_id)?;
        let current = match fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Protocol(format!(
                    "Unknown upload session '{}'",
                    cursor.session_id
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if current != cursor.offset {
            return Err(Error::Protocol(format!(
                "incorrect_offset: expected {}, got {}",
                current, cursor.offset
            )));
        }

        let mut file = fs::OpenOptions::new().append(true).open(&part).await?;
        file.write_all(chunk).await?;
        file.flush().await?;
        Ok(part)
    }

    fn resolve_commit_path(&self, commit: &CommitInfo) -> Result<RemotePath> {
        if !self.to_fs_path(&commit.path).exists() {
            return Ok(commit.path.clone());
        }
        match (commit.mode, commit.autorename) {
            (WriteMode::Overwrite, _) => Ok(commit.path.clone()),
            (WriteMode::Add, false) => Err(Error::AlreadyExists(format!(
                "Path conflict: {}",
                commit.path
            ))),
            (WriteMode::Add, true) => {
                let mut n = 1;
                loop {
                    let candidate = autorenamed(&commit.path, n)?;
                    if !self.to_fs_path(&candidate).exists() {
                        return Ok(candidate);
                    }
                    n += 1;
                }
            }
        }
    }

    async fn place(&self, from: &Path, path: &RemotePath) -> Result<RemoteFile> {
        let fs_path = self.to_fs_path(path);
        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(from, &fs_path).await?;

        let fs_meta = fs::metadata(&fs_path).await?;
        Ok(Self::remote_file(path, &fs_meta))
    }
}

#[async_trait]
impl CloudStorage for LocalStorage {
    fn name(&self) -> &str {
        "local"
    }

    async fn upload_session_start(&self, chunk: Vec<u8>) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let part = self.session_path(&session_id)?;
        fs::write(&part, &chunk).await?;

        debug!(session_id = %session_id, bytes = chunk.len(), "Opened local upload session");
        Ok(session_id)
    }

    async fn upload_session_append(&self, cursor: &UploadCursor, chunk: Vec<u8>) -> Result<()> {
        self.append_checked(cursor, &chunk).await?;
        Ok(())
    }

    async fn upload_session_finish(
        &self,
        cursor: &UploadCursor,
        commit: &CommitInfo,
        chunk: Vec<u8>,
    ) -> Result<RemoteFile> {
        let part = self.append_checked(cursor, &chunk).await?;
        let path = self.resolve_commit_path(commit)?;
        self.place(&part, &path).await
    }

    async fn temporary_link(&self, path: &RemotePath) -> Result<TemporaryLink> {
        let fs_path = self.to_fs_path(path);
        if !fs_path.is_file() {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }

        let url = Url::from_file_path(&fs_path)
            .map_err(|_| Error::Storage(format!("Cannot build file URL for {}", path)))?;
        Ok(TemporaryLink {
            url: url.to_string(),
            expires_at: None,
        })
    }

    async fn fetch(&self, link: &TemporaryLink) -> Result<Vec<u8>> {
        let url = Url::parse(&link.url)
            .map_err(|e| Error::Fetch(format!("Invalid link: {}", e)))?;
        if url.scheme() != "file" {
            return Err(Error::Fetch(format!(
                "Unsupported link scheme '{}'",
                url.scheme()
            )));
        }
        let fs_path = url
            .to_file_path()
            .map_err(|_| Error::Fetch("Link does not name a local file".to_string()))?;

        match fs::read(&fs_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::Fetch("File behind link no longer exists".to_string()))
            }
            Err(e) => Err(Error::Fetch(e.to_string())),
        }
    }

    async fn overwrite(&self, path: &RemotePath, data: Vec<u8>) -> Result<RemoteFile> {
        let staging = self
            .root
            .join(SESSIONS_DIR)
            .join(format!("{}.overwrite", Uuid::new_v4()));
        fs::write(&staging, &data).await?;
        self.place(&staging, path).await
    }

    async fn list_folder(&self, path: &RemotePath) -> Result<Vec<RemoteFile>> {
        let fs_path = self.to_fs_path(path);
        if !fs_path.is_dir() {
            return Err(Error::NotFound(format!("Directory not found: {}", path)));
        }

        let mut results = Vec::new();
        let mut entries = fs::read_dir(&fs_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let fs_meta = entry.metadata().await?;
            if !fs_meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            results.push(Self::remote_file(&path.join(&name)?, &fs_meta));
        }

        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }
}
