//! In-memory storage backend for testing.
//!
//! Besides holding objects, it enforces the upload-session offset rules the
//! way the remote drive does, records every call made against it, and can
//! be told to fail or stall specific calls.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::provider::{
    autorenamed, CloudStorage, CommitInfo, RemoteFile, TemporaryLink, UploadCursor, WriteMode,
};
use soundvault_common::{Error, RemotePath, Result};

/// Kind of operation, used to target injected failures and delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Start,
    Append,
    Finish,
    TemporaryLink,
    Fetch,
    Overwrite,
    ListFolder,
}

/// A call observed by [`MemoryStorage`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    Start { len: u64 },
    Append { session_id: String, offset: u64, len: u64 },
    Finish { session_id: String, offset: u64, len: u64, path: RemotePath },
    TemporaryLink { path: RemotePath },
    Fetch { url: String },
    Overwrite { path: RemotePath, len: u64 },
    ListFolder { path: RemotePath },
}

impl StorageCall {
    /// The operation this call belongs to.
    pub fn op(&self) -> StorageOp {
        match self {
            StorageCall::Start { .. } => StorageOp::Start,
            StorageCall::Append { .. } => StorageOp::Append,
            StorageCall::Finish { .. } => StorageOp::Finish,
            StorageCall::TemporaryLink { .. } => StorageOp::TemporaryLink,
            StorageCall::Fetch { .. } => StorageOp::Fetch,
            StorageCall::Overwrite { .. } => StorageOp::Overwrite,
            StorageCall::ListFolder { .. } => StorageOp::ListFolder,
        }
    }
}

/// Error to raise from an injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Transport failure.
    Network,
    /// Credentials rejected.
    AuthExpired,
    /// Non-success HTTP status on a fetch.
    Status(u16),
}

impl InjectedFailure {
    fn into_error(self, op: StorageOp) -> Error {
        match self {
            InjectedFailure::Network => {
                Error::Network(format!("injected connection reset during {:?}", op))
            }
            InjectedFailure::AuthExpired => {
                Error::AuthExpired(format!("expired_access_token during {:?}", op))
            }
            InjectedFailure::Status(status) if op == StorageOp::Fetch => {
                Error::Fetch(format!("HTTP {}", status))
            }
            InjectedFailure::Status(status) => {
                Error::Network(format!("HTTP {} during {:?}", status, op))
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredFile {
    data: Vec<u8>,
    meta: RemoteFile,
}

#[derive(Default)]
struct Inner {
    files: HashMap<String, StoredFile>,
    sessions: HashMap<String, Vec<u8>>,
    links: HashMap<String, String>,
    calls: Vec<StorageCall>,
    counts: HashMap<StorageOp, usize>,
    failures: Vec<(StorageOp, usize, InjectedFailure)>,
    delays: HashMap<StorageOp, Duration>,
}

/// In-memory cloud storage.
///
/// Cloning shares the same underlying store.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStorage {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Storage("memory storage lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Storage("memory storage lock poisoned".to_string()))
    }

    /// Make the `nth` call (1-based, counted from creation) of `op` fail.
    pub fn fail_on(&self, op: StorageOp, nth: usize, failure: InjectedFailure) {
        if let Ok(mut inner) = self.inner.write() {
            inner.failures.push((op, nth, failure));
        }
    }

    /// Delay every call of `op` by `delay` before it is served.
    pub fn delay_on(&self, op: StorageOp, delay: Duration) {
        if let Ok(mut inner) = self.inner.write() {
            inner.delays.insert(op, delay);
        }
    }

    /// All calls seen so far.
    pub fn calls(&self) -> Vec<StorageCall> {
        self.inner
            .read()
            .map(|inner| inner.calls.clone())
            .unwrap_or_default()
    }

    /// Number of calls of `op` seen so far.
    pub fn count(&self, op: StorageOp) -> usize {
        self.inner
            .read()
            .map(|inner| inner.counts.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Forget recorded calls (counters used by `fail_on` keep running).
    pub fn clear_calls(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.calls.clear();
        }
    }

    /// Upload sessions that were opened but never finished.
    pub fn open_sessions(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.sessions.len())
            .unwrap_or(0)
    }

    /// Raw stored bytes at `path`.
    pub fn object(&self, path: &RemotePath) -> Option<Vec<u8>> {
        let inner = self.inner.read().ok()?;
        inner
            .files
            .get(&path.to_string_path())
            .map(|f| f.data.clone())
    }

    /// Mutate the stored bytes at `path` in place. Returns false if absent.
    pub fn tamper(&self, path: &RemotePath, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        let Ok(mut inner) = self.inner.write() else {
            return false;
        };
        match inner.files.get_mut(&path.to_string_path()) {
            Some(file) => {
                f(&mut file.data);
                true
            }
            None => false,
        }
    }

    /// Count, record and possibly fail or delay a call.
    async fn enter(&self, call: StorageCall) -> Result<()> {
        let op = call.op();
        let (delay, failure) = {
            let mut inner = self.write()?;
            let n = {
                let count = inner.counts.entry(op).or_insert(0);
                *count += 1;
                *count
            };
            inner.calls.push(call);
            let failure = inner
                .failures
                .iter()
                .find(|(o, nth, _)| *o == op && *nth == n)
                .map(|(_, _, f)| *f);
            (inner.delays.get(&op).copied(), failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(failure) => Err(failure.into_error(op)),
            None => Ok(()),
        }
    }

    fn append_checked(inner: &mut Inner, cursor: &UploadCursor, chunk: &[u8]) -> Result<()> {
        let buffer = inner.sessions.get_mut(&cursor.session_id).ok_or_else(|| {
            Error::Protocol(format!("Unknown upload session '{}'", cursor.session_id))
        })?;
        if buffer.len() as u64 != cursor.offset {
            return Err(Error::Protocol(format!(
                "incorrect_offset: expected {}, got {}",
                buffer.len(),
                cursor.offset
            )));
        }
        buffer.extend_from_slice(chunk);
        Ok(())
    }

    fn free_path(files: &HashMap<String, StoredFile>, path: &RemotePath) -> Result<RemotePath> {
        let mut n = 1;
        loop {
            let candidate = autorenamed(path, n)?;
            if !files.contains_key(&candidate.to_string_path()) {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    fn store(inner: &mut Inner, path: RemotePath, data: Vec<u8>) -> Result<RemoteFile> {
        let key = path.to_string_path();
        let id = inner
            .files
            .get(&key)
            .map(|f| f.meta.id.clone())
            .unwrap_or_else(|| format!("id:{}", Uuid::new_v4().simple()));

        let meta = RemoteFile {
            id,
            name: path.name().unwrap_or("/").to_string(),
            path,
            size: data.len() as u64,
            rev: Some(Uuid::new_v4().simple().to_string()),
            modified: Utc::now(),
        };
        inner.files.insert(
            key,
            StoredFile {
                data,
                meta: meta.clone(),
            },
        );
        Ok(meta)
    }
}

#[async_trait]
impl CloudStorage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upload_session_start(&self, chunk: Vec<u8>) -> Result<String> {
        self.enter(StorageCall::Start {
            len: chunk.len() as u64,
        })
        .await?;

        let session_id = format!("sess-{}", Uuid::new_v4().simple());
        self.write()?.sessions.insert(session_id.clone(), chunk);
        debug!(session_id = %session_id, "Opened upload session");
        Ok(session_id)
    }

    async fn upload_session_append(&self, cursor: &UploadCursor, chunk: Vec<u8>) -> Result<()> {
        self.enter(StorageCall::Append {
            session_id: cursor.session_id.clone(),
            offset: cursor.offset,
            len: chunk.len() as u64,
        })
        .await?;

        let mut inner = self.write()?;
        Self::append_checked(&mut inner, cursor, &chunk)
    }

    async fn upload_session_finish(
        &self,
        cursor: &UploadCursor,
        commit: &CommitInfo,
        chunk: Vec<u8>,
    ) -> Result<RemoteFile> {
        self.enter(StorageCall::Finish {
            session_id: cursor.session_id.clone(),
            offset: cursor.offset,
            len: chunk.len() as u64,
            path: commit.path.clone(),
        })
        .await?;

        let mut inner = self.write()?;
        Self::append_checked(&mut inner, cursor, &chunk)?;

        let mut path = commit.path.clone();
        if inner.files.contains_key(&path.to_string_path()) {
            match (commit.mode, commit.autorename) {
                (WriteMode::Overwrite, _) => {}
                (WriteMode::Add, true) => path = Self::free_path(&inner.files, &path)?,
                (WriteMode::Add, false) => {
                    return Err(Error::AlreadyExists(format!("Path conflict: {}", path)));
                }
            }
        }

        let data = inner.sessions.remove(&cursor.session_id).unwrap_or_default();
        Self::store(&mut inner, path, data)
    }

    async fn temporary_link(&self, path: &RemotePath) -> Result<TemporaryLink> {
        self.enter(StorageCall::TemporaryLink { path: path.clone() })
            .await?;

        let mut inner = self.write()?;
        let key = path.to_string_path();
        if !inner.files.contains_key(&key) {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }
        let url = format!("memory://{}", Uuid::new_v4().simple());
        inner.links.insert(url.clone(), key);

        Ok(TemporaryLink {
            url,
            expires_at: Some(Utc::now() + ChronoDuration::hours(4)),
        })
    }

    async fn fetch(&self, link: &TemporaryLink) -> Result<Vec<u8>> {
        self.enter(StorageCall::Fetch {
            url: link.url.clone(),
        })
        .await?;

        let inner = self.read()?;
        inner
            .links
            .get(&link.url)
            .and_then(|key| inner.files.get(key))
            .map(|file| file.data.clone())
            .ok_or_else(|| Error::Fetch("HTTP 404".to_string()))
    }

    async fn overwrite(&self, path: &RemotePath, data: Vec<u8>) -> Result<RemoteFile> {
        self.enter(StorageCall::Overwrite {
            path: path.clone(),
            len: data.len() as u64,
        })
        .await?;

        let mut inner = self.write()?;
        Self::store(&mut inner, path.clone(), data)
    }

    async fn list_folder(&self, path: &RemotePath) -> Result<Vec<RemoteFile>> {
        self.enter(StorageCall::ListFolder { path: path.clone() })
            .await?;

        let inner = self.read()?;
        let mut entries: Vec<RemoteFile> = inner
            .files
            .values()
            .filter(|f| f.meta.path.parent().as_ref() == Some(path))
            .map(|f| f.meta.clone())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
