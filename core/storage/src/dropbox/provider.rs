//! Dropbox storage backend implementation.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use soundvault_common::{Error, RemotePath, Result};

use super::auth::{AuthConfig, TokenManager, Tokens};
use super::client::{DropboxClient, DropboxFile};
use crate::provider::{CloudStorage, CommitInfo, RemoteFile, TemporaryLink, UploadCursor};

/// Temporary links stay valid for four hours.
const LINK_LIFETIME_HOURS: i64 = 4;

/// Dropbox backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropboxConfig {
    /// App credentials used for token refresh.
    pub auth: AuthConfig,
    /// Current OAuth2 tokens.
    pub tokens: Tokens,
}

/// Dropbox storage backend.
pub struct DropboxStorage {
    client: DropboxClient,
    token_manager: Arc<TokenManager>,
}

impl DropboxStorage {
    /// Create a new Dropbox backend.
    ///
    /// # Errors
    /// - HTTP client construction failed
    pub fn new(config: DropboxConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent("SoundVault/0.1")
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        let token_manager = Arc::new(TokenManager::new(http.clone(), config.auth, config.tokens));
        let client = DropboxClient::new(http, token_manager.clone());

        Ok(Self {
            client,
            token_manager,
        })
    }

    /// Get current tokens (useful for persistence after a refresh).
    pub async fn get_tokens(&self) -> Tokens {
        self.token_manager.get_tokens().await
    }

    fn to_remote_file(file: DropboxFile, fallback: &RemotePath) -> Result<RemoteFile> {
        let path = match file.path_display.as_deref() {
            Some(display) => RemotePath::parse(display)?,
            None => fallback.clone(),
        };
        Ok(RemoteFile {
            id: file.id.unwrap_or_else(|| path.to_string_path()),
            name: file.name,
            path,
            size: file.size.unwrap_or(0),
            rev: file.rev,
            modified: file.server_modified.unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl CloudStorage for DropboxStorage {
    fn name(&self) -> &str {
        "dropbox"
    }

    async fn upload_session_start(&self, chunk: Vec<u8>) -> Result<String> {
        self.client.upload_session_start(chunk).await
    }

    async fn upload_session_append(&self, cursor: &UploadCursor, chunk: Vec<u8>) -> Result<()> {
        self.client.upload_session_append(cursor, chunk).await
    }

    async fn upload_session_finish(
        &self,
        cursor: &UploadCursor,
        commit: &CommitInfo,
        chunk: Vec<u8>,
    ) -> Result<RemoteFile> {
        let file = self
            .client
            .upload_session_finish(cursor, commit, chunk)
            .await?;
        Self::to_remote_file(file, &commit.path)
    }

    async fn temporary_link(&self, path: &RemotePath) -> Result<TemporaryLink> {
        let url = self.client.get_temporary_link(path).await?;
        Ok(TemporaryLink {
            url,
            expires_at: Some(Utc::now() + Duration::hours(LINK_LIFETIME_HOURS)),
        })
    }

    async fn fetch(&self, link: &TemporaryLink) -> Result<Vec<u8>> {
        self.client.fetch_link(&link.url).await
    }

    async fn overwrite(&self, path: &RemotePath, data: Vec<u8>) -> Result<RemoteFile> {
        let file = self.client.upload_overwrite(path, data).await?;
        Self::to_remote_file(file, path)
    }

    async fn list_folder(&self, path: &RemotePath) -> Result<Vec<RemoteFile>> {
        let entries = self.client.list_folder(path).await?;
        entries
            .into_iter()
            .filter(DropboxFile::is_file)
            .map(|file| {
                let fallback = path.join(&file.name)?;
                Self::to_remote_file(file, &fallback)
            })
            .collect()
    }
}

/// Factory function for the backend registry.
pub fn create_dropbox_storage(config: serde_json::Value) -> Result<Arc<dyn CloudStorage>> {
    let dropbox_config: DropboxConfig = serde_json::from_value(config)
        .map_err(|e| Error::InvalidInput(format!("Invalid Dropbox config: {}", e)))?;

    Ok(Arc::new(DropboxStorage::new(dropbox_config)?))
}
