//! Dropbox HTTP API client.

use chrono::{DateTime, Utc};
use reqwest::{header, Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use soundvault_common::{Error, RemotePath, Result};

use super::auth::TokenManager;
use crate::provider::{CommitInfo, UploadCursor, WriteMode};

/// RPC endpoint base.
pub const DROPBOX_API_BASE: &str = "https://api.dropboxapi.com/2";
/// Content upload/download endpoint base.
pub const DROPBOX_CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

/// File metadata returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropboxFile {
    #[serde(rename = ".tag", default)]
    pub tag: Option<String>,
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub server_modified: Option<DateTime<Utc>>,
}

impl DropboxFile {
    /// Whether the entry is a file (listings also return folders).
    pub fn is_file(&self) -> bool {
        self.tag.as_deref().map_or(true, |t| t == "file")
    }
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct TemporaryLinkResponse {
    link: String,
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<DropboxFile>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_summary: String,
}

/// Wire form of a path; the API spells the root as the empty string.
pub(crate) fn api_path(path: &RemotePath) -> String {
    if path.is_root() {
        String::new()
    } else {
        path.to_string_path()
    }
}

/// Serialize a `Dropbox-API-Arg` value. HTTP headers must be ASCII, so every
/// non-ASCII character is written as a JSON `\u` escape.
pub(crate) fn header_safe_json(value: &serde_json::Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Map a non-success API response onto the error taxonomy.
pub(crate) fn classify_error(status: StatusCode, body: &str) -> Error {
    let summary = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error_summary)
        .unwrap_or_default();
    let detail = if summary.is_empty() {
        format!("{} - {}", status, body)
    } else {
        summary.clone()
    };

    if summary.contains("invalid_access_token")
        || summary.contains("expired_access_token")
        || status == StatusCode::UNAUTHORIZED
    {
        Error::AuthExpired(detail)
    } else if summary.contains("incorrect_offset")
        || summary.contains("lookup_failed/not_found")
        || summary.contains("lookup_failed/closed")
    {
        Error::Protocol(detail)
    } else if summary.contains("not_found") {
        Error::NotFound(detail)
    } else if summary.contains("/conflict") {
        Error::AlreadyExists(detail)
    } else if status == StatusCode::FORBIDDEN {
        Error::NotPermitted(detail)
    } else {
        Error::Network(format!("API error: {}", detail))
    }
}

fn commit_arg(commit: &CommitInfo) -> serde_json::Value {
    json!({
        "path": api_path(&commit.path),
        "mode": match commit.mode {
            WriteMode::Add => "add",
            WriteMode::Overwrite => "overwrite",
        },
        "autorename": commit.autorename,
        "mute": false,
    })
}

fn cursor_arg(cursor: &UploadCursor) -> serde_json::Value {
    json!({
        "session_id": cursor.session_id,
        "offset": cursor.offset,
    })
}

/// Dropbox API client.
pub struct DropboxClient {
    http: Client,
    token_manager: Arc<TokenManager>,
    api_base: String,
    content_base: String,
}

impl DropboxClient {
    /// Create a new client against the public endpoints.
    pub fn new(http: Client, token_manager: Arc<TokenManager>) -> Self {
        Self {
            http,
            token_manager,
            api_base: DROPBOX_API_BASE.to_string(),
            content_base: DROPBOX_CONTENT_BASE.to_string(),
        }
    }

    /// Get authorization header.
    async fn auth_header(&self) -> Result<String> {
        let token = self.token_manager.get_access_token().await?;
        Ok(format!("Bearer {}", token))
    }

    /// POST raw bytes to a content endpoint with a `Dropbox-API-Arg` header.
    async fn content_call(
        &self,
        endpoint: &str,
        arg: serde_json::Value,
        body: Vec<u8>,
    ) -> Result<Response> {
        let url = format!("{}/{}", self.content_base, endpoint);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header("Dropbox-API-Arg", header_safe_json(&arg))
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} failed: {}", endpoint, e)))?;

        self.check(response).await
    }

    /// POST a JSON body to an RPC endpoint.
    async fn rpc_call<T: DeserializeOwned>(&self, endpoint: &str, arg: serde_json::Value) -> Result<T> {
        let url = format!("{}/{}", self.api_base, endpoint);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .json(&arg)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} failed: {}", endpoint, e)))?;

        let response = self.check(response).await?;
        Self::parse(response, endpoint).await
    }

    async fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = classify_error(status, &body);
        if matches!(err, Error::AuthExpired(_)) {
            self.token_manager.invalidate().await;
        }
        Err(err)
    }

    async fn parse<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse {} response: {}", what, e)))
    }

    /// `files/upload_session/start`.
    pub async fn upload_session_start(&self, chunk: Vec<u8>) -> Result<String> {
        let response = self
            .content_call("files/upload_session/start", json!({ "close": false }), chunk)
            .await?;
        let started: StartResponse = Self::parse(response, "upload_session/start").await?;
        debug!(session_id = %started.session_id, "Opened Dropbox upload session");
        Ok(started.session_id)
    }

    /// `files/upload_session/append_v2`.
    pub async fn upload_session_append(&self, cursor: &UploadCursor, chunk: Vec<u8>) -> Result<()> {
        self.content_call(
            "files/upload_session/append_v2",
            json!({ "cursor": cursor_arg(cursor), "close": false }),
            chunk,
        )
        .await?;
        Ok(())
    }

    /// `files/upload_session/finish`.
    pub async fn upload_session_finish(
        &self,
        cursor: &UploadCursor,
        commit: &CommitInfo,
        chunk: Vec<u8>,
    ) -> Result<DropboxFile> {
        let response = self
            .content_call(
                "files/upload_session/finish",
                json!({ "cursor": cursor_arg(cursor), "commit": commit_arg(commit) }),
                chunk,
            )
            .await?;
        Self::parse(response, "upload_session/finish").await
    }

    /// `files/upload` in overwrite mode (single request, up to 150 MiB).
    pub async fn upload_overwrite(&self, path: &RemotePath, data: Vec<u8>) -> Result<DropboxFile> {
        let commit = CommitInfo {
            path: path.clone(),
            mode: WriteMode::Overwrite,
            autorename: false,
        };
        let response = self
            .content_call("files/upload", commit_arg(&commit), data)
            .await?;
        Self::parse(response, "upload").await
    }

    /// `files/get_temporary_link`.
    pub async fn get_temporary_link(&self, path: &RemotePath) -> Result<String> {
        let response: TemporaryLinkResponse = self
            .rpc_call("files/get_temporary_link", json!({ "path": api_path(path) }))
            .await?;
        Ok(response.link)
    }

    /// `files/list_folder` plus `list_folder/continue` until exhausted.
    pub async fn list_folder(&self, path: &RemotePath) -> Result<Vec<DropboxFile>> {
        let mut page: ListFolderResponse = self
            .rpc_call("files/list_folder", json!({ "path": api_path(path) }))
            .await?;
        let mut entries = std::mem::take(&mut page.entries);

        while page.has_more {
            page = self
                .rpc_call(
                    "files/list_folder/continue",
                    json!({ "cursor": page.cursor }),
                )
                .await?;
            entries.append(&mut page.entries);
        }

        Ok(entries)
    }

    /// Download the bytes behind a temporary link (no auth header).
    pub async fn fetch_link(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("HTTP {}", status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Fetch(format!("Failed to read body: {}", e)))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_path_root_is_empty() {
        assert_eq!(api_path(&RemotePath::root()), "");
        assert_eq!(api_path(&RemotePath::parse("/a.mp3").unwrap()), "/a.mp3");
    }

    #[test]
    fn test_header_safe_json_escapes_non_ascii() {
        let arg = json!({ "path": "/Björk - 🎵.mp3" });
        let header = header_safe_json(&arg);

        assert!(header.is_ascii());
        assert!(header.contains("Bj\\u00f6rk"));
        assert!(header.contains("\\ud83c\\udfb5"));

        // Still valid JSON that decodes to the original
        let back: serde_json::Value = serde_json::from_str(&header).unwrap();
        assert_eq!(back, arg);
    }

    #[test]
    fn test_classify_expired_token() {
        let body = r#"{"error_summary": "expired_access_token/...", "error": {".tag": "expired_access_token"}}"#;
        let err = classify_error(StatusCode::UNAUTHORIZED, body);
        assert!(matches!(err, Error::AuthExpired(_)));
        assert_eq!(err.code().as_str(), "auth_expired");
    }

    #[test]
    fn test_classify_incorrect_offset() {
        let body = r#"{"error_summary": "incorrect_offset/..", "error": {".tag": "incorrect_offset", "correct_offset": 8388608}}"#;
        let err = classify_error(StatusCode::CONFLICT, body);
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_classify_path_not_found() {
        let body = r#"{"error_summary": "path/not_found/..", "error": {".tag": "path"}}"#;
        let err = classify_error(StatusCode::CONFLICT, body);
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_classify_server_error_is_retryable() {
        let err = classify_error(StatusCode::SERVICE_UNAVAILABLE, "upstream down");
        assert!(matches!(err, Error::Network(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_commit_arg_shape() {
        let arg = commit_arg(&CommitInfo::add(RemotePath::parse("/x.mp3").unwrap()));
        assert_eq!(arg["mode"], "add");
        assert_eq!(arg["autorename"], true);
        assert_eq!(arg["path"], "/x.mp3");
    }

    #[test]
    fn test_list_entry_tags() {
        let folder: DropboxFile =
            serde_json::from_str(r#"{".tag": "folder", "name": "Music"}"#).unwrap();
        let file: DropboxFile = serde_json::from_str(
            r#"{".tag": "file", "name": "a.mp3", "id": "id:1", "size": 10, "rev": "abc"}"#,
        )
        .unwrap();
        assert!(!folder.is_file());
        assert!(file.is_file());
        assert_eq!(file.size, Some(10));
    }
}
