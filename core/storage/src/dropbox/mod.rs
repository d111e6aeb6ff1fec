//! Dropbox storage backend for SoundVault.
//!
//! This module provides:
//! - OAuth2 token refresh with a five minute safety margin
//! - Upload sessions over `files/upload_session/*`
//! - Temporary links for downloads
//! - Error mapping from Dropbox error summaries

pub mod auth;
pub mod client;
pub mod provider;

pub use auth::{AuthConfig, TokenManager, Tokens};
pub use client::{DropboxClient, DropboxFile};
pub use provider::{create_dropbox_storage, DropboxConfig, DropboxStorage};
