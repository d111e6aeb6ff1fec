//! Common error types for SoundVault.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for SoundVault operations.
///
/// Messages never carry passwords or key material.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid password or salt handed to key derivation.
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// A wrapped file key failed authentication under the given master key.
    ///
    /// Either the master key is wrong (re-authentication needed) or the
    /// stored ciphertext was altered.
    #[error("Key unwrap failed: {0}")]
    UnwrapAuth(String),

    /// A wrapped file key is structurally invalid (bad encoding or length).
    #[error("Corrupt wrapped key: {0}")]
    CorruptKey(String),

    /// Authenticated decryption of content failed, or produced nothing.
    #[error("Integrity check failed: {0}")]
    CipherIntegrity(String),

    /// Cryptographic operation failed for another reason.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Upload session protocol violation (offset or session mismatch).
    #[error("Upload protocol error: {0}")]
    Protocol(String),

    /// Transport failure or non-success response on an API call.
    #[error("Network error: {0}")]
    Network(String),

    /// Fetching a blob from a temporary link failed.
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// Remote credentials are invalid or expired.
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// No master key is available (signed out, or the key was replaced).
    #[error("Session locked: {0}")]
    Locked(String),

    /// An explicit deadline elapsed.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A password change failed before or after the per-file batch.
    #[error("Password was NOT changed: failed while {phase}: {source}")]
    PasswordChange {
        phase: String,
        #[source]
        source: Box<Error>,
    },

    /// One file of a re-encryption batch failed.
    #[error(
        "Password was NOT changed: re-encrypting '{title}' ({track_id}) failed while {phase}: {source} ({migrated} file(s) already migrated)"
    )]
    BatchPartialFailure {
        track_id: String,
        title: String,
        phase: String,
        migrated: usize,
        #[source]
        source: Box<Error>,
    },

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

/// Stable error codes surfaced to UI collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    DecryptFailed,
    UnwrapFailed,
    CorruptKey,
    FetchFailed,
    NetworkError,
    AuthExpired,
    ProtocolError,
    Timeout,
    InvalidInput,
    NotFound,
    BatchFailed,
    Internal,
}

impl ErrorCode {
    /// The wire name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DecryptFailed => "decrypt_failed",
            ErrorCode::UnwrapFailed => "unwrap_failed",
            ErrorCode::CorruptKey => "corrupt_key",
            ErrorCode::FetchFailed => "fetch_failed",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::AuthExpired => "auth_expired",
            ErrorCode::ProtocolError => "protocol_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::NotFound => "not_found",
            ErrorCode::BatchFailed => "batch_failed",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Map this error onto the UI-facing taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::CipherIntegrity(_) | Error::Crypto(_) => ErrorCode::DecryptFailed,
            Error::UnwrapAuth(_) => ErrorCode::UnwrapFailed,
            Error::CorruptKey(_) => ErrorCode::CorruptKey,
            Error::Fetch(_) => ErrorCode::FetchFailed,
            Error::Network(_) => ErrorCode::NetworkError,
            Error::AuthExpired(_) | Error::Locked(_) => ErrorCode::AuthExpired,
            Error::Protocol(_) => ErrorCode::ProtocolError,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::KeyDerivation(_) | Error::InvalidInput(_) => ErrorCode::InvalidInput,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::BatchPartialFailure { .. } => ErrorCode::BatchFailed,
            Error::PasswordChange { source, .. } => source.code(),
            Error::Storage(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::NotPermitted(_)
            | Error::AlreadyExists(_) => ErrorCode::Internal,
        }
    }

    /// Whether a caller may reasonably offer a retry.
    ///
    /// The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Fetch(_) | Error::Timeout(_) | Error::Io(_) => true,
            Error::BatchPartialFailure { source, .. } | Error::PasswordChange { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
