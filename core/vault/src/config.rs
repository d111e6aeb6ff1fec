//! Vault configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use soundvault_common::{Error, RemotePath, Result};
use soundvault_crypto::KdfParams;

/// Default upload chunk size (8 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Largest chunk a single upload request may carry (150 MiB).
pub const MAX_CHUNK_SIZE: usize = 150 * 1024 * 1024;

/// Default deadline for loading the library.
pub const DEFAULT_LIBRARY_TIMEOUT_SECS: u64 = 30;

/// Shortest accepted account password.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// File extensions accepted for upload.
pub const DEFAULT_AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "wav", "ogg", "flac"];

/// Runtime configuration of the vault core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Bytes per upload chunk.
    pub chunk_size: usize,
    /// Master key derivation parameters.
    pub kdf_params: KdfParams,
    /// Deadline for loading the track list, in seconds.
    pub library_timeout_secs: u64,
    /// Optional deadline for the re-keying batch of a password change, in seconds.
    pub reencrypt_timeout_secs: Option<u64>,
    /// Minimum length of a new password, in characters.
    pub min_password_length: usize,
    /// Lowercase extensions accepted for upload.
    pub audio_extensions: Vec<String>,
    /// Remote folder new uploads land in.
    pub upload_folder: RemotePath,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            kdf_params: KdfParams::default(),
            library_timeout_secs: DEFAULT_LIBRARY_TIMEOUT_SECS,
            reencrypt_timeout_secs: None,
            min_password_length: MIN_PASSWORD_LENGTH,
            audio_extensions: DEFAULT_AUDIO_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            upload_folder: RemotePath::root(),
        }
    }
}

impl VaultConfig {
    /// Check every field is within its accepted range.
    ///
    /// # Errors
    /// - `InvalidInput` for a zero or oversized chunk size, a zero timeout,
    ///   a password minimum below the floor, or no audio extensions
    /// - `KeyDerivation` for KDF parameters below the minimum cost
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "Chunk size must be between 1 and {} bytes, got {}",
                MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        if self.library_timeout_secs == 0 || self.reencrypt_timeout_secs == Some(0) {
            return Err(Error::InvalidInput(
                "Timeouts must be at least one second".to_string(),
            ));
        }
        if self.min_password_length < MIN_PASSWORD_LENGTH {
            return Err(Error::InvalidInput(format!(
                "Minimum password length cannot be below {}",
                MIN_PASSWORD_LENGTH
            )));
        }
        if self.audio_extensions.is_empty() {
            return Err(Error::InvalidInput(
                "At least one audio extension must be accepted".to_string(),
            ));
        }
        self.kdf_params.validate()
    }

    /// Library load deadline.
    pub fn library_timeout(&self) -> Duration {
        Duration::from_secs(self.library_timeout_secs)
    }

    /// Re-keying batch deadline, if any.
    pub fn reencrypt_timeout(&self) -> Option<Duration> {
        self.reencrypt_timeout_secs.map(Duration::from_secs)
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize and validate configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
