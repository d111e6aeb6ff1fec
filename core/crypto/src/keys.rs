//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use soundvault_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of the per-user KDF salt in bytes.
pub const SALT_LENGTH: usize = 16;

/// Master key derived from the user password.
///
/// The raw bytes are only reachable from inside this crate, so callers can
/// wrap and unwrap with the key but never export it. Not `Clone`: share it
/// behind an `Arc` instead.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    pub(crate) fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Key for encrypting the content of a single track.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct FileKey {
    key: [u8; KEY_LENGTH],
}

impl FileKey {
    /// Generate a random file key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    pub(crate) fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileKey([REDACTED])")
    }
}

/// Salt for key derivation.
///
/// Stored in the user profile as standard padded base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt([u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from raw bytes.
    ///
    /// # Errors
    /// - Returns `KeyDerivation` if `bytes` is not exactly SALT_LENGTH long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let salt: [u8; SALT_LENGTH] = bytes.try_into().map_err(|_| {
            Error::KeyDerivation(format!(
                "Invalid salt length: expected {}, got {}",
                SALT_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(salt))
    }

    /// Decode a salt stored as base64.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::KeyDerivation(format!("Salt is not valid base64: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Encode for storage.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_key_generate() {
        let key1 = FileKey::generate();
        let key2 = FileKey::generate();

        // Random keys should be different
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_salt_generate() {
        let salt1 = Salt::generate();
        let salt2 = Salt::generate();

        assert_ne!(salt1.as_bytes(), salt2.as_bytes());
    }

    #[test]
    fn test_salt_base64_roundtrip() {
        let salt = Salt::generate();
        let encoded = salt.to_base64();
        // 16 bytes -> 24 chars padded
        assert_eq!(encoded.len(), 24);
        assert_eq!(Salt::from_base64(&encoded).unwrap(), salt);
    }

    #[test]
    fn test_salt_wrong_length() {
        let err = Salt::from_slice(&[0u8; 15]).unwrap_err();
        assert!(matches!(err, Error::KeyDerivation(_)));

        let err = Salt::from_base64(&STANDARD.encode([0u8; 32])).unwrap_err();
        assert!(matches!(err, Error::KeyDerivation(_)));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = MasterKey::from_bytes([7u8; KEY_LENGTH]);
        assert_eq!(format!("{:?}", key), "MasterKey([REDACTED])");
        assert_eq!(format!("{:?}", FileKey::generate()), "FileKey([REDACTED])");
    }
}
