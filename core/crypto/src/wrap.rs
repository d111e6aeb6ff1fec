//! Wrapping per-file keys under the master key.
//!
//! A wrapped key is `base64(iv || AES-GCM(file_key, master_key))` using the
//! standard padded alphabet. It is the only form in which a file key is ever
//! persisted.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

use crate::aead::{self, OpenError};
use crate::keys::{FileKey, MasterKey, KEY_LENGTH};
use soundvault_common::{Error, Result};

/// A file key sealed under a master key, as stored in the track record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappedFileKey(String);

impl WrappedFileKey {
    /// Take a stored wrapped key as-is. Validation happens on unwrap.
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// The base64 text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for WrappedFileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedFileKey({} chars)", self.0.len())
    }
}

/// Seal `file_key` under `master_key`.
///
/// # Postconditions
/// - A fresh IV is used for every call, so wrapping twice differs
/// - `unwrap_file_key(wrap_file_key(k, m), m) == k`
pub fn wrap_file_key(file_key: &FileKey, master_key: &MasterKey) -> Result<WrappedFileKey> {
    let sealed = aead::seal(master_key.as_bytes(), file_key.as_bytes())?;
    Ok(WrappedFileKey(STANDARD.encode(sealed)))
}

/// Recover a file key sealed by [`wrap_file_key`].
///
/// # Errors
/// - `CorruptKey` if the text is not base64, is too short, or decrypts to
///   something that is not a 256-bit key
/// - `UnwrapAuth` if the master key is wrong or the record was altered
pub fn unwrap_file_key(wrapped: &WrappedFileKey, master_key: &MasterKey) -> Result<FileKey> {
    let sealed = STANDARD
        .decode(wrapped.as_str())
        .map_err(|e| Error::CorruptKey(format!("Wrapped key is not valid base64: {}", e)))?;

    let mut raw = aead::open(master_key.as_bytes(), sealed).map_err(|e| match e {
        OpenError::TooShort => Error::CorruptKey("Wrapped key is truncated".to_string()),
        OpenError::Authentication => Error::UnwrapAuth(
            "Wrapped key does not authenticate under this master key".to_string(),
        ),
    })?;

    let result = <[u8; KEY_LENGTH]>::try_from(raw.as_slice())
        .map(FileKey::from_bytes)
        .map_err(|_| {
            Error::CorruptKey(format!(
                "Unwrapped key has length {}, expected {}",
                raw.len(),
                KEY_LENGTH
            ))
        });
    raw.zeroize();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::{IV_SIZE, TAG_SIZE};
    use crate::keys::MasterKey;

    fn master(byte: u8) -> MasterKey {
        MasterKey::from_bytes([byte; KEY_LENGTH])
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let master = master(3);
        let file_key = FileKey::generate();

        let wrapped = wrap_file_key(&file_key, &master).unwrap();
        let unwrapped = unwrap_file_key(&wrapped, &master).unwrap();

        assert_eq!(unwrapped.as_bytes(), file_key.as_bytes());
    }

    #[test]
    fn test_wrapped_layout() {
        let wrapped = wrap_file_key(&FileKey::generate(), &master(3)).unwrap();
        let decoded = STANDARD.decode(wrapped.as_str()).unwrap();
        assert_eq!(decoded.len(), IV_SIZE + KEY_LENGTH + TAG_SIZE);
    }

    #[test]
    fn test_wrong_master_key_is_unwrap_auth() {
        let wrapped = wrap_file_key(&FileKey::generate(), &master(3)).unwrap();
        let err = unwrap_file_key(&wrapped, &master(4)).unwrap_err();
        assert!(matches!(err, Error::UnwrapAuth(_)));
    }

    #[test]
    fn test_corrupt_inputs() {
        let master = master(3);

        let err = unwrap_file_key(&WrappedFileKey::new("not base64!!"), &master).unwrap_err();
        assert!(matches!(err, Error::CorruptKey(_)));

        let short = WrappedFileKey::new(STANDARD.encode([0u8; 10]));
        let err = unwrap_file_key(&short, &master).unwrap_err();
        assert!(matches!(err, Error::CorruptKey(_)));
    }

    #[test]
    fn test_wrong_length_payload_is_corrupt() {
        let master = master(3);
        let sealed = aead::seal(master.as_bytes(), &[1u8; 16]).unwrap();
        let wrapped = WrappedFileKey::new(STANDARD.encode(sealed));

        let err = unwrap_file_key(&wrapped, &master).unwrap_err();
        assert!(matches!(err, Error::CorruptKey(_)));
    }

    #[test]
    fn test_keys_are_independent() {
        let master = master(3);
        let a = FileKey::generate();
        let b = FileKey::generate();

        let wa = wrap_file_key(&a, &master).unwrap();
        let wb = wrap_file_key(&b, &master).unwrap();

        assert_ne!(wa, wb);
        assert_eq!(unwrap_file_key(&wb, &master).unwrap().as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_serde_transparent() {
        let wrapped = WrappedFileKey::new("abc=");
        assert_eq!(serde_json::to_string(&wrapped).unwrap(), "\"abc=\"");
    }
}
