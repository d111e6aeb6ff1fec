//! Authenticated encryption of track content.
//!
//! Audio is handled as raw bytes end to end. A content blob is
//! `iv(12) || ciphertext || tag(16)`.

use crate::aead::{self, OpenError};
use crate::keys::FileKey;
use soundvault_common::{Error, Result, SensitiveBytes};

/// Encrypt the full content of a track.
///
/// # Preconditions
/// - `plaintext` must not be empty
///
/// # Errors
/// - `InvalidInput` for empty content
pub fn encrypt_content(plaintext: &[u8], file_key: &FileKey) -> Result<Vec<u8>> {
    if plaintext.is_empty() {
        return Err(Error::InvalidInput(
            "Cannot encrypt empty content".to_string(),
        ));
    }
    aead::seal(file_key.as_bytes(), plaintext)
}

/// Spare capacity that lets [`encrypt_content_in_place`] reuse the
/// plaintext allocation.
pub const CONTENT_OVERHEAD: usize = aead::SEAL_OVERHEAD;

/// Encrypt the full content of a track in its own buffer.
///
/// Peak memory stays at one copy of the track. Callers reading a file can
/// allocate `len + CONTENT_OVERHEAD` up front to avoid any reallocation.
///
/// # Errors
/// - `InvalidInput` for empty content
pub fn encrypt_content_in_place(plaintext: Vec<u8>, file_key: &FileKey) -> Result<Vec<u8>> {
    if plaintext.is_empty() {
        return Err(Error::InvalidInput(
            "Cannot encrypt empty content".to_string(),
        ));
    }
    aead::seal_in_place(file_key.as_bytes(), plaintext)
}

/// Decrypt a content blob, consuming it.
///
/// # Postconditions
/// - Returned bytes are zeroized when dropped
///
/// # Errors
/// - `CipherIntegrity` if the blob is truncated, fails authentication, or
///   decrypts to nothing
pub fn decrypt_content(blob: Vec<u8>, file_key: &FileKey) -> Result<SensitiveBytes> {
    let plaintext = aead::open(file_key.as_bytes(), blob).map_err(|e| match e {
        OpenError::TooShort => Error::CipherIntegrity("Content blob is truncated".to_string()),
        OpenError::Authentication => {
            Error::CipherIntegrity("Content failed authentication".to_string())
        }
    })?;

    if plaintext.is_empty() {
        return Err(Error::CipherIntegrity(
            "Decryption produced empty content".to_string(),
        ));
    }
    Ok(SensitiveBytes::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::{seal, IV_SIZE, TAG_SIZE};
    use proptest::prelude::*;

    #[test]
    fn test_binary_roundtrip() {
        let key = FileKey::generate();
        // NUL bytes and invalid UTF-8 must survive
        let content = vec![0x00, 0xFF, 0xFE, 0x00, 0x80, 0xC3, 0x28, 0x00];

        let blob = encrypt_content(&content, &key).unwrap();
        assert_eq!(blob.len(), IV_SIZE + content.len() + TAG_SIZE);

        let plain = decrypt_content(blob, &key).unwrap();
        assert_eq!(plain.as_bytes(), content.as_slice());
    }

    #[test]
    fn test_in_place_encryption_reuses_buffer() {
        let key = FileKey::generate();
        let content: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut buffer = Vec::with_capacity(content.len() + CONTENT_OVERHEAD);
        buffer.extend_from_slice(&content);
        let ptr = buffer.as_ptr();

        let blob = encrypt_content_in_place(buffer, &key).unwrap();
        assert_eq!(blob.as_ptr(), ptr);
        assert_eq!(decrypt_content(blob, &key).unwrap().as_bytes(), &content[..]);

        assert!(matches!(
            encrypt_content_in_place(Vec::new(), &key),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_flipped_last_byte_is_integrity_error() {
        let key = FileKey::generate();
        let mut blob = encrypt_content(b"ID3\x04\x00 some audio", &key).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;

        let err = decrypt_content(blob, &key).unwrap_err();
        assert!(matches!(err, Error::CipherIntegrity(_)));
        assert_eq!(err.code().as_str(), "decrypt_failed");
    }

    #[test]
    fn test_wrong_key_is_integrity_error() {
        let blob = encrypt_content(b"audio", &FileKey::generate()).unwrap();
        let err = decrypt_content(blob, &FileKey::generate()).unwrap_err();
        assert!(matches!(err, Error::CipherIntegrity(_)));
    }

    #[test]
    fn test_empty_content_rejected() {
        let err = encrypt_content(b"", &FileKey::generate()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_empty_plaintext_after_decrypt_is_error() {
        let key = FileKey::generate();
        let blob = seal(key.as_bytes(), b"").unwrap();

        let err = decrypt_content(blob, &key).unwrap_err();
        assert!(matches!(err, Error::CipherIntegrity(_)));
    }

    #[test]
    fn test_truncated_blob() {
        let err = decrypt_content(vec![1, 2, 3], &FileKey::generate()).unwrap_err();
        assert!(matches!(err, Error::CipherIntegrity(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_arbitrary_bytes_roundtrip(content in prop::collection::vec(any::<u8>(), 1..4096)) {
            let key = FileKey::generate();
            let blob = encrypt_content(&content, &key).unwrap();
            let plain = decrypt_content(blob, &key).unwrap();
            prop_assert_eq!(plain.as_bytes(), content.as_slice());
        }
    }
}
