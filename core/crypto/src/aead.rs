//! Authenticated encryption using AES-256-GCM.
//!
//! Every sealed message is laid out as `iv || ciphertext || tag` with a fresh
//! random 12-byte IV. Callers map [`OpenError`] onto the error kind that fits
//! what they were opening (a wrapped key or track content).

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::RngCore;
use zeroize::Zeroize;

use crate::keys::KEY_LENGTH;
use soundvault_common::{Error, Result};

/// IV size for AES-GCM (12 bytes).
pub const IV_SIZE: usize = 12;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Spare capacity a buffer needs for [`seal_in_place`] to keep its allocation.
pub const SEAL_OVERHEAD: usize = IV_SIZE + TAG_SIZE;

/// Why a sealed message could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// Shorter than IV + tag.
    TooShort,
    /// Tag verification failed (wrong key or tampered data).
    Authentication,
}

/// Encrypt `plaintext` under `key`.
///
/// # Postconditions
/// - Returns iv || ciphertext || tag, `IV_SIZE + len + TAG_SIZE` bytes
/// - Output is allocated once and encrypted in place
///
/// # Errors
/// - Returns `Crypto` if encryption fails
pub fn seal(key: &[u8; KEY_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut buffer = Vec::with_capacity(IV_SIZE + plaintext.len() + TAG_SIZE);
    buffer.extend_from_slice(&iv);
    buffer.extend_from_slice(plaintext);

    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer[IV_SIZE..])
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;
    buffer.extend_from_slice(&tag);

    Ok(buffer)
}

/// Encrypt a plaintext buffer in place, consuming it.
///
/// # Postconditions
/// - Returns iv || ciphertext || tag in the same buffer
/// - With `SEAL_OVERHEAD` spare capacity no reallocation happens; otherwise
///   the buffer only grows after it holds ciphertext
///
/// # Errors
/// - Returns `Crypto` if encryption fails; the buffer is wiped
pub fn seal_in_place(key: &[u8; KEY_LENGTH], mut buffer: Vec<u8>) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let tag = match cipher.encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer) {
        Ok(tag) => tag,
        Err(e) => {
            buffer.zeroize();
            return Err(Error::Crypto(format!("Encryption failed: {}", e)));
        }
    };

    let len = buffer.len();
    buffer.reserve_exact(SEAL_OVERHEAD);
    buffer.resize(len + IV_SIZE, 0);
    buffer.copy_within(..len, IV_SIZE);
    buffer[..IV_SIZE].copy_from_slice(&iv);
    buffer.extend_from_slice(&tag);

    Ok(buffer)
}

/// Decrypt a sealed message in place, consuming it.
///
/// # Postconditions
/// - Returns the plaintext reusing the input allocation
/// - The tag is verified before any plaintext is produced
pub fn open(key: &[u8; KEY_LENGTH], mut sealed: Vec<u8>) -> std::result::Result<Vec<u8>, OpenError> {
    if sealed.len() < IV_SIZE + TAG_SIZE {
        return Err(OpenError::TooShort);
    }

    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));

    let tag_start = sealed.len() - TAG_SIZE;
    let tag: Tag = GenericArray::clone_from_slice(&sealed[tag_start..]);
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&sealed[..IV_SIZE]);

    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&iv),
            b"",
            &mut sealed[IV_SIZE..tag_start],
            &tag,
        )
        .map_err(|_| OpenError::Authentication)?;

    sealed.truncate(tag_start);
    sealed.drain(..IV_SIZE);
    Ok(sealed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Hello, World!";

        let sealed = seal(&key, plaintext).unwrap();
        let opened = open(&key, sealed).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_sealed_size() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Test message";

        let sealed = seal(&key, plaintext).unwrap();
        assert_eq!(sealed.len(), IV_SIZE + plaintext.len() + TAG_SIZE);
    }

    #[test]
    fn test_different_iv_each_time() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Same plaintext";

        let ct1 = seal(&key, plaintext).unwrap();
        let ct2 = seal(&key, plaintext).unwrap();

        assert_ne!(&ct1[..IV_SIZE], &ct2[..IV_SIZE]);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&[1u8; KEY_LENGTH], b"Secret data").unwrap();
        assert_eq!(
            open(&[2u8; KEY_LENGTH], sealed),
            Err(OpenError::Authentication)
        );
    }

    #[test]
    fn test_tampered_fails() {
        let key = [42u8; KEY_LENGTH];
        let mut sealed = seal(&key, b"Important data").unwrap();
        sealed[IV_SIZE + 5] ^= 0xFF;

        assert_eq!(open(&key, sealed), Err(OpenError::Authentication));
    }

    #[test]
    fn test_too_short() {
        let key = [42u8; KEY_LENGTH];
        assert_eq!(open(&key, vec![0u8; IV_SIZE + TAG_SIZE - 1]), Err(OpenError::TooShort));
    }

    #[test]
    fn test_seal_in_place_keeps_allocation() {
        let key = [7u8; KEY_LENGTH];
        let plaintext = vec![0x5Au8; 4096];
        let mut buffer = Vec::with_capacity(plaintext.len() + SEAL_OVERHEAD);
        buffer.extend_from_slice(&plaintext);
        let ptr = buffer.as_ptr();

        let sealed = seal_in_place(&key, buffer).unwrap();
        assert_eq!(sealed.as_ptr(), ptr);
        assert_eq!(sealed.len(), IV_SIZE + plaintext.len() + TAG_SIZE);
        assert_eq!(open(&key, sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_seal_in_place_grows_tight_buffer() {
        let key = [7u8; KEY_LENGTH];
        let mut buffer = b"no spare room".to_vec();
        buffer.shrink_to_fit();

        let sealed = seal_in_place(&key, buffer).unwrap();
        assert_eq!(open(&key, sealed).unwrap(), b"no spare room");
    }

    #[test]
    fn test_large_plaintext() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = vec![0xABu8; 1_000_000];

        let sealed = seal(&key, &plaintext).unwrap();
        assert_eq!(open(&key, sealed).unwrap(), plaintext);
    }
}
