//! Cryptographic primitives for SoundVault.
//!
//! This module provides:
//! - Key derivation using PBKDF2-HMAC-SHA256
//! - Per-file key wrapping under the master key (AES-256-GCM)
//! - Authenticated encryption of audio content (AES-256-GCM)
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - Raw master key bytes never leave this crate
//! - No plaintext or key material is ever logged

pub mod aead;
pub mod content;
pub mod kdf;
pub mod keys;
pub mod wrap;

pub use content::{decrypt_content, encrypt_content, encrypt_content_in_place, CONTENT_OVERHEAD};
pub use kdf::{derive_key, KdfParams, MIN_ITERATIONS};
pub use keys::{FileKey, MasterKey, Salt, KEY_LENGTH, SALT_LENGTH};
pub use wrap::{unwrap_file_key, wrap_file_key, WrappedFileKey};
