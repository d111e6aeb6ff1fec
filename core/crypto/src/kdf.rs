//! Key derivation using PBKDF2-HMAC-SHA256.

use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::keys::{MasterKey, Salt, KEY_LENGTH};
use soundvault_common::{Error, Result};

/// Lowest iteration count accepted for derivation.
pub const MIN_ITERATIONS: u32 = 100_000;

/// Parameters for PBKDF2 key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Number of HMAC-SHA256 iterations.
    pub iterations: u32,
}

impl KdfParams {
    /// Create parameters with an explicit iteration count.
    pub fn new(iterations: u32) -> Self {
        Self { iterations }
    }

    /// Check the parameters against the minimum cost.
    pub fn validate(&self) -> Result<()> {
        if self.iterations < MIN_ITERATIONS {
            return Err(Error::KeyDerivation(format!(
                "Iteration count {} is below the minimum of {}",
                self.iterations, MIN_ITERATIONS
            )));
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: MIN_ITERATIONS,
        }
    }
}

/// Derive a master key from a password and an optional salt.
///
/// # Preconditions
/// - `password` must not be empty
/// - `salt`, when given, must be exactly SALT_LENGTH bytes
///
/// # Postconditions
/// - Returns the derived MasterKey and the salt actually used
/// - A fresh random salt is generated when `salt` is `None`
/// - The derived key is deterministic given the same inputs
///
/// # Errors
/// - `KeyDerivation` on empty password, bad salt length or weak params
///
/// # Security
/// - Password is not stored or logged
/// - Intermediate key buffer is zeroized
pub fn derive_key(
    password: &[u8],
    salt: Option<&[u8]>,
    params: &KdfParams,
) -> Result<(MasterKey, Salt)> {
    if password.is_empty() {
        return Err(Error::KeyDerivation(
            "Password cannot be empty".to_string(),
        ));
    }
    params.validate()?;

    let salt = match salt {
        Some(bytes) => Salt::from_slice(bytes)?,
        None => Salt::generate(),
    };

    let mut key_bytes = [0u8; KEY_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt.as_bytes(), params.iterations, &mut key_bytes);

    let key = MasterKey::from_bytes(key_bytes);
    zeroize::Zeroize::zeroize(&mut key_bytes);

    Ok((key, salt))
}
