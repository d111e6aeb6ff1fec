//! Vault session management.
//!
//! A session holds the signed-in user's master key in memory. Operations take
//! a [`KeyLease`] for the duration of one request; signing out drops the key
//! from the slot and every outstanding lease observes the revocation.

use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::store::{KeyProfile, ProfileStore};
use soundvault_common::{Error, Result, UserId};
use soundvault_crypto::{derive_key, KdfParams, MasterKey, Salt};

/// Session handle for tracking active sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(String);

impl SessionHandle {
    /// Generate a new unique session handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the handle string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// State of the vault session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A master key is installed.
    Active,
    /// No key is available.
    Locked,
}

struct KeySlot {
    user_id: UserId,
    key: Arc<MasterKey>,
    generation: u32,
}

/// Holder of the signed-in user's master key.
///
/// The key is installed whole on sign-in and removed whole on sign-out; it is
/// never mutated in place. Every install or removal advances the session
/// epoch, which invalidates leases taken earlier.
pub struct VaultSession {
    handle: SessionHandle,
    slot: RwLock<Option<KeySlot>>,
    epoch: watch::Sender<u64>,
}

impl VaultSession {
    /// Create a locked session.
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            handle: SessionHandle::new(),
            slot: RwLock::new(None),
            epoch,
        }
    }

    /// Get the session handle.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Get the current session state.
    pub fn state(&self) -> SessionState {
        if self.read_slot().is_some() {
            SessionState::Active
        } else {
            SessionState::Locked
        }
    }

    /// Check if a key is installed.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// The user whose key is installed.
    pub fn user_id(&self) -> Option<UserId> {
        self.read_slot().as_ref().map(|s| s.user_id.clone())
    }

    /// Install a master key, replacing any previous one.
    pub fn install(&self, user_id: UserId, key: MasterKey, generation: u32) {
        let mut slot = self.write_slot();
        *slot = Some(KeySlot {
            user_id,
            key: Arc::new(key),
            generation,
        });
        // Epoch moves under the slot lock so a lease never pairs a new key
        // with an old epoch.
        self.epoch.send_modify(|e| *e += 1);
        drop(slot);
        debug!(session = %self.handle.as_str(), generation, "Master key installed");
    }

    /// Borrow the installed key for one operation.
    ///
    /// # Errors
    /// - `Locked` if nobody is signed in
    pub fn lease(&self) -> Result<KeyLease> {
        let slot = self.read_slot();
        let slot = slot
            .as_ref()
            .ok_or_else(|| Error::Locked("No master key; sign in first".to_string()))?;
        let rx = self.epoch.subscribe();
        let epoch = *rx.borrow();
        Ok(KeyLease {
            key: slot.key.clone(),
            user_id: slot.user_id.clone(),
            generation: slot.generation,
            epoch,
            rx,
        })
    }

    /// Remove the master key and revoke outstanding leases.
    ///
    /// The key memory is wiped once the last lease is dropped.
    pub fn sign_out(&self) {
        let removed = {
            let mut slot = self.write_slot();
            let removed = slot.take();
            self.epoch.send_modify(|e| *e += 1);
            removed
        };
        if removed.is_some() {
            info!(session = %self.handle.as_str(), "Signed out; master key cleared");
        }
    }

    /// Create a key profile for a new account and unlock the session.
    ///
    /// # Postconditions
    /// - A fresh random salt is stored in the profile at generation 0
    /// - The derived master key is installed
    ///
    /// # Errors
    /// - `AlreadyExists` if the user already has a profile
    /// - `KeyDerivation` on an empty password
    pub async fn sign_up(
        &self,
        user_id: &UserId,
        password: &str,
        profiles: &dyn ProfileStore,
        params: &KdfParams,
    ) -> Result<()> {
        if profiles.get_profile(user_id).await?.is_some() {
            return Err(Error::AlreadyExists(format!(
                "Key profile for {} already exists",
                user_id
            )));
        }

        let (key, salt) = derive_master_key(password, None, params.clone()).await?;
        let profile = KeyProfile {
            salt: salt.to_base64(),
            key_generation: 0,
            pending: None,
        };
        profiles.put_profile(user_id, &profile).await?;
        self.install(user_id.clone(), key, 0);

        info!(user = %user_id, "Key profile created");
        Ok(())
    }

    /// Derive the master key from the stored salt and unlock the session.
    ///
    /// The password itself is checked by the auth provider; a wrong password
    /// here yields a key that fails to unwrap any file key.
    ///
    /// # Errors
    /// - `NotFound` if the user has no profile
    /// - `KeyDerivation` on an empty password or a malformed salt
    pub async fn sign_in(
        &self,
        user_id: &UserId,
        password: &str,
        profiles: &dyn ProfileStore,
        params: &KdfParams,
    ) -> Result<()> {
        let profile = profiles
            .get_profile(user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No key profile for {}", user_id)))?;
        let salt = Salt::from_base64(&profile.salt)?;

        let (key, _) = derive_master_key(password, Some(salt), params.clone()).await?;
        self.install(user_id.clone(), key, profile.key_generation);

        info!(user = %user_id, generation = profile.key_generation, "Session unlocked");
        Ok(())
    }

    fn read_slot(&self) -> std::sync::RwLockReadGuard<'_, Option<KeySlot>> {
        self.slot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<KeySlot>> {
        self.slot.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for VaultSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VaultSession {
    fn drop(&mut self) {
        self.sign_out();
    }
}

/// Shared, read-only access to the master key for one operation.
pub struct KeyLease {
    key: Arc<MasterKey>,
    user_id: UserId,
    generation: u32,
    epoch: u64,
    rx: watch::Receiver<u64>,
}

impl KeyLease {
    /// The leased key.
    pub fn key(&self) -> &MasterKey {
        &self.key
    }

    /// Owner of the key.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Generation of the key.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether the session still holds the key this lease was taken from.
    pub fn is_current(&self) -> bool {
        *self.rx.borrow() == self.epoch
    }

    /// Fail fast once the session has moved on.
    ///
    /// # Errors
    /// - `Locked` if the key was removed or replaced
    pub fn ensure_current(&self) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(Error::Locked("Session ended during the operation".to_string()))
        }
    }

    /// Resolves when the lease is revoked.
    pub async fn revoked(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() != self.epoch {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run a storage call, failing fast if the lease is revoked meanwhile.
    ///
    /// # Errors
    /// - `Locked` if the session ends before `call` completes
    pub async fn guard<T>(&self, call: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            result = call => result,
            _ = self.revoked() => Err(Error::Locked("Session ended during the operation".to_string())),
        }
    }
}

/// Run the password KDF off the async runtime.
pub async fn derive_master_key(
    password: &str,
    salt: Option<Salt>,
    params: KdfParams,
) -> Result<(MasterKey, Salt)> {
    let password = Zeroizing::new(password.as_bytes().to_vec());
    tokio::task::spawn_blocking(move || {
        derive_key(
            &password,
            salt.as_ref().map(|s| s.as_bytes().as_slice()),
            &params,
        )
    })
    .await
    .map_err(|e| Error::KeyDerivation(format!("Derivation task failed: {}", e)))?
}
