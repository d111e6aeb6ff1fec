//! Password change with full re-keying of the library.
//!
//! Every track is decrypted under its current file key, sealed again under a
//! fresh one and the new file key is wrapped with the master key derived from
//! the new password. Only after every track has moved does the profile salt
//! change and the account credential follow.
//!
//! A run that stops part-way can be repeated with the same passwords: the
//! target salt is parked in the profile as a pending rotation, every track
//! records the master key generation its wrapped key belongs to, and a staged
//! `pending_key` marks a track whose blob may already hold the new ciphertext.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::VaultConfig;
use crate::session::{derive_master_key, KeyLease, VaultSession};
use crate::store::{AuthProvider, KeyProfile, PendingRotation, ProfileStore, TrackStore};
use crate::track::Track;
use soundvault_common::{Error, Result, UserId};
use soundvault_crypto::{
    decrypt_content, encrypt_content, unwrap_file_key, wrap_file_key, FileKey, MasterKey, Salt,
};
use soundvault_storage::CloudStorage;

/// Step of a password change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReencryptPhase {
    Idle,
    VerifyingOldPassword,
    DerivingNewKey,
    Listing,
    Downloading,
    Decrypting,
    Encrypting,
    Uploading,
    UpdatingKeyRecord,
    SwappingSalt,
    UpdatingAuthCredential,
    Done,
    Failed,
}

impl fmt::Display for ReencryptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReencryptPhase::Idle => "validating the request",
            ReencryptPhase::VerifyingOldPassword => "verifying the current password",
            ReencryptPhase::DerivingNewKey => "deriving the new key",
            ReencryptPhase::Listing => "listing tracks",
            ReencryptPhase::Downloading => "downloading",
            ReencryptPhase::Decrypting => "decrypting",
            ReencryptPhase::Encrypting => "re-encrypting",
            ReencryptPhase::Uploading => "uploading",
            ReencryptPhase::UpdatingKeyRecord => "updating the key record",
            ReencryptPhase::SwappingSalt => "saving the new salt",
            ReencryptPhase::UpdatingAuthCredential => "updating the account password",
            ReencryptPhase::Done => "done",
            ReencryptPhase::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Progress reported before each track is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReencryptProgress {
    /// 1-based position of the track.
    pub current: usize,
    pub total: usize,
    /// Track title.
    pub label: String,
}

/// Outcome of a successful password change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReencryptReport {
    /// Tracks re-encrypted by this run.
    pub migrated: usize,
    /// Tracks an earlier, interrupted run had already moved.
    pub skipped: usize,
    pub total: usize,
}

/// Current, new and confirmation passwords. Wiped on drop.
pub struct PasswordChangeRequest {
    old: Zeroizing<String>,
    new: Zeroizing<String>,
    confirm: Zeroizing<String>,
}

impl PasswordChangeRequest {
    pub fn new(old: impl Into<String>, new: impl Into<String>, confirm: impl Into<String>) -> Self {
        Self {
            old: Zeroizing::new(old.into()),
            new: Zeroizing::new(new.into()),
            confirm: Zeroizing::new(confirm.into()),
        }
    }

    /// Check the request before anything is touched.
    ///
    /// # Errors
    /// - `InvalidInput` if the new password is shorter than `min_length`
    ///   characters, equals the current one, or does not match its confirmation
    pub fn validate(&self, min_length: usize) -> Result<()> {
        if self.new.chars().count() < min_length {
            return Err(Error::InvalidInput(format!(
                "New password must be at least {} characters",
                min_length
            )));
        }
        if *self.new == *self.old {
            return Err(Error::InvalidInput(
                "New password must differ from the current one".to_string(),
            ));
        }
        if *self.confirm != *self.new {
            return Err(Error::InvalidInput(
                "Password confirmation does not match".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for PasswordChangeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordChangeRequest([REDACTED])")
    }
}

/// State carried from the re-keying batch to the final swap.
struct Rekeyed {
    user: UserId,
    profile: KeyProfile,
    /// Base64 salt of the new master key.
    new_salt: String,
    target: u32,
    report: ReencryptReport,
}

/// Drives a password change through every track of the signed-in user.
pub struct VaultReencryptor {
    session: Arc<VaultSession>,
    auth: Arc<dyn AuthProvider>,
    profiles: Arc<dyn ProfileStore>,
    tracks: Arc<dyn TrackStore>,
    storage: Arc<dyn CloudStorage>,
    config: VaultConfig,
    phase: watch::Sender<ReencryptPhase>,
}

impl VaultReencryptor {
    pub fn new(
        session: Arc<VaultSession>,
        auth: Arc<dyn AuthProvider>,
        profiles: Arc<dyn ProfileStore>,
        tracks: Arc<dyn TrackStore>,
        storage: Arc<dyn CloudStorage>,
        config: VaultConfig,
    ) -> Self {
        let (phase, _) = watch::channel(ReencryptPhase::Idle);
        Self {
            session,
            auth,
            profiles,
            tracks,
            storage,
            config,
            phase,
        }
    }

    /// Follow phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<ReencryptPhase> {
        self.phase.subscribe()
    }

    /// Current phase.
    pub fn phase(&self) -> ReencryptPhase {
        *self.phase.borrow()
    }

    /// Change the account password and re-key every stored track.
    ///
    /// The configured deadline covers the per-track batch. Once every track
    /// has moved, the salt swap and credential update run to completion.
    ///
    /// # Preconditions
    /// - Session must be active
    ///
    /// # Postconditions
    /// - Every track is sealed under a fresh file key wrapped with the new
    ///   master key
    /// - The profile holds the new salt; the credential is updated
    /// - The session is signed out
    ///
    /// # Errors
    /// - `PasswordChange` for failures outside the per-track batch, with the
    ///   phase that failed
    /// - `BatchPartialFailure` naming the track, phase and cause; tracks
    ///   before it stay migrated, the salt and credential are untouched
    pub async fn change_password<F>(
        &self,
        request: PasswordChangeRequest,
        mut progress: F,
    ) -> Result<ReencryptReport>
    where
        F: FnMut(ReencryptProgress) + Send,
    {
        self.set_phase(ReencryptPhase::Idle);

        let batch = match self.config.reencrypt_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.rekey(&request, &mut progress))
                .await
                .unwrap_or_else(|_| Err(self.fail(Error::Timeout(limit)))),
            None => self.rekey(&request, &mut progress).await,
        };
        let result = match batch {
            Ok(batch) => self.commit(&request, batch).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(report) => info!(
                migrated = report.migrated,
                skipped = report.skipped,
                "Password changed"
            ),
            Err(e) => {
                warn!(phase = %self.phase(), error = %e, "Password change failed");
                self.set_phase(ReencryptPhase::Failed);
            }
        }
        result
    }

    /// Verify the request and move every track to the new master key.
    async fn rekey<F>(&self, request: &PasswordChangeRequest, progress: &mut F) -> Result<Rekeyed>
    where
        F: FnMut(ReencryptProgress) + Send,
    {
        let fail = |e| self.fail(e);
        let kdf = &self.config.kdf_params;

        request
            .validate(self.config.min_password_length)
            .map_err(fail)?;
        let lease = self.session.lease().map_err(fail)?;
        let user = lease.user_id().clone();

        self.set_phase(ReencryptPhase::VerifyingOldPassword);
        if !self
            .auth
            .verify_password(&user, &request.old)
            .await
            .map_err(fail)?
        {
            return Err(fail(Error::InvalidInput(
                "Current password is incorrect".to_string(),
            )));
        }
        let profile = self
            .profiles
            .get_profile(&user)
            .await
            .map_err(fail)?
            .ok_or_else(|| fail(Error::NotFound(format!("No key profile for {}", user))))?;
        let old_salt = Salt::from_base64(&profile.salt).map_err(fail)?;
        let (old_key, _) = derive_master_key(&request.old, Some(old_salt), kdf.clone())
            .await
            .map_err(fail)?;
        same_key(&old_key, lease.key()).map_err(fail)?;

        self.set_phase(ReencryptPhase::DerivingNewKey);
        let (target, new_salt) = match &profile.pending {
            Some(pending) => {
                info!(generation = pending.generation, "Resuming unfinished password change");
                (
                    pending.generation,
                    Some(Salt::from_base64(&pending.salt).map_err(fail)?),
                )
            }
            None => (profile.key_generation + 1, None),
        };
        let (new_key, new_salt) = derive_master_key(&request.new, new_salt, kdf.clone())
            .await
            .map_err(fail)?;
        let new_salt = new_salt.to_base64();

        self.set_phase(ReencryptPhase::Listing);
        let mut tracks = self.tracks.list_tracks(&user).await.map_err(fail)?;
        tracks.sort_by_key(|t| t.created_at);

        match &profile.pending {
            Some(_) => self
                .check_resumed(&mut tracks, &lease, &new_key, target)
                .await
                .map_err(fail)?,
            None => {
                let parked = KeyProfile {
                    pending: Some(PendingRotation {
                        salt: new_salt.clone(),
                        generation: target,
                    }),
                    ..profile.clone()
                };
                self.profiles.put_profile(&user, &parked).await.map_err(fail)?;
            }
        }

        let total = tracks.len();
        let mut migrated = 0;
        let mut skipped = 0;
        for (i, track) in tracks.iter().enumerate() {
            lease.ensure_current().map_err(fail)?;
            progress(ReencryptProgress {
                current: i + 1,
                total,
                label: track.title.clone(),
            });

            if track.key_generation == target {
                debug!(track_id = %track.id, "Already migrated");
                skipped += 1;
                continue;
            }

            if let Err((phase, source)) = self.migrate(track, &lease, &new_key, target).await {
                return Err(Error::BatchPartialFailure {
                    track_id: track.id.to_string(),
                    title: track.title.clone(),
                    phase: phase.to_string(),
                    migrated: migrated + skipped,
                    source: Box::new(source),
                });
            }
            migrated += 1;
        }
        lease.ensure_current().map_err(fail)?;

        Ok(Rekeyed {
            user,
            profile,
            new_salt,
            target,
            report: ReencryptReport {
                migrated,
                skipped,
                total,
            },
        })
    }

    /// Swap the salt, move the credential and sign out.
    async fn commit(&self, request: &PasswordChangeRequest, batch: Rekeyed) -> Result<ReencryptReport> {
        let Rekeyed {
            user,
            profile,
            new_salt,
            target,
            report,
        } = batch;

        self.set_phase(ReencryptPhase::SwappingSalt);
        let swapped = KeyProfile {
            salt: new_salt.clone(),
            key_generation: target,
            pending: None,
        };
        self.profiles
            .put_profile(&user, &swapped)
            .await
            .map_err(|e| self.fail(e))?;

        self.set_phase(ReencryptPhase::UpdatingAuthCredential);
        if let Err(e) = self.auth.update_password(&user, &request.new).await {
            // The old password keeps working; a rerun finds every track
            // migrated and only repeats the last two steps.
            let rollback = KeyProfile {
                pending: Some(PendingRotation {
                    salt: new_salt,
                    generation: target,
                }),
                ..profile
            };
            if let Err(rb) = self.profiles.put_profile(&user, &rollback).await {
                error!(error = %rb, "Failed to restore the key profile");
            }
            return Err(self.fail(e));
        }

        self.set_phase(ReencryptPhase::Done);
        self.session.sign_out();
        if let Err(e) = self.auth.sign_out().await {
            warn!(error = %e, "Sign-out after password change failed");
        }
        Ok(report)
    }

    /// Make sure a resumed run continues with the password it started with.
    ///
    /// Keys staged under another password are dropped when their blob still
    /// holds the old ciphertext.
    async fn check_resumed(
        &self,
        tracks: &mut [Track],
        lease: &KeyLease,
        new_key: &MasterKey,
        target: u32,
    ) -> Result<()> {
        let different = || {
            Error::InvalidInput(
                "An unfinished password change used a different new password; repeat it with that password"
                    .to_string(),
            )
        };

        if let Some(done) = tracks.iter().find(|t| t.key_generation == target) {
            return match unwrap_file_key(&done.wrapped_key, new_key) {
                Ok(_) => Ok(()),
                Err(Error::UnwrapAuth(_)) => Err(different()),
                Err(e) => Err(e),
            };
        }

        for track in tracks.iter_mut() {
            let Some(pending) = &track.pending_key else {
                continue;
            };
            match unwrap_file_key(pending, new_key) {
                Ok(_) => continue,
                Err(Error::UnwrapAuth(_)) => {}
                Err(e) => return Err(e),
            }

            let link = lease.guard(self.storage.temporary_link(&track.cloud_path)).await?;
            let blob = lease.guard(self.storage.fetch(&link)).await?;
            let old_file_key = unwrap_file_key(&track.wrapped_key, lease.key())?;
            if decrypt_content(blob, &old_file_key).is_err() {
                return Err(different());
            }

            self.tracks.discard_pending_key(&track.id).await?;
            track.pending_key = None;
            debug!(track_id = %track.id, "Dropped key staged under another password");
        }
        Ok(())
    }

    /// Move one track to the new master key.
    async fn migrate(
        &self,
        track: &Track,
        lease: &KeyLease,
        new_key: &MasterKey,
        target: u32,
    ) -> std::result::Result<(), (ReencryptPhase, Error)> {
        let step = |phase: ReencryptPhase| {
            self.set_phase(phase);
            move |e: Error| (phase, e)
        };

        let on_err = step(ReencryptPhase::Downloading);
        lease.ensure_current().map_err(on_err)?;
        let link = lease
            .guard(self.storage.temporary_link(&track.cloud_path))
            .await
            .map_err(on_err)?;
        let blob = lease.guard(self.storage.fetch(&link)).await.map_err(on_err)?;

        let on_err = step(ReencryptPhase::Decrypting);
        lease.ensure_current().map_err(on_err)?;
        if let Some(pending) = &track.pending_key {
            // The blob may already be the new ciphertext from an interrupted run
            if let Ok(file_key) = unwrap_file_key(pending, new_key) {
                if decrypt_content(blob.clone(), &file_key).is_ok() {
                    let on_err = step(ReencryptPhase::UpdatingKeyRecord);
                    self.tracks
                        .commit_pending_key(&track.id, target)
                        .await
                        .map_err(on_err)?;
                    debug!(track_id = %track.id, "Committed staged key");
                    return Ok(());
                }
            }
        }
        let old_file_key = unwrap_file_key(&track.wrapped_key, lease.key()).map_err(on_err)?;
        let plaintext = decrypt_content(blob, &old_file_key).map_err(on_err)?;

        let on_err = step(ReencryptPhase::Encrypting);
        let file_key = FileKey::generate();
        let sealed = encrypt_content(plaintext.as_bytes(), &file_key).map_err(on_err)?;
        drop(plaintext);
        let wrapped = wrap_file_key(&file_key, new_key).map_err(on_err)?;

        let on_err = step(ReencryptPhase::Uploading);
        lease.ensure_current().map_err(on_err)?;
        self.tracks
            .stage_pending_key(&track.id, &wrapped)
            .await
            .map_err(on_err)?;
        lease
            .guard(self.storage.overwrite(&track.cloud_path, sealed))
            .await
            .map_err(on_err)?;

        // The blob now holds the new ciphertext; record it even if the
        // session ended meanwhile.
        let on_err = step(ReencryptPhase::UpdatingKeyRecord);
        self.tracks
            .commit_pending_key(&track.id, target)
            .await
            .map_err(on_err)?;

        debug!(track_id = %track.id, generation = target, "Track re-encrypted");
        Ok(())
    }

    fn set_phase(&self, phase: ReencryptPhase) {
        self.phase.send_replace(phase);
    }

    /// Attach the current phase to an error raised outside the batch.
    fn fail(&self, e: Error) -> Error {
        match e {
            Error::PasswordChange { .. } | Error::BatchPartialFailure { .. } => e,
            other => Error::PasswordChange {
                phase: self.phase().to_string(),
                source: Box::new(other),
            },
        }
    }
}

/// Confirm two master keys are the same by wrapping a throwaway key.
fn same_key(derived: &MasterKey, unlocked: &MasterKey) -> Result<()> {
    let sample = wrap_file_key(&FileKey::generate(), unlocked)?;
    match unwrap_file_key(&sample, derived) {
        Ok(_) => Ok(()),
        Err(Error::UnwrapAuth(_)) => Err(Error::InvalidInput(
            "Current password does not match the unlocked vault".to_string(),
        )),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation_order() {
        let short = PasswordChangeRequest::new("correct-horse-1", "short", "short");
        assert!(matches!(short.validate(8), Err(Error::InvalidInput(m)) if m.contains("at least 8")));

        let same = PasswordChangeRequest::new("correct-horse-1", "correct-horse-1", "correct-horse-1");
        assert!(matches!(same.validate(8), Err(Error::InvalidInput(m)) if m.contains("differ")));

        let mismatch = PasswordChangeRequest::new("correct-horse-1", "battery-staple-2", "battery-staple-3");
        assert!(matches!(mismatch.validate(8), Err(Error::InvalidInput(m)) if m.contains("confirmation")));

        let ok = PasswordChangeRequest::new("correct-horse-1", "battery-staple-2", "battery-staple-2");
        assert!(ok.validate(8).is_ok());
    }

    #[test]
    fn test_length_counts_characters() {
        let request = PasswordChangeRequest::new("old-password", "äöüäöüäö", "äöüäöüäö");
        assert!(request.validate(8).is_ok());
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(ReencryptPhase::Uploading.to_string(), "uploading");
        assert_eq!(
            ReencryptPhase::UpdatingAuthCredential.to_string(),
            "updating the account password"
        );
    }

    #[test]
    fn test_request_debug_redacts() {
        let request = PasswordChangeRequest::new("a", "b", "c");
        assert_eq!(format!("{:?}", request), "PasswordChangeRequest([REDACTED])");
    }

    #[test]
    fn test_fail_wraps_once() {
        let err = Error::PasswordChange {
            phase: "listing tracks".to_string(),
            source: Box::new(Error::Network("reset".to_string())),
        };
        assert!(err.to_string().starts_with("Password was NOT changed"));
        assert!(err.is_retryable());
    }
}
