//! Collaborator interfaces consumed by the vault core.
//!
//! Authentication, the per-user key profile and track metadata live outside
//! the core (a hosted backend, or the CLI's SQLite file). The core only
//! talks to them through these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::track::{NewTrack, Track};
use soundvault_common::{Result, TrackId, UserId};
use soundvault_crypto::WrappedFileKey;

/// The authenticated principal, as reported by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub user_id: UserId,
    pub session_active: bool,
}

/// Account authentication.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The signed-in user.
    ///
    /// # Errors
    /// - `AuthExpired` if nobody is signed in
    async fn current_user(&self) -> Result<CurrentUser>;

    /// Check an account password without changing any state.
    async fn verify_password(&self, user: &UserId, password: &str) -> Result<bool>;

    /// Replace the account password.
    async fn update_password(&self, user: &UserId, new_password: &str) -> Result<()>;

    /// End the authenticated session.
    async fn sign_out(&self) -> Result<()>;
}

/// A salt rotation that has been started but not committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRotation {
    /// Base64 salt of the new master key.
    pub salt: String,
    /// Generation number the new master key will carry.
    pub generation: u32,
}

/// Per-user key derivation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyProfile {
    /// Base64 salt of the current master key.
    pub salt: String,
    /// Generation number of the current master key.
    pub key_generation: u32,
    /// Rotation in progress, if a password change was interrupted.
    #[serde(default)]
    pub pending: Option<PendingRotation>,
}

/// Storage for key profiles.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetch a user's profile, if one exists.
    async fn get_profile(&self, user: &UserId) -> Result<Option<KeyProfile>>;

    /// Create or replace a user's profile.
    async fn put_profile(&self, user: &UserId, profile: &KeyProfile) -> Result<()>;
}

/// Storage for track metadata.
#[async_trait]
pub trait TrackStore: Send + Sync {
    /// All tracks owned by `user`, in no particular order.
    async fn list_tracks(&self, user: &UserId) -> Result<Vec<Track>>;

    /// A single track.
    async fn get_track(&self, id: &TrackId) -> Result<Option<Track>>;

    /// Record a newly uploaded track.
    async fn insert_track(&self, track: NewTrack) -> Result<Track>;

    /// Set the duration of a track.
    ///
    /// # Errors
    /// - `NotFound` for an unknown track
    async fn update_duration(&self, id: &TrackId, duration_secs: u32) -> Result<()>;

    /// Record a replacement wrapped key without activating it.
    async fn stage_pending_key(&self, id: &TrackId, wrapped: &WrappedFileKey) -> Result<()>;

    /// Promote the staged key to the active one at `generation`.
    ///
    /// # Errors
    /// - `NotFound` if the track or its staged key is missing
    async fn commit_pending_key(&self, id: &TrackId, generation: u32) -> Result<()>;

    /// Drop a staged key, leaving the active one in place.
    async fn discard_pending_key(&self, id: &TrackId) -> Result<()>;
}
