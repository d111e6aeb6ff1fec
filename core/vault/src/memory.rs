//! In-memory collaborators for testing and offline use.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::store::{AuthProvider, CurrentUser, KeyProfile, ProfileStore, TrackStore};
use crate::track::{NewTrack, Track};
use soundvault_common::{Error, Result, TrackId, UserId};
use soundvault_crypto::WrappedFileKey;

#[derive(Default)]
struct AuthState {
    passwords: HashMap<UserId, String>,
    current: Option<UserId>,
    fail_update: bool,
}

/// Password-based auth provider holding accounts in memory.
#[derive(Default)]
pub struct MemoryAuth {
    state: RwLock<AuthState>,
}

impl MemoryAuth {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account.
    pub async fn register(&self, user: &UserId, password: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.passwords.contains_key(user) {
            return Err(Error::AlreadyExists(format!("Account {} exists", user)));
        }
        state.passwords.insert(user.clone(), password.to_string());
        Ok(())
    }

    /// Sign an account in.
    ///
    /// # Errors
    /// - `NotPermitted` on wrong credentials
    pub async fn sign_in(&self, user: &UserId, password: &str) -> Result<()> {
        let mut state = self.state.write().await;
        match state.passwords.get(user) {
            Some(stored) if stored == password => {
                state.current = Some(user.clone());
                Ok(())
            }
            _ => Err(Error::NotPermitted("Invalid credentials".to_string())),
        }
    }

    /// Make the next `update_password` calls fail with a network error.
    pub async fn fail_password_updates(&self, fail: bool) {
        self.state.write().await.fail_update = fail;
    }

    /// Whether anyone is signed in.
    pub async fn is_signed_in(&self) -> bool {
        self.state.read().await.current.is_some()
    }
}

#[async_trait]
impl AuthProvider for MemoryAuth {
    async fn current_user(&self) -> Result<CurrentUser> {
        let state = self.state.read().await;
        let user_id = state
            .current
            .clone()
            .ok_or_else(|| Error::AuthExpired("Not signed in".to_string()))?;
        Ok(CurrentUser {
            user_id,
            session_active: true,
        })
    }

    async fn verify_password(&self, user: &UserId, password: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.passwords.get(user).is_some_and(|p| p == password))
    }

    async fn update_password(&self, user: &UserId, new_password: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_update {
            return Err(Error::Network("credential service unavailable".to_string()));
        }
        let entry = state
            .passwords
            .get_mut(user)
            .ok_or_else(|| Error::NotFound(format!("Account {} not found", user)))?;
        *entry = new_password.to_string();
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        self.state.write().await.current = None;
        Ok(())
    }
}

/// Key profiles held in memory.
#[derive(Default)]
pub struct MemoryProfiles {
    profiles: RwLock<HashMap<UserId, KeyProfile>>,
}

impl MemoryProfiles {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfiles {
    async fn get_profile(&self, user: &UserId) -> Result<Option<KeyProfile>> {
        Ok(self.profiles.read().await.get(user).cloned())
    }

    async fn put_profile(&self, user: &UserId, profile: &KeyProfile) -> Result<()> {
        self.profiles
            .write()
            .await
            .insert(user.clone(), profile.clone());
        Ok(())
    }
}

#[derive(Default)]
struct TrackState {
    tracks: HashMap<TrackId, Track>,
    list_delay: Option<Duration>,
    fail_insert: bool,
}

/// Track metadata held in memory.
#[derive(Default)]
pub struct MemoryTracks {
    state: RwLock<TrackState>,
}

impl MemoryTracks {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stall every `list_tracks` call by `delay`.
    pub async fn set_list_delay(&self, delay: Option<Duration>) {
        self.state.write().await.list_delay = delay;
    }

    /// Make the next `insert_track` calls fail with a storage error.
    pub async fn fail_inserts(&self, fail: bool) {
        self.state.write().await.fail_insert = fail;
    }

    /// Number of stored tracks.
    pub async fn len(&self) -> usize {
        self.state.read().await.tracks.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn modify(&self, id: &TrackId, f: impl FnOnce(&mut Track) -> Result<()>) -> Result<()> {
        let mut state = self.state.write().await;
        let track = state
            .tracks
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Track {} not found", id)))?;
        f(track)?;
        track.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TrackStore for MemoryTracks {
    async fn list_tracks(&self, user: &UserId) -> Result<Vec<Track>> {
        let delay = self.state.read().await.list_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.read().await;
        Ok(state
            .tracks
            .values()
            .filter(|t| &t.user_id == user)
            .cloned()
            .collect())
    }

    async fn get_track(&self, id: &TrackId) -> Result<Option<Track>> {
        Ok(self.state.read().await.tracks.get(id).cloned())
    }

    async fn insert_track(&self, track: NewTrack) -> Result<Track> {
        let mut state = self.state.write().await;
        if state.fail_insert {
            return Err(Error::Storage("track database unavailable".to_string()));
        }
        let track = track.into_track(TrackId::generate(), Utc::now());
        state.tracks.insert(track.id.clone(), track.clone());
        Ok(track)
    }

    async fn update_duration(&self, id: &TrackId, duration_secs: u32) -> Result<()> {
        self.modify(id, |track| {
            track.duration_secs = Some(duration_secs);
            Ok(())
        })
        .await
    }

    async fn stage_pending_key(&self, id: &TrackId, wrapped: &WrappedFileKey) -> Result<()> {
        self.modify(id, |track| {
            track.pending_key = Some(wrapped.clone());
            Ok(())
        })
        .await
    }

    async fn commit_pending_key(&self, id: &TrackId, generation: u32) -> Result<()> {
        self.modify(id, |track| {
            let pending = track.pending_key.take().ok_or_else(|| {
                Error::NotFound(format!("Track {} has no staged key", track.id))
            })?;
            track.wrapped_key = pending;
            track.key_generation = generation;
            Ok(())
        })
        .await
    }

    async fn discard_pending_key(&self, id: &TrackId) -> Result<()> {
        self.modify(id, |track| {
            track.pending_key = None;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soundvault_common::RemotePath;

    fn new_track(user: &UserId) -> NewTrack {
        NewTrack {
            user_id: user.clone(),
            title: "Song".to_string(),
            artist: None,
            duration_secs: None,
            cloud_path: RemotePath::parse("/x-song.mp3").unwrap(),
            wrapped_key: WrappedFileKey::new("old"),
            key_generation: 0,
            mime_type: "audio/mpeg".to_string(),
        }
    }

    #[tokio::test]
    async fn test_pending_key_lifecycle() {
        let store = MemoryTracks::new();
        let user = UserId::new("u1").unwrap();
        let track = store.insert_track(new_track(&user)).await.unwrap();

        store
            .stage_pending_key(&track.id, &WrappedFileKey::new("new"))
            .await
            .unwrap();
        let staged = store.get_track(&track.id).await.unwrap().unwrap();
        assert_eq!(staged.wrapped_key.as_str(), "old");
        assert_eq!(staged.pending_key.as_ref().unwrap().as_str(), "new");

        store.commit_pending_key(&track.id, 1).await.unwrap();
        let committed = store.get_track(&track.id).await.unwrap().unwrap();
        assert_eq!(committed.wrapped_key.as_str(), "new");
        assert_eq!(committed.key_generation, 1);
        assert!(committed.pending_key.is_none());

        // Nothing left to commit
        assert!(matches!(
            store.commit_pending_key(&track.id, 2).await,
            Err(Error::NotFound(_))
        ));

        store
            .stage_pending_key(&track.id, &WrappedFileKey::new("stale"))
            .await
            .unwrap();
        store.discard_pending_key(&track.id).await.unwrap();
        let discarded = store.get_track(&track.id).await.unwrap().unwrap();
        assert_eq!(discarded.wrapped_key.as_str(), "new");
        assert!(discarded.pending_key.is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_user() {
        let store = MemoryTracks::new();
        let alice = UserId::new("alice").unwrap();
        let bob = UserId::new("bob").unwrap();
        store.insert_track(new_track(&alice)).await.unwrap();
        store.insert_track(new_track(&bob)).await.unwrap();

        assert_eq!(store.list_tracks(&alice).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_auth_flow() {
        let auth = MemoryAuth::new();
        let user = UserId::new("u1").unwrap();
        auth.register(&user, "correct-horse-1").await.unwrap();

        assert!(auth.current_user().await.is_err());
        assert!(auth.sign_in(&user, "wrong").await.is_err());
        auth.sign_in(&user, "correct-horse-1").await.unwrap();
        assert_eq!(auth.current_user().await.unwrap().user_id, user);

        assert!(auth.verify_password(&user, "correct-horse-1").await.unwrap());
        auth.update_password(&user, "battery-staple-2").await.unwrap();
        assert!(!auth.verify_password(&user, "correct-horse-1").await.unwrap());

        auth.sign_out().await.unwrap();
        assert!(!auth.is_signed_in().await);
    }
}
