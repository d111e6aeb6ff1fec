#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use soundvault_common::UserId;
use soundvault_storage::MemoryStorage;
use soundvault_vault::{
    MemoryAuth, MemoryProfiles, MemoryTracks, PasswordChangeRequest, RetrievalPipeline, Track,
    UploadJournal, VaultConfig, VaultOperations, VaultReencryptor, VaultSession,
};

pub const OLD_PASSWORD: &str = "correct-horse-1";
pub const NEW_PASSWORD: &str = "battery-staple-2";

/// A signed-up user with in-memory collaborators.
pub struct Vault {
    pub dir: TempDir,
    pub user: UserId,
    pub session: Arc<VaultSession>,
    pub auth: Arc<MemoryAuth>,
    pub profiles: Arc<MemoryProfiles>,
    pub tracks: Arc<MemoryTracks>,
    pub storage: MemoryStorage,
    pub journal: Arc<UploadJournal>,
    pub config: VaultConfig,
}

impl Vault {
    pub async fn signed_up() -> Self {
        Self::with_config(VaultConfig::default()).await
    }

    pub async fn with_config(config: VaultConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let user = UserId::new("listener@example.com").unwrap();
        let auth = Arc::new(MemoryAuth::new());
        let profiles = Arc::new(MemoryProfiles::new());
        let session = Arc::new(VaultSession::new());

        auth.register(&user, OLD_PASSWORD).await.unwrap();
        auth.sign_in(&user, OLD_PASSWORD).await.unwrap();
        session
            .sign_up(&user, OLD_PASSWORD, profiles.as_ref(), &config.kdf_params)
            .await
            .unwrap();

        let journal = Arc::new(UploadJournal::open(dir.path()).await.unwrap());
        Self {
            dir,
            user,
            session,
            auth,
            profiles,
            tracks: Arc::new(MemoryTracks::new()),
            storage: MemoryStorage::new(),
            journal,
            config,
        }
    }

    pub fn operations(&self) -> VaultOperations {
        VaultOperations::new(
            self.session.clone(),
            Arc::new(self.storage.clone()),
            self.tracks.clone(),
            self.journal.clone(),
            self.config.clone(),
        )
        .unwrap()
    }

    pub fn retrieval(&self) -> RetrievalPipeline {
        RetrievalPipeline::new(self.session.clone(), Arc::new(self.storage.clone()))
    }

    pub fn reencryptor(&self) -> VaultReencryptor {
        VaultReencryptor::new(
            self.session.clone(),
            self.auth.clone(),
            self.profiles.clone(),
            self.tracks.clone(),
            Arc::new(self.storage.clone()),
            self.config.clone(),
        )
    }

    /// Sign in through the auth provider and unlock the session.
    pub async fn sign_in(&self, password: &str) {
        self.auth.sign_in(&self.user, password).await.unwrap();
        self.session
            .sign_in(&self.user, password, self.profiles.as_ref(), &self.config.kdf_params)
            .await
            .unwrap();
    }

    /// Upload tracks one after another so their creation times are ordered.
    pub async fn upload_all(&self, files: &[(&str, Vec<u8>)]) -> Vec<Track> {
        let ops = self.operations();
        let mut tracks = Vec::new();
        for (name, content) in files {
            let track = ops
                .upload_track(name, content.clone(), None, |_| {})
                .await
                .unwrap();
            tracks.push(track);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tracks
    }
}

pub fn change(old: &str, new: &str) -> PasswordChangeRequest {
    PasswordChangeRequest::new(old, new, new)
}

/// Binary audio-like content that is not valid UTF-8 and contains NUL bytes.
pub fn audio(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ 0x80)
        .collect()
}

pub fn three_tracks() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("Opening.mp3", audio(1, 4096)),
        ("Interlude.flac", audio(2, 10_000)),
        ("Finale.wav", audio(3, 777)),
    ]
}
