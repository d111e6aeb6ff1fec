//! Vault engine for SoundVault.
//!
//! This module provides:
//! - Sessions holding the signed-in user's master key
//! - Encrypted, chunked, resumable track upload
//! - Retrieval and decryption of stored tracks
//! - Password change with re-keying of every track
//! - The collaborator traits for auth, key profiles and track metadata
//!
//! # Architecture
//! The vault sits between the user interface and the storage backends,
//! handling all encryption and decryption. Backends only see ciphertext and
//! the metadata store only sees wrapped keys.

pub mod config;
pub mod journal;
pub mod library;
pub mod memory;
pub mod operations;
pub mod reencrypt;
pub mod retrieval;
pub mod session;
pub mod store;
pub mod track;
pub mod uploader;

pub use config::VaultConfig;
pub use journal::{PendingUpload, UploadJournal};
pub use library::Library;
pub use memory::{MemoryAuth, MemoryProfiles, MemoryTracks};
pub use operations::VaultOperations;
pub use reencrypt::{
    PasswordChangeRequest, ReencryptPhase, ReencryptProgress, ReencryptReport, VaultReencryptor,
};
pub use retrieval::{PlayableSource, RetrievalPipeline};
pub use session::{derive_master_key, KeyLease, SessionHandle, SessionState, VaultSession};
pub use store::{AuthProvider, CurrentUser, KeyProfile, PendingRotation, ProfileStore, TrackStore};
pub use track::{NewTrack, Track};
pub use uploader::{
    CheckpointSink, ChunkedUploader, NoCheckpoint, UploadCheckpoint, UploadPhase, UploadProgress,
};
