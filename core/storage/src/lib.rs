//! Cloud storage abstraction for SoundVault.
//!
//! Encrypted track blobs live in a third-party drive. This crate defines the
//! [`CloudStorage`] trait (upload sessions, temporary links, overwrite,
//! listing) and ships three backends: Dropbox, the local filesystem and an
//! in-memory store for tests.
//!
//! Backends only ever see ciphertext.

pub mod dropbox;
pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use dropbox::{DropboxConfig, DropboxStorage};
pub use local::LocalStorage;
pub use memory::{InjectedFailure, MemoryStorage, StorageCall, StorageOp};
pub use provider::{
    CloudStorage, CommitInfo, RemoteFile, TemporaryLink, UploadCursor, WriteMode,
};
pub use registry::{create_default_registry, BackendFactory, BackendRegistry};
