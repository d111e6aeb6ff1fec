//! Common utilities and types shared across SoundVault modules.
//!
//! This module provides the error taxonomy and the identifier and path
//! types used by the crypto, storage and vault crates.

pub mod error;
pub mod types;

pub use error::{Error, ErrorCode, Result};
pub use types::{RemotePath, SensitiveBytes, TrackId, UserId};
