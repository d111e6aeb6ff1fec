//! Fetch and decrypt a stored track for playback.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::session::{KeyLease, VaultSession};
use crate::track::Track;
use soundvault_common::{Error, Result, SensitiveBytes, TrackId};
use soundvault_crypto::{decrypt_content, unwrap_file_key};
use soundvault_storage::CloudStorage;

/// Decrypted audio ready to hand to a player.
///
/// The bytes are wiped when the value is dropped.
#[derive(Debug)]
pub struct PlayableSource {
    pub track_id: TrackId,
    pub mime_type: String,
    data: SensitiveBytes,
}

impl PlayableSource {
    /// The decrypted audio.
    pub fn data(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the source holds no audio.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Temporary link, fetch, unwrap, decrypt.
pub struct RetrievalPipeline {
    session: Arc<VaultSession>,
    storage: Arc<dyn CloudStorage>,
}

impl RetrievalPipeline {
    pub fn new(session: Arc<VaultSession>, storage: Arc<dyn CloudStorage>) -> Self {
        Self { session, storage }
    }

    /// Load a track into a playable source.
    ///
    /// # Errors
    /// - `Locked` if the session is signed out before or during the load
    /// - `NotPermitted` if the track belongs to another user
    /// - `Fetch` if the link cannot be obtained or the download fails
    /// - `UnwrapAuth` if the master key does not open the wrapped key
    /// - `CorruptKey` for a malformed wrapped key
    /// - `CipherIntegrity` for tampered or empty content
    pub async fn load_track(&self, track: &Track) -> Result<PlayableSource> {
        let lease = self.session.lease()?;
        if &track.user_id != lease.user_id() {
            return Err(Error::NotPermitted(format!(
                "Track {} belongs to another user",
                track.id
            )));
        }

        let link = lease
            .guard(self.storage.temporary_link(&track.cloud_path))
            .await
            .map_err(|e| match e {
                Error::NotFound(msg) => Error::Fetch(format!("No blob for track: {}", msg)),
                other => other,
            })?;
        debug!(track_id = %track.id, "Temporary link obtained");

        let blob = lease.guard(self.storage.fetch(&link)).await?;
        debug!(track_id = %track.id, size = blob.len(), "Blob fetched");

        lease.ensure_current()?;
        let file_key = unwrap_file_key(&track.wrapped_key, lease.key())?;
        let data = decrypt_content(blob, &file_key).inspect_err(|_| {
            if track.pending_key.is_some() {
                warn!(
                    track_id = %track.id,
                    "Track has an unfinished key rotation; finish the password change to restore it"
                );
            }
        })?;

        Ok(PlayableSource {
            track_id: track.id.clone(),
            mime_type: track.mime_type.clone(),
            data,
        })
    }
}
