//! Track records and audio file naming rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use soundvault_common::{RemotePath, TrackId, UserId};
use soundvault_crypto::WrappedFileKey;

/// A stored track.
///
/// The remote blob at `cloud_path` is only readable with `wrapped_key` and
/// the owner's master key at `key_generation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub user_id: UserId,
    pub title: String,
    pub artist: Option<String>,
    /// Length in seconds, back-filled after first playback.
    pub duration_secs: Option<u32>,
    pub cloud_path: RemotePath,
    pub wrapped_key: WrappedFileKey,
    /// Master key generation `wrapped_key` is sealed under.
    pub key_generation: u32,
    /// Replacement key staged by an unfinished password change.
    pub pending_key: Option<WrappedFileKey>,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a track is first recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrack {
    pub user_id: UserId,
    pub title: String,
    pub artist: Option<String>,
    pub duration_secs: Option<u32>,
    pub cloud_path: RemotePath,
    pub wrapped_key: WrappedFileKey,
    pub key_generation: u32,
    pub mime_type: String,
}

impl NewTrack {
    /// Materialize into a full record.
    pub fn into_track(self, id: TrackId, now: DateTime<Utc>) -> Track {
        Track {
            id,
            user_id: self.user_id,
            title: self.title,
            artist: self.artist,
            duration_secs: self.duration_secs,
            cloud_path: self.cloud_path,
            wrapped_key: self.wrapped_key,
            key_generation: self.key_generation,
            pending_key: None,
            mime_type: self.mime_type,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lowercase extension of a file name, without the dot.
pub fn extension(file_name: &str) -> Option<String> {
    match file_name.rfind('.') {
        Some(idx) if idx + 1 < file_name.len() => Some(file_name[idx + 1..].to_ascii_lowercase()),
        _ => None,
    }
}

/// Whether `file_name` carries one of the `accepted` extensions.
pub fn is_audio_file(file_name: &str, accepted: &[String]) -> bool {
    extension(file_name).is_some_and(|ext| accepted.iter().any(|a| a.eq_ignore_ascii_case(&ext)))
}

/// MIME type for an audio file name.
pub fn mime_type_for(file_name: &str) -> &'static str {
    match extension(file_name).as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

/// Display title: the file name without its extension.
pub fn title_from_filename(file_name: &str) -> String {
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => file_name[..idx].to_string(),
        _ => file_name.to_string(),
    }
}
