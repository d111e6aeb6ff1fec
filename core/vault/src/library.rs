//! The signed-in user's track library.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::store::{AuthProvider, TrackStore};
use crate::track::Track;
use soundvault_common::{Error, Result, TrackId};

/// Read access to the track list plus duration back-fill.
pub struct Library {
    auth: Arc<dyn AuthProvider>,
    tracks: Arc<dyn TrackStore>,
    timeout: Duration,
}

impl Library {
    /// Create a library view that gives up after `timeout`.
    pub fn new(auth: Arc<dyn AuthProvider>, tracks: Arc<dyn TrackStore>, timeout: Duration) -> Self {
        Self {
            auth,
            tracks,
            timeout,
        }
    }

    /// Load the current user's tracks, newest first.
    ///
    /// # Errors
    /// - `AuthExpired` if nobody is signed in
    /// - `Timeout` if the user lookup and listing together exceed the deadline
    pub async fn load(&self) -> Result<Vec<Track>> {
        let load = async {
            let user = self.auth.current_user().await?;
            if !user.session_active {
                return Err(Error::AuthExpired("Session is no longer active".to_string()));
            }
            let mut tracks = self.tracks.list_tracks(&user.user_id).await?;
            tracks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            debug!(user = %user.user_id, count = tracks.len(), "Library loaded");
            Ok(tracks)
        };

        tokio::time::timeout(self.timeout, load)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }

    /// Record a track's duration if it is not known yet.
    ///
    /// Returns whether the record was updated.
    ///
    /// # Errors
    /// - `NotFound` for an unknown track
    pub async fn backfill_duration(&self, id: &TrackId, duration_secs: u32) -> Result<bool> {
        let track = self
            .tracks
            .get_track(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Track {} not found", id)))?;
        if track.duration_secs.is_some() {
            return Ok(false);
        }

        self.tracks.update_duration(id, duration_secs).await?;
        info!(track_id = %id, duration_secs, "Duration back-filled");
        Ok(true)
    }
}
