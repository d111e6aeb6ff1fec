//! SQLite-backed accounts, key profiles and track records.
//!
//! Stands in for the hosted backend when the vault is driven from the command
//! line. Account passwords are stored as Argon2 PHC strings.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use soundvault_common::{Error, RemotePath, Result, TrackId, UserId};
use soundvault_crypto::WrappedFileKey;
use soundvault_vault::{
    AuthProvider, CurrentUser, KeyProfile, NewTrack, PendingRotation, ProfileStore, Track,
    TrackStore,
};

const TRACK_COLUMNS: &str = "id, user_id, title, artist, duration_secs, cloud_path, wrapped_key, \
     key_generation, pending_key, mime_type, created_at, updated_at";

/// Local store using SQLite.
pub struct LocalStore {
    conn: Mutex<Connection>,
    current: Mutex<Option<UserId>>,
}

impl LocalStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                user_id TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS key_profiles (
                user_id TEXT PRIMARY KEY,
                salt TEXT NOT NULL,
                key_generation INTEGER NOT NULL,
                pending_salt TEXT,
                pending_generation INTEGER
            );

            CREATE TABLE IF NOT EXISTS tracks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                artist TEXT,
                duration_secs INTEGER,
                cloud_path TEXT NOT NULL,
                wrapped_key TEXT NOT NULL,
                key_generation INTEGER NOT NULL,
                pending_key TEXT,
                mime_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tracks_user ON tracks(user_id);
            "#,
        )
        .map_err(db_err)?;

        info!("Local store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            current: Mutex::new(None),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Create an account.
    ///
    /// # Errors
    /// - `AlreadyExists` if the user id is taken
    pub fn register(&self, user: &UserId, password: &str) -> Result<()> {
        let hash = hash_password(password)?;
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO accounts (user_id, password_hash) VALUES (?1, ?2)",
                params![user.as_str(), hash],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(Error::AlreadyExists(format!("Account {} exists", user)));
        }
        debug!(user = %user, "Account registered");
        Ok(())
    }

    /// Check credentials and mark the user as signed in.
    ///
    /// # Errors
    /// - `NotPermitted` for an unknown user or a wrong password
    pub fn sign_in(&self, user: &UserId, password: &str) -> Result<()> {
        if !self.check_password(user, password)? {
            return Err(Error::NotPermitted("Invalid user or password".to_string()));
        }
        *self.current()? = Some(user.clone());
        Ok(())
    }

    fn check_password(&self, user: &UserId, password: &str) -> Result<bool> {
        let stored = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare("SELECT password_hash FROM accounts WHERE user_id = ?1")
                .map_err(db_err)?;
            match stmt.query_row([user.as_str()], |row| row.get::<_, String>(0)) {
                Ok(hash) => hash,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(false),
                Err(e) => return Err(db_err(e)),
            }
        };

        let parsed = PasswordHash::new(&stored)
            .map_err(|e| Error::Storage(format!("Stored password hash is malformed: {}", e)))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("database lock poisoned".to_string()))
    }

    fn current(&self) -> Result<MutexGuard<'_, Option<UserId>>> {
        self.current
            .lock()
            .map_err(|_| Error::Storage("session lock poisoned".to_string()))
    }

    fn query_tracks(&self, filter: &str, arg: &str) -> Result<Vec<Track>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM tracks WHERE {} = ?1", TRACK_COLUMNS, filter))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([arg], TrackRow::from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(TrackRow::into_track).collect()
    }

    fn touch(&self, sql: &str, id: &TrackId, value: &dyn rusqlite::ToSql) -> Result<usize> {
        self.conn()?
            .execute(sql, params![value, Utc::now().to_rfc3339(), id.as_str()])
            .map_err(db_err)
    }
}

#[async_trait]
impl AuthProvider for LocalStore {
    async fn current_user(&self) -> Result<CurrentUser> {
        let user_id = self
            .current()?
            .clone()
            .ok_or_else(|| Error::AuthExpired("Not signed in".to_string()))?;
        Ok(CurrentUser {
            user_id,
            session_active: true,
        })
    }

    async fn verify_password(&self, user: &UserId, password: &str) -> Result<bool> {
        self.check_password(user, password)
    }

    async fn update_password(&self, user: &UserId, new_password: &str) -> Result<()> {
        let hash = hash_password(new_password)?;
        let updated = self
            .conn()?
            .execute(
                "UPDATE accounts SET password_hash = ?1 WHERE user_id = ?2",
                params![hash, user.as_str()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Account {} not found", user)));
        }
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        *self.current()? = None;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for LocalStore {
    async fn get_profile(&self, user: &UserId) -> Result<Option<KeyProfile>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT salt, key_generation, pending_salt, pending_generation \
                 FROM key_profiles WHERE user_id = ?1",
            )
            .map_err(db_err)?;

        let profile = stmt.query_row([user.as_str()], |row| {
            let pending_salt: Option<String> = row.get(2)?;
            let pending_generation: Option<u32> = row.get(3)?;
            Ok(KeyProfile {
                salt: row.get(0)?,
                key_generation: row.get(1)?,
                pending: pending_salt
                    .zip(pending_generation)
                    .map(|(salt, generation)| PendingRotation { salt, generation }),
            })
        });

        match profile {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn put_profile(&self, user: &UserId, profile: &KeyProfile) -> Result<()> {
        let (pending_salt, pending_generation) = match &profile.pending {
            Some(p) => (Some(p.salt.as_str()), Some(p.generation)),
            None => (None, None),
        };
        self.conn()?
            .execute(
                r#"
                INSERT OR REPLACE INTO key_profiles
                (user_id, salt, key_generation, pending_salt, pending_generation)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    user.as_str(),
                    profile.salt,
                    profile.key_generation,
                    pending_salt,
                    pending_generation,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl TrackStore for LocalStore {
    async fn list_tracks(&self, user: &UserId) -> Result<Vec<Track>> {
        self.query_tracks("user_id", user.as_str())
    }

    async fn get_track(&self, id: &TrackId) -> Result<Option<Track>> {
        Ok(self.query_tracks("id", id.as_str())?.into_iter().next())
    }

    async fn insert_track(&self, track: NewTrack) -> Result<Track> {
        let track = track.into_track(TrackId::generate(), Utc::now());
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO tracks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    TRACK_COLUMNS
                ),
                params![
                    track.id.as_str(),
                    track.user_id.as_str(),
                    track.title,
                    track.artist,
                    track.duration_secs,
                    track.cloud_path.to_string_path(),
                    track.wrapped_key.as_str(),
                    track.key_generation,
                    track.pending_key.as_ref().map(|k| k.as_str()),
                    track.mime_type,
                    track.created_at.to_rfc3339(),
                    track.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        Ok(track)
    }

    async fn update_duration(&self, id: &TrackId, duration_secs: u32) -> Result<()> {
        let updated = self.touch(
            "UPDATE tracks SET duration_secs = ?1, updated_at = ?2 WHERE id = ?3",
            id,
            &duration_secs,
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Track {} not found", id)));
        }
        Ok(())
    }

    async fn stage_pending_key(&self, id: &TrackId, wrapped: &WrappedFileKey) -> Result<()> {
        let updated = self.touch(
            "UPDATE tracks SET pending_key = ?1, updated_at = ?2 WHERE id = ?3",
            id,
            &wrapped.as_str(),
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Track {} not found", id)));
        }
        Ok(())
    }

    async fn commit_pending_key(&self, id: &TrackId, generation: u32) -> Result<()> {
        let updated = self.touch(
            "UPDATE tracks SET wrapped_key = pending_key, pending_key = NULL, \
             key_generation = ?1, updated_at = ?2 WHERE id = ?3 AND pending_key IS NOT NULL",
            id,
            &generation,
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Track {} has no staged key", id)));
        }
        Ok(())
    }

    async fn discard_pending_key(&self, id: &TrackId) -> Result<()> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE tracks SET pending_key = NULL, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id.as_str()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Track {} not found", id)));
        }
        Ok(())
    }
}

/// Raw column values of a track row.
struct TrackRow {
    id: String,
    user_id: String,
    title: String,
    artist: Option<String>,
    duration_secs: Option<u32>,
    cloud_path: String,
    wrapped_key: String,
    key_generation: u32,
    pending_key: Option<String>,
    mime_type: String,
    created_at: String,
    updated_at: String,
}

impl TrackRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            artist: row.get(3)?,
            duration_secs: row.get(4)?,
            cloud_path: row.get(5)?,
            wrapped_key: row.get(6)?,
            key_generation: row.get(7)?,
            pending_key: row.get(8)?,
            mime_type: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_track(self) -> Result<Track> {
        Ok(Track {
            id: TrackId::new(self.id)?,
            user_id: UserId::new(self.user_id)?,
            title: self.title,
            artist: self.artist,
            duration_secs: self.duration_secs,
            cloud_path: RemotePath::parse(&self.cloud_path)?,
            wrapped_key: WrappedFileKey::new(self.wrapped_key),
            key_generation: self.key_generation,
            pending_key: self.pending_key.map(WrappedFileKey::new),
            mime_type: self.mime_type,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Bad timestamp '{}': {}", value, e)))
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Crypto(format!("Password hashing failed: {}", e)))
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(format!("SQLite: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new("listener").unwrap()
    }

    fn new_track(title: &str) -> NewTrack {
        NewTrack {
            user_id: user(),
            title: title.to_string(),
            artist: Some("Band".to_string()),
            duration_secs: None,
            cloud_path: RemotePath::parse(&format!("/{}.mp3", title)).unwrap(),
            wrapped_key: WrappedFileKey::new("wrapped-0"),
            key_generation: 0,
            mime_type: "audio/mpeg".to_string(),
        }
    }

    #[tokio::test]
    async fn test_accounts() {
        let store = LocalStore::in_memory().unwrap();
        store.register(&user(), "correct-horse-1").unwrap();
        assert!(matches!(
            store.register(&user(), "x"),
            Err(Error::AlreadyExists(_))
        ));

        assert!(store.current_user().await.is_err());
        assert!(store.sign_in(&user(), "wrong").is_err());
        store.sign_in(&user(), "correct-horse-1").unwrap();
        assert_eq!(store.current_user().await.unwrap().user_id, user());

        store.update_password(&user(), "battery-staple-2").await.unwrap();
        assert!(!store.verify_password(&user(), "correct-horse-1").await.unwrap());
        assert!(store.verify_password(&user(), "battery-staple-2").await.unwrap());

        store.sign_out().await.unwrap();
        assert!(store.current_user().await.is_err());
    }

    #[tokio::test]
    async fn test_profile_roundtrip() {
        let store = LocalStore::in_memory().unwrap();
        assert!(store.get_profile(&user()).await.unwrap().is_none());

        let profile = KeyProfile {
            salt: "c2FsdA==".to_string(),
            key_generation: 2,
            pending: Some(PendingRotation {
                salt: "bmV3".to_string(),
                generation: 3,
            }),
        };
        store.put_profile(&user(), &profile).await.unwrap();
        assert_eq!(store.get_profile(&user()).await.unwrap(), Some(profile.clone()));

        let committed = KeyProfile {
            pending: None,
            ..profile
        };
        store.put_profile(&user(), &committed).await.unwrap();
        assert_eq!(store.get_profile(&user()).await.unwrap(), Some(committed));
    }

    #[tokio::test]
    async fn test_track_lifecycle() {
        let store = LocalStore::in_memory().unwrap();
        let track = store.insert_track(new_track("song")).await.unwrap();

        let loaded = store.get_track(&track.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "song");
        assert_eq!(loaded.cloud_path, track.cloud_path);
        assert_eq!(store.list_tracks(&user()).await.unwrap().len(), 1);

        store.update_duration(&track.id, 200).await.unwrap();
        assert!(store.commit_pending_key(&track.id, 1).await.is_err());

        store
            .stage_pending_key(&track.id, &WrappedFileKey::new("wrapped-1"))
            .await
            .unwrap();
        store.commit_pending_key(&track.id, 1).await.unwrap();

        store
            .stage_pending_key(&track.id, &WrappedFileKey::new("wrapped-stale"))
            .await
            .unwrap();
        store.discard_pending_key(&track.id).await.unwrap();

        let loaded = store.get_track(&track.id).await.unwrap().unwrap();
        assert_eq!(loaded.duration_secs, Some(200));
        assert_eq!(loaded.wrapped_key.as_str(), "wrapped-1");
        assert_eq!(loaded.key_generation, 1);
        assert!(loaded.pending_key.is_none());
    }

    #[tokio::test]
    async fn test_missing_track() {
        let store = LocalStore::in_memory().unwrap();
        let id = TrackId::new("missing").unwrap();
        assert!(store.get_track(&id).await.unwrap().is_none());
        assert!(matches!(
            store.update_duration(&id, 1).await,
            Err(Error::NotFound(_))
        ));
    }
}
