//! warden-store — SQLite-backed storage for identities and access logs.
//!
//! The daemon treats this crate as its storage collaborator: identity
//! profiles grouped into libraries, their embeddings once computed, and
//! the append-only access log the retention sweep trims.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("identity not found: {0}")]
    IdentityNotFound(Uuid),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS libraries (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS identities (
    id          TEXT PRIMARY KEY,
    library_id  INTEGER NOT NULL REFERENCES libraries(id),
    name        TEXT NOT NULL,
    image       BLOB NOT NULL,
    embedding   TEXT,
    active      INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS access_log (
    id          INTEGER PRIMARY KEY,
    identity_id TEXT REFERENCES identities(id) ON DELETE SET NULL,
    timestamp   TEXT NOT NULL,
    matched     INTEGER NOT NULL,
    message     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_access_log_timestamp ON access_log(timestamp);
";

/// An identity profile row, without image or embedding payloads.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityRecord {
    pub id: Uuid,
    pub library: String,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// One active identity as loaded into the known-face cache.
#[derive(Debug, Clone)]
pub struct ActiveFaceRow {
    pub id: Uuid,
    pub name: String,
    /// Embedding as stored (JSON float array), parsed by the cache.
    pub embedding_json: String,
}

/// One recognition event.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogRecord {
    pub id: i64,
    pub identity_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub matched: bool,
    pub message: String,
}

/// Handle to the SQLite database. Cheap to clone; all calls run on the
/// connection's dedicated thread.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (and migrate) the database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory database, for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Create an identity profile in the named library (created on first
    /// use). The identity starts inactive with no embedding; the caller
    /// enqueues the embedding computation after this commit returns.
    pub async fn create_identity(
        &self,
        library: &str,
        name: &str,
        image: Vec<u8>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let library = library.to_string();
        let name = name.to_string();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR IGNORE INTO libraries (name, created_at) VALUES (?1, ?2)",
                    rusqlite::params![library, now],
                )?;
                let library_id: i64 = tx.query_row(
                    "SELECT id FROM libraries WHERE name = ?1",
                    rusqlite::params![library],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO identities (id, library_id, name, image, active, created_at)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                    rusqlite::params![id.to_string(), library_id, name, image, now],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Fetch an identity's display name and source image for embedding
    /// computation. `None` when the row vanished (race with deletion).
    pub async fn identity_source(&self, id: Uuid) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        let row = self
            .conn
            .call(move |conn| {
                use rusqlite::OptionalExtension;
                let row = conn
                    .query_row(
                        "SELECT name, image FROM identities WHERE id = ?1",
                        rusqlite::params![id.to_string()],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row)
    }

    /// Persist a computed embedding and mark the identity active.
    ///
    /// Safe to re-run on an already-active identity: the embedding is
    /// simply overwritten (at-least-once job delivery).
    pub async fn store_embedding(&self, id: Uuid, embedding_json: String) -> Result<(), StoreError> {
        let updated = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE identities SET embedding = ?1, active = 1 WHERE id = ?2",
                    rusqlite::params![embedding_json, id.to_string()],
                )?;
                Ok(n)
            })
            .await?;

        if updated == 0 {
            return Err(StoreError::IdentityNotFound(id));
        }
        Ok(())
    }

    /// All active identities with their stored embeddings, in insertion
    /// order. This is the source query for a cache reload.
    pub async fn active_faces(&self) -> Result<Vec<ActiveFaceRow>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, embedding FROM identities
                     WHERE active = 1 AND embedding IS NOT NULL
                     ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, name, embedding_json)| match Uuid::parse_str(&id) {
                Ok(id) => Some(ActiveFaceRow { id, name, embedding_json }),
                Err(err) => {
                    tracing::warn!(id, error = %err, "skipping identity with malformed id");
                    None
                }
            })
            .collect())
    }

    /// List all identity profiles with their library names.
    pub async fn list_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT i.id, l.name, i.name, i.active, i.created_at
                     FROM identities i JOIN libraries l ON l.id = i.library_id
                     ORDER BY i.created_at, i.id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, bool>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, library, name, active, created_at)| {
                let id = Uuid::parse_str(&id).ok()?;
                let created_at = DateTime::parse_from_rfc3339(&created_at).ok()?.with_timezone(&Utc);
                Some(IdentityRecord { id, library, name, active, created_at })
            })
            .collect())
    }

    /// Append one recognition event to the access log.
    pub async fn append_log(
        &self,
        identity_id: Option<Uuid>,
        matched: bool,
        message: &str,
    ) -> Result<(), StoreError> {
        self.append_log_at(Utc::now(), identity_id, matched, message).await
    }

    async fn append_log_at(
        &self,
        timestamp: DateTime<Utc>,
        identity_id: Option<Uuid>,
        matched: bool,
        message: &str,
    ) -> Result<(), StoreError> {
        let message = message.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO access_log (identity_id, timestamp, matched, message)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        identity_id.map(|id| id.to_string()),
                        timestamp.to_rfc3339(),
                        matched,
                        message
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Most recent access log entries, newest first.
    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<AccessLogRecord>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity_id, timestamp, matched, message
                     FROM access_log ORDER BY timestamp DESC, id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![limit as i64], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, bool>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, identity_id, timestamp, matched, message)| {
                let timestamp = DateTime::parse_from_rfc3339(&timestamp).ok()?.with_timezone(&Utc);
                Some(AccessLogRecord {
                    id,
                    identity_id: identity_id.and_then(|s| Uuid::parse_str(&s).ok()),
                    timestamp,
                    matched,
                    message,
                })
            })
            .collect())
    }

    /// Delete access log entries older than `cutoff`; returns the number
    /// of rows removed. Running twice in succession deletes nothing extra.
    pub async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let deleted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM access_log WHERE timestamp < ?1",
                    rusqlite::params![cutoff.to_rfc3339()],
                )?;
                Ok(n)
            })
            .await?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_create_identity_starts_inactive() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store.create_identity("staff", "Alice", vec![1, 2, 3]).await.unwrap();

        let identities = store.list_identities().await.unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].id, id);
        assert_eq!(identities[0].library, "staff");
        assert!(!identities[0].active);

        // Inactive identities never reach the cache query.
        assert!(store.active_faces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_embedding_activates() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store.create_identity("staff", "Alice", vec![0]).await.unwrap();

        let embedding = serde_json::to_string(&vec![0.5f32; 4]).unwrap();
        store.store_embedding(id, embedding.clone()).await.unwrap();

        let faces = store.active_faces().await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].id, id);
        assert_eq!(faces[0].name, "Alice");
        assert_eq!(faces[0].embedding_json, embedding);

        // Re-running is a safe overwrite, not an error.
        store.store_embedding(id, embedding).await.unwrap();
        assert_eq!(store.active_faces().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_embedding_missing_identity() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store
            .store_embedding(Uuid::new_v4(), "[]".into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IdentityNotFound(_)));
    }

    #[tokio::test]
    async fn test_identity_source_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store.create_identity("staff", "Bob", vec![9, 9]).await.unwrap();

        let (name, image) = store.identity_source(id).await.unwrap().unwrap();
        assert_eq!(name, "Bob");
        assert_eq!(image, vec![9, 9]);

        assert!(store.identity_source(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_libraries_are_reused() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_identity("staff", "Alice", vec![0]).await.unwrap();
        store.create_identity("staff", "Bob", vec![0]).await.unwrap();
        store.create_identity("visitors", "Carol", vec![0]).await.unwrap();

        let identities = store.list_identities().await.unwrap();
        assert_eq!(identities.len(), 3);
        let staff = identities.iter().filter(|i| i.library == "staff").count();
        assert_eq!(staff, 2);
    }

    #[tokio::test]
    async fn test_active_faces_snapshot_order_is_stable() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.create_identity("staff", "Alice", vec![0]).await.unwrap();
        let b = store.create_identity("staff", "Bob", vec![0]).await.unwrap();
        store.store_embedding(b, "[1.0]".into()).await.unwrap();
        store.store_embedding(a, "[2.0]".into()).await.unwrap();

        // Order follows creation, not activation.
        let faces = store.active_faces().await.unwrap();
        assert_eq!(faces[0].name, "Alice");
        assert_eq!(faces[1].name, "Bob");
    }

    #[tokio::test]
    async fn test_append_and_read_logs() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store.create_identity("staff", "Alice", vec![0]).await.unwrap();

        store.append_log(Some(id), true, "Recognition successful for Alice").await.unwrap();
        store.append_log(None, false, "New Stranger detected").await.unwrap();

        let logs = store.recent_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        // Newest first.
        assert!(!logs[0].matched);
        assert_eq!(logs[0].identity_id, None);
        assert!(logs[1].matched);
        assert_eq!(logs[1].identity_id, Some(id));
    }

    #[tokio::test]
    async fn test_retention_deletes_only_expired() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();

        for days in [3, 8, 10] {
            store
                .append_log_at(now - Duration::days(days), None, false, "old")
                .await
                .unwrap();
        }

        let cutoff = now - Duration::days(7);
        let deleted = store.purge_logs_before(cutoff).await.unwrap();
        assert_eq!(deleted, 2);

        let remaining = store.recent_logs(10).await.unwrap();
        assert_eq!(remaining.len(), 1);

        // Idempotent: a second sweep deletes nothing.
        assert_eq!(store.purge_logs_before(cutoff).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.db");
        let store = Store::open(&path).await.unwrap();
        let id = store.create_identity("staff", "Alice", vec![0]).await.unwrap();
        drop(store);

        let reopened = Store::open(&path).await.unwrap();
        let identities = reopened.list_identities().await.unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].id, id);
    }
}
