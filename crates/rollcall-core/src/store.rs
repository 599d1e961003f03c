//! Blob stores backing the attendance database.
//!
//! Every save overwrites the whole blob. There is no optimistic-concurrency
//! check: with two writers the last save wins.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Key under which the attendance snapshot is stored.
pub const SNAPSHOT_KEY: &str = "biometric_attendance_data";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Opaque persistence medium for a single blob.
pub trait BlobStore: Send {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError>;
    fn save(&mut self, blob: &[u8]) -> Result<(), StoreError>;
}

/// In-memory store. Clones share the same blob.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blob: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents, for inspection.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.blob.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl BlobStore for MemoryStore {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.contents())
    }

    fn save(&mut self, blob: &[u8]) -> Result<(), StoreError> {
        *self.blob.lock().unwrap_or_else(PoisonError::into_inner) = Some(blob.to_vec());
        Ok(())
    }
}

/// SQLite-backed store: one row per key in a `blobs` table.
pub struct SqliteStore {
    conn: Connection,
    key: String,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "opened sqlite blob store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Use a different row key (default [`SNAPSHOT_KEY`]).
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blobs (
                key        TEXT PRIMARY KEY,
                data       BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn,
            key: SNAPSHOT_KEY.to_string(),
        })
    }
}

impl BlobStore for SqliteStore {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let blob = self
            .conn
            .query_row(
                "SELECT data FROM blobs WHERE key = ?1",
                params![self.key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(blob)
    }

    fn save(&mut self, blob: &[u8]) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO blobs (key, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![self.key, blob, chrono::Utc::now().to_rfc3339()],
        )?;
        tracing::trace!(key = %self.key, bytes = blob.len(), "snapshot saved");
        Ok(())
    }
}
