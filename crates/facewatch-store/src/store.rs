use chrono::{DateTime, SecondsFormat, Utc};
use facewatch_core::{Embedding, EmbeddingError, IdentityRecord};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS identities (
        identity_id  TEXT PRIMARY KEY,
        display_name TEXT UNIQUE NOT NULL,
        embedding    BLOB NOT NULL,
        enrolled_at  TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS recognition_events (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        display_name TEXT NOT NULL,
        identity_id  TEXT,
        matched      INTEGER NOT NULL,
        recorded_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_recorded_at ON recognition_events (recorded_at);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt embedding for {identity_id}: {source}")]
    CorruptEmbedding {
        identity_id: String,
        source: EmbeddingError,
    },
    #[error("corrupt timestamp {0:?}")]
    CorruptTimestamp(String),
    #[error("store connection poisoned by a panicked writer")]
    Poisoned,
}

/// One row of the append-only recognition log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionEvent {
    pub id: i64,
    pub display_name: String,
    pub identity_id: Option<String>,
    pub matched: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Destination for recognition events written by the logging worker.
pub trait EventSink: Send + Sync {
    fn append_event(
        &self,
        display_name: &str,
        identity_id: Option<&str>,
        matched: bool,
    ) -> Result<(), StoreError>;
}

/// Source of the enrolled gallery, read once per session start.
pub trait GallerySource: Send + Sync {
    fn load_all(&self) -> Result<Vec<IdentityRecord>, StoreError>;
}

/// SQLite-backed identity gallery and recognition log.
pub struct FaceStore {
    conn: Mutex<Connection>,
}

impl FaceStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened face store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert a new identity. Returns `false` if the id or display name is taken.
    pub fn add(&self, record: &IdentityRecord) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO identities (identity_id, display_name, embedding, enrolled_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.identity_id,
                record.display_name,
                record.embedding.to_bytes(),
                format_timestamp(&record.enrolled_at),
            ],
        );

        match result {
            Ok(_) => {
                tracing::info!(id = %record.identity_id, name = %record.display_name, "identity enrolled");
                Ok(true)
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                tracing::warn!(name = %record.display_name, "identity already enrolled");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an identity. Returns `false` if no such id exists.
    pub fn delete(&self, identity_id: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM identities WHERE identity_id = ?1", params![identity_id])?;
        if removed > 0 {
            tracing::info!(id = identity_id, "identity removed");
        }
        Ok(removed > 0)
    }

    pub fn find_by_name(&self, display_name: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT identity_id, display_name, embedding, enrolled_at
                 FROM identities WHERE display_name = ?1",
                params![display_name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        row.map(decode_identity).transpose()
    }

    /// All enrolled identities, oldest enrollment first.
    pub fn load_all(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT identity_id, display_name, embedding, enrolled_at
             FROM identities ORDER BY enrolled_at, display_name",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(decode_identity(row?)?);
        }
        Ok(records)
    }

    pub fn append_event(
        &self,
        display_name: &str,
        identity_id: Option<&str>,
        matched: bool,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO recognition_events (display_name, identity_id, matched, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![display_name, identity_id, matched, format_timestamp(&Utc::now())],
        )?;
        Ok(())
    }

    /// Most recent events first.
    pub fn query_events(&self, limit: usize) -> Result<Vec<RecognitionEvent>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, display_name, identity_id, matched, recorded_at
             FROM recognition_events ORDER BY recorded_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, display_name, identity_id, matched, recorded_at) = row?;
            events.push(RecognitionEvent {
                id,
                display_name,
                identity_id,
                matched,
                recorded_at: parse_timestamp(&recorded_at)?,
            });
        }
        Ok(events)
    }

    /// Number of enrolled identities.
    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl EventSink for FaceStore {
    fn append_event(
        &self,
        display_name: &str,
        identity_id: Option<&str>,
        matched: bool,
    ) -> Result<(), StoreError> {
        FaceStore::append_event(self, display_name, identity_id, matched)
    }
}

impl GallerySource for FaceStore {
    fn load_all(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        FaceStore::load_all(self)
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::CorruptTimestamp(raw.to_string()))
}

fn decode_identity(
    (identity_id, display_name, blob, enrolled_at): (String, String, Vec<u8>, String),
) -> Result<IdentityRecord, StoreError> {
    let embedding = Embedding::from_bytes(&blob).map_err(|source| StoreError::CorruptEmbedding {
        identity_id: identity_id.clone(),
        source,
    })?;
    Ok(IdentityRecord {
        identity_id,
        display_name,
        embedding,
        enrolled_at: parse_timestamp(&enrolled_at)?,
    })
}
