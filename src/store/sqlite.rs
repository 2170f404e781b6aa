//! SQLite-backed snapshot store at `{root_dir}/mentor.db`.

use super::schema::{apply_schema, read_schema_version};
use super::{ConceptStore, SessionSnapshot};
use crate::error::{Result, TutorError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const DB_FILENAME: &str = "mentor.db";

/// Thread-safe via an internal `Mutex<Connection>`; writes are serialized.
pub struct SqliteConceptStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteConceptStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConceptStore")
            .field("path", &self.path)
            .finish()
    }
}

fn storage_err(e: impl std::fmt::Display) -> TutorError {
    TutorError::Storage(e.to_string())
}

impl SqliteConceptStore {
    /// Open (or create) the database inside `root_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the schema
    /// cannot be applied.
    pub fn open(root_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(root_dir)?;
        let path = root_dir.join(DB_FILENAME);
        let conn = Connection::open(&path).map_err(storage_err)?;
        apply_schema(&conn).map_err(storage_err)?;
        debug!(path = %path.display(), "concept store opened");
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// # Errors
    ///
    /// Returns an error if the version cannot be read.
    pub fn schema_version(&self) -> Result<Option<u32>> {
        let conn = self.lock()?;
        read_schema_version(&conn).map_err(storage_err)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TutorError::Storage(format!("connection lock poisoned: {e}")))
    }
}

impl ConceptStore for SqliteConceptStore {
    fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT concept_map, history, pivot_queue, confidence_reached, saved_at \
                 FROM session_snapshots WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(storage_err)?;

        let Some((map, history, queue, confidence_reached, saved_at)) = row else {
            return Ok(None);
        };
        let saved_at = DateTime::parse_from_rfc3339(&saved_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| storage_err(format!("bad saved_at for {session_id}: {e}")))?;

        Ok(Some(SessionSnapshot {
            session_id: session_id.to_owned(),
            concept_map: serde_json::from_str(&map).map_err(storage_err)?,
            history: serde_json::from_str(&history).map_err(storage_err)?,
            pivot_queue: serde_json::from_str(&queue).map_err(storage_err)?,
            confidence_reached,
            saved_at,
        }))
    }

    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let map = serde_json::to_string(&snapshot.concept_map).map_err(storage_err)?;
        let history = serde_json::to_string(&snapshot.history).map_err(storage_err)?;
        let queue = serde_json::to_string(&snapshot.pivot_queue).map_err(storage_err)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO session_snapshots \
               (session_id, concept_map, history, pivot_queue, confidence_reached, saved_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(session_id) DO UPDATE SET \
               concept_map = excluded.concept_map, \
               history = excluded.history, \
               pivot_queue = excluded.pivot_queue, \
               confidence_reached = excluded.confidence_reached, \
               saved_at = excluded.saved_at",
            params![
                snapshot.session_id,
                map,
                history,
                queue,
                snapshot.confidence_reached,
                snapshot.saved_at.to_rfc3339(),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }
}
