//! SQLite DDL for the session snapshot store.

use rusqlite::Connection;

/// Current schema version stamped into `schema_meta`.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- One row per session; the latest save wins.
CREATE TABLE IF NOT EXISTS session_snapshots (
    session_id         TEXT PRIMARY KEY,
    concept_map        TEXT NOT NULL,               -- JSON ConceptMap
    history            TEXT NOT NULL DEFAULT '[]',  -- JSON array of messages
    pivot_queue        TEXT NOT NULL DEFAULT '[]',  -- JSON array of pivot entries
    confidence_reached INTEGER NOT NULL DEFAULT 0,
    saved_at           TEXT NOT NULL                -- RFC 3339
);

CREATE INDEX IF NOT EXISTS idx_snapshots_saved_at ON session_snapshots(saved_at);
"#;

/// Apply the schema and seed the version stamp on a fresh database.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// `None` if the version key is missing or unparsable.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}
