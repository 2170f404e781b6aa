//! Concept map persistence.
//!
//! The tracker saves a [`SessionSnapshot`] after every update and loads it
//! once at session start. Backends are synchronous; async callers go through
//! `tokio::task::spawn_blocking`.

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteConceptStore;

use crate::error::{Result, TutorError};
use crate::knowledge::types::{ConceptMap, PivotEntry};
use crate::session::state::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Everything persisted for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub concept_map: ConceptMap,
    pub history: Vec<Message>,
    pub pivot_queue: Vec<PivotEntry>,
    pub confidence_reached: bool,
    pub saved_at: DateTime<Utc>,
}

/// Save/load contract for session snapshots.
pub trait ConceptStore: Send + Sync {
    /// Load the latest snapshot for `session_id`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`TutorError::Storage`] when the backend cannot be read.
    fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>>;

    /// Persist `snapshot`, replacing any previous one for the same session.
    ///
    /// # Errors
    ///
    /// Returns [`TutorError::Storage`] when the write fails.
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;
}

/// In-process store for tests and storage-disabled runs.
#[derive(Debug, Default)]
pub struct MemoryConceptStore {
    snapshots: Mutex<HashMap<String, SessionSnapshot>>,
}

impl MemoryConceptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConceptStore for MemoryConceptStore {
    fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|e| TutorError::Storage(format!("store lock poisoned: {e}")))?;
        Ok(snapshots.get(session_id).cloned())
    }

    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|e| TutorError::Storage(format!("store lock poisoned: {e}")))?;
        snapshots.insert(snapshot.session_id.clone(), snapshot.clone());
        Ok(())
    }
}
