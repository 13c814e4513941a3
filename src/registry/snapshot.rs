//! Optional state persistence.
//!
//! A snapshot is the agent table plus the revision counter, written as
//! one JSON blob after every topology change. Restoring a snapshot at
//! startup lets agents survive a registry restart without re-registering;
//! their next heartbeat resynchronizes resolutions in full.
//!
//! Persistence failures never fail a protocol operation. The service
//! logs them and reports degraded durability through the ready probe.

use std::path::PathBuf;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::errors::SnapshotError;
use crate::registry::types::AgentEntry;

/// Durable view of the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub agents: Vec<AgentEntry>,
}

/// Persistence seam for registry state.
pub trait SnapshotStore: Send + Sync {
    /// Persists a snapshot, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] when the backing store is unavailable.
    fn save(&self, snapshot: &StoreSnapshot) -> Result<(), SnapshotError>;

    /// Loads the most recent snapshot, `None` when none was ever saved.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] when the backing store is unavailable or
    /// the stored blob does not decode.
    fn load(&self) -> Result<Option<StoreSnapshot>, SnapshotError>;
}

/// Single-row SQLite snapshot store.
pub struct SqliteSnapshotStore {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl SqliteSnapshotStore {
    /// Opens (creating if needed) the snapshot database.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] when the file or its parent directory
    /// cannot be created.
    pub fn new(db_path: PathBuf) -> Result<Self, SnapshotError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SnapshotError::Storage {
                    message: format!("cannot create {}: {e}", parent.display()),
                })?;
            }
        }
        let store = Self { db_path };
        store.initialize_db()?;
        Ok(store)
    }

    fn initialize_db(&self) -> Result<(), SnapshotError> {
        let conn = self.open()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS registry_snapshots (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                revision INTEGER NOT NULL,
                state TEXT NOT NULL,
                saved_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn open(&self) -> Result<Connection, SnapshotError> {
        Connection::open(&self.db_path).map_err(|e| {
            log::error!(
                "snapshot database {} unavailable: {e}",
                self.db_path.display()
            );
            SnapshotError::from(e)
        })
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, snapshot: &StoreSnapshot) -> Result<(), SnapshotError> {
        let state = serde_json::to_string(snapshot)?;
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO registry_snapshots (id, revision, state, saved_at)
             VALUES (1, ?1, ?2, ?3)",
            params![snapshot.revision as i64, state, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn load(&self) -> Result<Option<StoreSnapshot>, SnapshotError> {
        let conn = self.open()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM registry_snapshots WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match state {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
