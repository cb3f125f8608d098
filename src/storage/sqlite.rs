//! SQLite-backed snapshot store.
//!
//! One row per worker; the snapshot body is stored as JSON next to the
//! columns needed for listing.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};
use uuid::Uuid;

use super::{SnapshotStore, SnapshotSummary};
use crate::agent::worker::WorkerSnapshot;
use crate::error::StorageError;

/// Schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// Snapshot store persisted in a SQLite file.
#[derive(Debug)]
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Opens or creates the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if the file cannot be opened or
    /// migrated.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Database(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        info!(path = %path.display(), "opened checkpoint database");
        Ok(store)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if migration fails.
    pub fn in_memory() -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Database(format!("lock poisoned: {e}")))
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        if current < 1 {
            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS worker_snapshots (
                    worker_id TEXT PRIMARY KEY,
                    execution_id TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    iteration INTEGER NOT NULL,
                    updated_at TEXT NOT NULL,
                    body TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_worker_snapshots_execution
                    ON worker_snapshots (execution_id, updated_at);
                ",
            )?;
        }
        if current < SCHEMA_VERSION {
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
            debug!(from = current, to = SCHEMA_VERSION, "migrated checkpoint schema");
        }
        Ok(())
    }
}

fn decode(worker_id: &str, body: &str) -> Result<WorkerSnapshot, StorageError> {
    serde_json::from_str(body).map_err(|e| StorageError::CorruptSnapshot {
        worker_id: worker_id.to_string(),
        message: e.to_string(),
    })
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, snapshot: &WorkerSnapshot) -> Result<(), StorageError> {
        let body = serde_json::to_string(snapshot).map_err(|e| StorageError::CorruptSnapshot {
            worker_id: snapshot.identifiers.worker_instance_id.to_string(),
            message: e.to_string(),
        })?;
        self.lock()?.execute(
            r"
            INSERT OR REPLACE INTO worker_snapshots
                (worker_id, execution_id, phase, iteration, updated_at, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                snapshot.identifiers.worker_instance_id.to_string(),
                snapshot.execution_id.to_string(),
                snapshot.phase.to_string(),
                snapshot.iteration,
                snapshot.updated_at.to_rfc3339(),
                body,
            ],
        )?;
        Ok(())
    }

    fn load(&self, worker_instance_id: Uuid) -> Result<Option<WorkerSnapshot>, StorageError> {
        let id = worker_instance_id.to_string();
        let body: Option<String> = self
            .lock()?
            .query_row(
                "SELECT body FROM worker_snapshots WHERE worker_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| decode(&id, &b)).transpose()
    }

    fn list(&self, execution_id: Option<Uuid>) -> Result<Vec<SnapshotSummary>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r"
            SELECT worker_id, body FROM worker_snapshots
            WHERE ?1 IS NULL OR execution_id = ?1
            ORDER BY updated_at, worker_id
            ",
        )?;
        let rows = stmt.query_map(params![execution_id.map(|id| id.to_string())], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut summaries = Vec::new();
        for row in rows {
            let (worker_id, body) = row?;
            summaries.push(SnapshotSummary::from(&decode(&worker_id, &body)?));
        }
        Ok(summaries)
    }

    fn clear(&self, execution_id: Uuid) -> Result<usize, StorageError> {
        let removed = self.lock()?.execute(
            "DELETE FROM worker_snapshots WHERE execution_id = ?1",
            params![execution_id.to_string()],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::identifiers::{WorkerIdentifiers, WorkerKind};
    use crate::agent::state::{CoordinatorState, WorkerPhase};

    fn snapshot(execution_id: Uuid) -> WorkerSnapshot {
        WorkerSnapshot::new(
            execution_id,
            WorkerIdentifiers::root(WorkerKind::Coordinator, execution_id),
            CoordinatorState::new("find rocket companies"),
        )
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let store = SqliteSnapshotStore::in_memory().unwrap_or_else(|_| unreachable!());
        let run = Uuid::new_v4();
        let mut s = snapshot(run);
        store.save(&s).unwrap_or_else(|_| unreachable!());
        s.iteration = 3;
        s.phase = WorkerPhase::RequestingActions;
        store.save(&s).unwrap_or_else(|_| unreachable!());

        let loaded = store.load(run).unwrap_or_default().unwrap_or_else(|| unreachable!());
        assert_eq!(loaded.iteration, 3);
        assert_eq!(loaded.state.goal, "find rocket companies");
        assert_eq!(store.list(Some(run)).unwrap_or_default().len(), 1);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let path = dir.path().join("nested").join("checkpoints.db");
        let run = Uuid::new_v4();
        {
            let store = SqliteSnapshotStore::open(&path).unwrap_or_else(|_| unreachable!());
            store.save(&snapshot(run)).unwrap_or_else(|_| unreachable!());
        }
        let store = SqliteSnapshotStore::open(&path).unwrap_or_else(|_| unreachable!());
        assert!(store.load(run).unwrap_or_default().is_some());
        assert_eq!(store.clear(run).unwrap_or_default(), 1);
        assert!(store.list(None).unwrap_or_default().is_empty());
    }

    #[test]
    fn test_corrupt_body_is_reported() {
        let store = SqliteSnapshotStore::in_memory().unwrap_or_else(|_| unreachable!());
        let id = Uuid::new_v4();
        if let Ok(conn) = store.lock() {
            conn.execute(
                "INSERT INTO worker_snapshots VALUES (?1, ?1, 'created', 0, '2026-01-01T00:00:00Z', 'nope')",
                params![id.to_string()],
            )
            .unwrap_or_default();
        }
        assert!(matches!(
            store.load(id),
            Err(StorageError::CorruptSnapshot { .. })
        ));
    }
}
