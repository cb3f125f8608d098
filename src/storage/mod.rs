//! Worker checkpoints.
//!
//! Every worker saves a [`WorkerSnapshot`] between iterations. The root
//! coordinator's snapshot is keyed by the execution id, so an interrupted
//! run can be resumed from its last saved iteration.

#[cfg(feature = "sqlite-checkpoints")]
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::identifiers::WorkerIdentifiers;
use crate::agent::state::{WorkerPhase, WorkerStatus};
use crate::agent::worker::WorkerSnapshot;
use crate::error::StorageError;

#[cfg(feature = "sqlite-checkpoints")]
pub use sqlite::SqliteSnapshotStore;

/// Listing entry for a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    /// Run the worker belongs to.
    pub execution_id: Uuid,
    /// Worker identity.
    pub worker: WorkerIdentifiers,
    /// Phase at the time of the save.
    pub phase: WorkerPhase,
    /// Iterations completed.
    pub iteration: u32,
    /// Final status, once finished.
    pub status: Option<WorkerStatus>,
    /// Save time.
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkerSnapshot> for SnapshotSummary {
    fn from(snapshot: &WorkerSnapshot) -> Self {
        Self {
            execution_id: snapshot.execution_id,
            worker: snapshot.identifiers,
            phase: snapshot.phase,
            iteration: snapshot.iteration,
            status: snapshot.status,
            updated_at: snapshot.updated_at,
        }
    }
}

/// Persists worker snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Inserts or replaces the snapshot for its worker.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the write fails.
    fn save(&self, snapshot: &WorkerSnapshot) -> Result<(), StorageError>;

    /// Latest snapshot of a worker.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails or the record is corrupt.
    fn load(&self, worker_instance_id: Uuid) -> Result<Option<WorkerSnapshot>, StorageError>;

    /// Snapshots of one run, or of every run, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails.
    fn list(&self, execution_id: Option<Uuid>) -> Result<Vec<SnapshotSummary>, StorageError>;

    /// Deletes a run's snapshots; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the delete fails.
    fn clear(&self, execution_id: Uuid) -> Result<usize, StorageError>;
}

/// Process-local snapshot store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<Uuid, WorkerSnapshot>>,
}

impl MemorySnapshotStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, WorkerSnapshot>>, StorageError> {
        self.snapshots
            .lock()
            .map_err(|e| StorageError::Database(format!("lock poisoned: {e}")))
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &WorkerSnapshot) -> Result<(), StorageError> {
        self.lock()?
            .insert(snapshot.identifiers.worker_instance_id, snapshot.clone());
        Ok(())
    }

    fn load(&self, worker_instance_id: Uuid) -> Result<Option<WorkerSnapshot>, StorageError> {
        Ok(self.lock()?.get(&worker_instance_id).cloned())
    }

    fn list(&self, execution_id: Option<Uuid>) -> Result<Vec<SnapshotSummary>, StorageError> {
        let mut summaries: Vec<SnapshotSummary> = self
            .lock()?
            .values()
            .filter(|s| execution_id.is_none_or(|id| s.execution_id == id))
            .map(SnapshotSummary::from)
            .collect();
        summaries.sort_by_key(|s| s.updated_at);
        Ok(summaries)
    }

    fn clear(&self, execution_id: Uuid) -> Result<usize, StorageError> {
        let mut snapshots = self.lock()?;
        let before = snapshots.len();
        snapshots.retain(|_, s| s.execution_id != execution_id);
        Ok(before - snapshots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::identifiers::WorkerKind;
    use crate::agent::state::CoordinatorState;

    #[test]
    fn test_memory_store_scopes_by_execution() {
        let store = MemorySnapshotStore::new();
        let run_a = Uuid::new_v4();
        let root = WorkerSnapshot::new(
            run_a,
            WorkerIdentifiers::root(WorkerKind::Coordinator, run_a),
            CoordinatorState::new("a"),
        );
        let child = WorkerSnapshot::new(
            run_a,
            root.identifiers.child(WorkerKind::LinkFollower),
            CoordinatorState::new("a/1"),
        );
        let run_b = Uuid::new_v4();
        let other = WorkerSnapshot::new(
            run_b,
            WorkerIdentifiers::root(WorkerKind::Coordinator, run_b),
            CoordinatorState::new("b"),
        );
        for s in [&root, &child, &other] {
            store.save(s).unwrap_or_else(|_| unreachable!());
        }

        assert_eq!(store.list(Some(run_a)).unwrap_or_default().len(), 2);
        assert_eq!(store.list(None).unwrap_or_default().len(), 3);
        let loaded = store.load(run_a).unwrap_or_default();
        assert_eq!(loaded.map(|s| s.state.goal), Some("a".to_string()));

        assert_eq!(store.clear(run_a).unwrap_or_default(), 2);
        assert!(store.load(run_a).unwrap_or_default().is_none());
        assert_eq!(store.list(None).unwrap_or_default().len(), 1);
    }
}
