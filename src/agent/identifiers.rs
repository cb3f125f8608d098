//! Worker identity within the research tree.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role a worker plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerKind {
    /// Root worker; owns the research goal.
    Coordinator,
    /// Works on a sub-goal delegated by the coordinator.
    SubCoordinator,
    /// Reads pages and follows their links.
    LinkFollower,
}

impl WorkerKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::SubCoordinator => "sub-coordinator",
            Self::LinkFollower => "link-follower",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a worker is and who started it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentifiers {
    /// Role.
    pub worker_type: WorkerKind,
    /// Unique id of this worker instance.
    pub worker_instance_id: Uuid,
    /// Instance id of the parent; `None` for the root.
    pub parent_instance_id: Option<Uuid>,
}

impl WorkerIdentifiers {
    /// Identifiers for a root worker.
    #[must_use]
    pub const fn root(worker_type: WorkerKind, worker_instance_id: Uuid) -> Self {
        Self {
            worker_type,
            worker_instance_id,
            parent_instance_id: None,
        }
    }

    /// Fresh identifiers for a child of this worker.
    #[must_use]
    pub fn child(&self, worker_type: WorkerKind) -> Self {
        Self {
            worker_type,
            worker_instance_id: Uuid::new_v4(),
            parent_instance_id: Some(self.worker_instance_id),
        }
    }
}

impl fmt::Display for WorkerIdentifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.worker_type, self.worker_instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_links_to_parent() {
        let root = WorkerIdentifiers::root(WorkerKind::Coordinator, Uuid::new_v4());
        let child = root.child(WorkerKind::LinkFollower);
        assert_eq!(child.parent_instance_id, Some(root.worker_instance_id));
        assert_ne!(child.worker_instance_id, root.worker_instance_id);
        assert_eq!(child.worker_type, WorkerKind::LinkFollower);
    }

    #[test]
    fn test_kind_serde_names() {
        let json = serde_json::to_string(&WorkerKind::SubCoordinator).unwrap_or_default();
        assert_eq!(json, "\"sub-coordinator\"");
        assert_eq!(WorkerKind::LinkFollower.to_string(), "link-follower");
    }
}
