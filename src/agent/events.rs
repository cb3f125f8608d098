//! Progress events emitted while research runs.
//!
//! Sending is fire-and-forget over an unbounded channel: it never blocks a
//! worker, and a dropped receiver is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::entity::DuplicateReport;
use super::identifiers::WorkerIdentifiers;
use super::state::WorkerStatus;

/// Something observable that happened in a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProgressEvent {
    /// A worker began.
    WorkerStarted {
        /// Its goal.
        goal: String,
    },
    /// A worker delegated a task to a child.
    StartedTask {
        /// Child instance id.
        task_id: Uuid,
        /// What the child was asked to do.
        goal: String,
    },
    /// A delegated task finished.
    ClosedTask {
        /// Child instance id.
        task_id: Uuid,
        /// How the child ended.
        status: WorkerStatus,
        /// Entities the child returned.
        entity_count: usize,
        /// Claims the child returned.
        claim_count: usize,
    },
    /// A web search ran.
    QueriedWeb {
        /// Query text.
        query: String,
        /// Number of hits.
        hit_count: usize,
    },
    /// A page was read.
    VisitedWebPage {
        /// Page URL.
        url: String,
        /// Page title.
        title: String,
    },
    /// The plan changed.
    UpdatedPlan {
        /// New plan.
        plan: String,
    },
    /// Claims were extracted from a resource.
    InferredClaims {
        /// Source URL.
        url: String,
        /// Entities found.
        entity_count: usize,
        /// Claims accepted.
        claim_count: usize,
    },
    /// Duplicate entities were merged.
    DeduplicatedEntities {
        /// Merges applied.
        duplicates: Vec<DuplicateReport>,
    },
    /// A stop request reached the worker.
    WorkerWasStopped {
        /// Why.
        reason: String,
    },
    /// A worker finished.
    WorkerFinished {
        /// How it ended.
        status: WorkerStatus,
        /// Optional explanation.
        note: Option<String>,
    },
}

/// An event with its origin and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEnvelope {
    /// Unique id of this step.
    pub step_id: Uuid,
    /// Worker that produced it.
    pub worker: WorkerIdentifiers,
    /// When it was recorded.
    pub recorded_at: DateTime<Utc>,
    /// The event.
    pub event: ProgressEvent,
}

/// Sending half of the progress channel.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEnvelope>>,
}

impl ProgressSink {
    /// Creates a connected sink and its receiver.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { tx: None }
    }

    /// Records `event` for `worker`.
    pub fn emit(&self, worker: &WorkerIdentifiers, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressEnvelope {
                step_id: Uuid::new_v4(),
                worker: *worker,
                recorded_at: Utc::now(),
                event,
            });
        }
    }
}
