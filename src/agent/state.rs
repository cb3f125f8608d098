//! Worker lifecycle and the state each worker owns.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::entity::{Claim, EntitySummary, LocalEntityId};
use crate::error::AgentError;

/// Lifecycle phase of a worker.
///
/// ```text
/// Created → Planning → RequestingActions ⇄ ExecutingTools → Completed
///                              │                 │
///                              └─ StopRequested ─┘ → Terminated
/// (any non-terminal phase) → Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerPhase {
    /// Constructed, nothing sent yet.
    Created,
    /// Producing the initial plan.
    Planning,
    /// Asking the model for the next actions.
    RequestingActions,
    /// Running the requested tool calls.
    ExecutingTools,
    /// A stop arrived; draining calls already started.
    StopRequested,
    /// Finished normally.
    Completed,
    /// Stopped, gave up, failed or was cancelled.
    Terminated,
}

impl WorkerPhase {
    /// Whether the worker has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use WorkerPhase::{
            Completed, Created, ExecutingTools, Planning, RequestingActions, StopRequested,
            Terminated,
        };
        match (self, next) {
            (Completed | Terminated, _) => false,
            (_, Terminated) => true,
            (Created, Planning | Completed)
            | (Planning, RequestingActions | Completed)
            | (RequestingActions, ExecutingTools | StopRequested | Completed)
            | (ExecutingTools, RequestingActions | StopRequested | Completed) => true,
            _ => false,
        }
    }

    /// Moves to `next`, rejecting illegal transitions.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidTransition`] if `next` is not reachable.
    pub fn transition(&mut self, next: Self) -> Result<(), AgentError> {
        if !self.can_transition_to(next) {
            return Err(AgentError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Planning => "planning",
            Self::RequestingActions => "requesting-actions",
            Self::ExecutingTools => "executing-tools",
            Self::StopRequested => "stop-requested",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How a finished worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerStatus {
    /// Called `complete` or hit its iteration cap.
    Completed,
    /// Stopped by its parent or the operator.
    Stopped,
    /// Called `terminate`.
    Terminated,
    /// An LLM or service failure ended the worker.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl WorkerStatus {
    /// Whether the worker's facts should be kept by its parent.
    #[must_use]
    pub const fn contributes_facts(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Terminated)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A web resource known to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// URL.
    pub url: String,
    /// Title, when known.
    #[serde(default)]
    pub title: String,
    /// Search snippet or the reason the link looked useful.
    #[serde(default)]
    pub summary: String,
}

/// Delegated work a worker is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutstandingTask {
    /// Child worker instance doing the work.
    pub worker_instance_id: Uuid,
    /// What was asked.
    pub goal: String,
}

/// A tool call from an earlier iteration, replayed into later prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousCall {
    /// Iteration the call was made in.
    pub iteration: u32,
    /// Tool name.
    pub tool_name: String,
    /// Validated input.
    pub input: Value,
    /// What the call produced.
    pub result: String,
}

/// State owned by one worker.
///
/// Children receive a copy; nothing here is shared.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CoordinatorState {
    /// What this worker is researching.
    pub goal: String,
    /// Current plan, rewritten by `updatePlan`.
    pub plan: String,
    /// Entities known to this worker.
    pub entity_summaries: Vec<EntitySummary>,
    /// Facts about those entities.
    pub claims: Vec<Claim>,
    /// Children currently running.
    pub outstanding_tasks: Vec<OutstandingTask>,
    /// URLs already read.
    pub resources_visited: BTreeSet<String>,
    /// Candidate URLs not yet read.
    pub resources_not_visited: Vec<Resource>,
    /// Search queries already issued.
    pub web_queries_made: Vec<String>,
    /// Every child worker started.
    pub workers_started: Vec<Uuid>,
    /// Calls made so far.
    pub previous_calls: Vec<PreviousCall>,
    /// Ids of entities that already exist in the graph.
    pub committed_entity_ids: HashSet<LocalEntityId>,
}

impl CoordinatorState {
    /// Fresh state for `goal`.
    #[must_use]
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Self::default()
        }
    }

    /// Copy handed to a child working on `goal`.
    ///
    /// Knowledge (entities, claims, visited pages, committed ids) is
    /// inherited; plan, tasks and call history start empty.
    #[must_use]
    pub fn for_child(&self, goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            entity_summaries: self.entity_summaries.clone(),
            claims: self.claims.clone(),
            resources_visited: self.resources_visited.clone(),
            web_queries_made: self.web_queries_made.clone(),
            committed_entity_ids: self.committed_entity_ids.clone(),
            ..Self::default()
        }
    }

    /// Ids of every known entity.
    #[must_use]
    pub fn known_entity_ids(&self) -> HashSet<LocalEntityId> {
        self.entity_summaries.iter().map(|s| s.local_id).collect()
    }

    /// Adds summaries whose ids are not known yet; returns how many.
    pub fn add_summaries(&mut self, summaries: impl IntoIterator<Item = EntitySummary>) -> usize {
        let mut known = self.known_entity_ids();
        let before = self.entity_summaries.len();
        for summary in summaries {
            if known.insert(summary.local_id) {
                self.entity_summaries.push(summary);
            }
        }
        self.entity_summaries.len() - before
    }

    /// Adds claims whose ids are not known yet; returns how many.
    pub fn add_claims(&mut self, claims: impl IntoIterator<Item = Claim>) -> usize {
        let mut known: HashSet<Uuid> = self.claims.iter().map(|c| c.claim_id).collect();
        let before = self.claims.len();
        for claim in claims {
            if known.insert(claim.claim_id) {
                self.claims.push(claim);
            }
        }
        self.claims.len() - before
    }

    /// Drops claims that reference an unknown entity; returns how many.
    pub fn drop_orphan_claims(&mut self) -> usize {
        let known = self.known_entity_ids();
        let before = self.claims.len();
        self.claims
            .retain(|c| c.entity_ids().all(|id| known.contains(&id)));
        before - self.claims.len()
    }

    /// Records a page as read and removes it from the candidates.
    pub fn mark_visited(&mut self, url: &str) {
        self.resources_visited.insert(url.to_string());
        self.resources_not_visited.retain(|r| r.url != url);
    }

    /// Adds candidate resources that are neither read nor queued.
    pub fn add_candidates(&mut self, resources: impl IntoIterator<Item = Resource>) {
        for resource in resources {
            let queued = self.resources_not_visited.iter().any(|r| r.url == resource.url);
            if !queued && !self.resources_visited.contains(&resource.url) {
                self.resources_not_visited.push(resource);
            }
        }
    }

    /// Claims whose subject is `id`.
    pub fn claims_about(&self, id: LocalEntityId) -> impl Iterator<Item = &Claim> {
        self.claims
            .iter()
            .filter(move |c| c.subject_entity_local_id == id)
    }
}
