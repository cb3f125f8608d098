//! Top-level research runs.
//!
//! A run seeds the root coordinator with the entities the graph already
//! holds, drives it to completion, turns the surviving summaries into
//! structured proposals and optionally writes them back to the graph.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::context::ResearchEnv;
use super::entity::{Claim, EntitySummary, LocalEntityId, ProposedEntity};
use super::extraction::propose_entity;
use super::identifiers::{WorkerIdentifiers, WorkerKind};
use super::state::{CoordinatorState, WorkerStatus};
use super::tree::StopSignal;
use super::worker::{WorkerSnapshot, run_worker};
use crate::cache::TtlCache;
use crate::error::AgentError;
use crate::llm::Usage;
use crate::services::{EntityQuery, GraphStore, RetryingGraphStore, StoredEntity};

/// Committed entities read from the graph per run.
pub const SEED_ENTITY_LIMIT: usize = 200;

/// A research request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchGoal {
    /// Run id; also the root coordinator's instance id.
    pub execution_id: Uuid,
    /// What to find out.
    pub goal: String,
}

impl ResearchGoal {
    /// A new run for `goal`.
    #[must_use]
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            goal: goal.into(),
        }
    }

    /// Reuses `execution_id`, resuming its checkpoints if any exist.
    #[must_use]
    pub const fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = execution_id;
        self
    }
}

/// Result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchOutcome {
    /// Run id.
    pub execution_id: Uuid,
    /// How the root coordinator ended.
    pub status: WorkerStatus,
    /// Structured entities proposed from the findings.
    pub proposals: Vec<ProposedEntity>,
    /// Entities found, including the committed ones the run started with.
    pub summaries: Vec<EntitySummary>,
    /// Claims found.
    pub claims: Vec<Claim>,
    /// Tokens spent by every agent in the run.
    pub usage: Usage,
    /// Workers started, including the root.
    pub workers_started: usize,
    /// Wall-clock duration.
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    /// Proposals written to the graph.
    pub persisted: usize,
    /// Why the root finished.
    pub note: Option<String>,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Runs research goals against one environment.
pub struct ResearchRunner {
    env: ResearchEnv,
    graph: Option<Arc<dyn GraphStore>>,
    seeds: TtlCache<Uuid, Arc<Vec<StoredEntity>>>,
    stop: StopSignal,
}

impl std::fmt::Debug for ResearchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResearchRunner")
            .field("env", &self.env)
            .field("graph", &self.graph.is_some())
            .field("seeds", &self.seeds.len())
            .finish_non_exhaustive()
    }
}

impl ResearchRunner {
    /// A runner without a graph store.
    #[must_use]
    pub fn new(env: ResearchEnv) -> Self {
        let seeds = TtlCache::new(env.config.cache_capacity, env.config.cache_ttl);
        Self {
            env,
            graph: None,
            seeds,
            stop: StopSignal::never(),
        }
    }

    /// Reads committed entities from `graph` and, when enabled, writes
    /// proposals back through a retrying client.
    #[must_use]
    pub fn with_graph(mut self, graph: Arc<dyn GraphStore>) -> Self {
        self.graph = Some(Arc::new(RetryingGraphStore::new(graph)));
        self
    }

    /// Stops the root coordinator gracefully when `stop` fires.
    #[must_use]
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// The environment runs use.
    #[must_use]
    pub const fn env(&self) -> &ResearchEnv {
        &self.env
    }

    /// Runs `goal` to completion.
    ///
    /// A root checkpoint for the goal's execution id is resumed instead of
    /// starting over.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidGoal`] for an empty goal or a run without
    /// entity types, [`AgentError::Service`] if the graph cannot be read,
    /// [`AgentError::Storage`] if the root checkpoint cannot be loaded, and
    /// [`AgentError::Cancelled`] if `cancel` fires.
    #[instrument(skip(self, cancel), fields(execution_id = %goal.execution_id))]
    pub async fn run(
        &self,
        goal: &ResearchGoal,
        cancel: &CancellationToken,
    ) -> Result<ResearchOutcome, AgentError> {
        let started = Instant::now();
        if goal.goal.trim().is_empty() {
            return Err(AgentError::InvalidGoal {
                message: "the research goal is empty".to_string(),
            });
        }
        if self.env.entity_types.is_empty() {
            return Err(AgentError::InvalidGoal {
                message: "at least one entity type is required".to_string(),
            });
        }

        let seeds = self.committed_entities(goal.execution_id).await?;
        let committed: HashSet<LocalEntityId> = seeds.iter().map(|e| e.entity_id).collect();
        let snapshot = self.root_snapshot(goal, &seeds)?;
        info!(goal = %goal.goal, committed = committed.len(), "starting research");

        let outcome = run_worker(
            self.env.clone(),
            snapshot,
            self.stop.clone(),
            cancel.child_token(),
        )
        .await;
        if outcome.status == WorkerStatus::Cancelled || cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let mut usage = outcome.usage;
        let proposals = self
            .propose(&outcome.summaries, &outcome.claims, cancel, &mut usage)
            .await?;
        let persisted = self.persist(&proposals, &committed).await;

        let elapsed = started.elapsed();
        info!(
            status = %outcome.status,
            entities = outcome.summaries.len(),
            claims = outcome.claims.len(),
            proposals = proposals.len(),
            persisted,
            tokens = usage.total_tokens,
            ?elapsed,
            "research finished"
        );
        Ok(ResearchOutcome {
            execution_id: goal.execution_id,
            status: outcome.status,
            proposals,
            summaries: outcome.summaries,
            claims: outcome.claims,
            usage,
            workers_started: outcome.workers_started,
            elapsed,
            persisted,
            note: outcome.note,
        })
    }

    async fn committed_entities(
        &self,
        execution_id: Uuid,
    ) -> Result<Arc<Vec<StoredEntity>>, AgentError> {
        if let Some(seeds) = self.seeds.get(&execution_id) {
            return Ok(seeds);
        }
        let Some(graph) = &self.graph else {
            return Ok(Arc::new(Vec::new()));
        };
        let query = EntityQuery {
            entity_type_ids: self
                .env
                .entity_types
                .iter()
                .map(|t| t.entity_type_id.clone())
                .collect(),
            text: None,
            limit: SEED_ENTITY_LIMIT,
        };
        let seeds = Arc::new(graph.query_entities(&query).await?);
        debug!(count = seeds.len(), "seeded committed entities");
        self.seeds.insert(execution_id, Arc::clone(&seeds));
        Ok(seeds)
    }

    fn root_snapshot(
        &self,
        goal: &ResearchGoal,
        seeds: &[StoredEntity],
    ) -> Result<WorkerSnapshot, AgentError> {
        if let Some(store) = &self.env.snapshots
            && let Some(saved) = store.load(goal.execution_id)?
        {
            info!(phase = %saved.phase, iteration = saved.iteration, "resuming from checkpoint");
            return Ok(saved);
        }
        let mut state = CoordinatorState::new(goal.goal.clone());
        state.add_summaries(seeds.iter().map(|e| EntitySummary {
            local_id: e.entity_id,
            name: e.name.clone(),
            summary: e.summary.clone(),
            entity_type_id: e.entity_type_id.clone(),
        }));
        state.committed_entity_ids = seeds.iter().map(|e| e.entity_id).collect();
        Ok(WorkerSnapshot::new(
            goal.execution_id,
            WorkerIdentifiers::root(WorkerKind::Coordinator, goal.execution_id),
            state,
        ))
    }

    /// Proposes every summary that has at least one claim about it.
    async fn propose(
        &self,
        summaries: &[EntitySummary],
        claims: &[Claim],
        cancel: &CancellationToken,
        usage: &mut Usage,
    ) -> Result<Vec<ProposedEntity>, AgentError> {
        let jobs = summaries.iter().filter_map(|summary| {
            let about: Vec<&Claim> = claims
                .iter()
                .filter(|c| c.subject_entity_local_id == summary.local_id)
                .collect();
            (!about.is_empty()).then(|| self.propose_one(summary, about, cancel))
        });
        let mut proposals = Vec::new();
        for (result, spent) in join_all(jobs).await {
            *usage += spent;
            match result {
                Ok(proposal) => proposals.push(proposal),
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(err) => warn!(error = %err, "entity proposal failed, skipping"),
            }
        }
        Ok(proposals)
    }

    async fn propose_one(
        &self,
        summary: &EntitySummary,
        claims: Vec<&Claim>,
        cancel: &CancellationToken,
    ) -> (Result<ProposedEntity, AgentError>, Usage) {
        let mut usage = Usage::default();
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return (Err(AgentError::Cancelled), usage),
            permit = self.env.limiter.acquire() => permit,
        };
        let Ok(_permit) = permit else {
            return (Err(AgentError::Cancelled), usage);
        };
        let result = propose_entity(&self.env, summary, &claims, cancel, &mut usage).await;
        (result, usage)
    }

    /// Creates new entities and patches committed ones; returns how many
    /// writes succeeded.
    async fn persist(
        &self,
        proposals: &[ProposedEntity],
        committed: &HashSet<LocalEntityId>,
    ) -> usize {
        if !self.env.config.persist_to_graph {
            return 0;
        }
        let Some(graph) = &self.graph else {
            warn!("persistence is enabled but no graph store is configured");
            return 0;
        };
        let mut persisted = 0;
        for proposal in proposals {
            let result = if committed.contains(&proposal.local_entity_id) {
                graph
                    .patch_entity(proposal.local_entity_id, &proposal.properties)
                    .await
            } else {
                graph.create_entity(proposal).await
            };
            match result {
                Ok(stored) => {
                    debug!(entity = %stored.entity_id, name = %stored.name, "persisted entity");
                    persisted += 1;
                }
                Err(err) => warn!(name = %proposal.name, error = %err, "failed to persist entity"),
            }
        }
        persisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools;
    use crate::llm::ProviderKind;
    use crate::services::InMemoryGraphStore;
    use crate::testing::{
        ScriptedProvider, ScriptedReply, StaticWeb, company_type, extraction_reply, offers,
        research_env, scripted_config,
    };
    use serde_json::{Map, json};

    const PAGE: &str = "https://acme.example/about";

    /// Coordinator sends one link-follower to the page, then completes.
    fn provider() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new(ProviderKind::OpenAi).respond_with(|request| {
            if let Some(reply) = extraction_reply(request, "Acme Corp") {
                return reply;
            }
            if request.tools.len() == 1 {
                return ScriptedReply::tool_call(tools::UPDATE_PLAN, json!({"plan": "read"}));
            }
            let read_already = request.messages.iter().any(|m| format!("{m:?}").contains(PAGE));
            if offers(request, tools::START_RESEARCH_TASKS) && !read_already {
                ScriptedReply::tool_call(
                    tools::INFER_CLAIMS_FROM_RESOURCES,
                    json!({
                        "resources": [{"url": PAGE, "goal": "company facts"}],
                        "explanation": "the company page"
                    }),
                )
            } else {
                ScriptedReply::tool_call(tools::COMPLETE, json!({"explanation": "done"}))
            }
        }))
    }

    fn web() -> Arc<StaticWeb> {
        Arc::new(StaticWeb::new().with_page(PAGE, "About", "Acme Corp makes rockets.", &[]))
    }

    #[tokio::test]
    async fn test_run_proposes_and_persists() {
        let config = scripted_config()
            .persist_to_graph(true)
            .build()
            .unwrap_or_else(|_| unreachable!());
        let graph = Arc::new(InMemoryGraphStore::new());
        let runner = ResearchRunner::new(research_env(&provider(), &web(), config))
            .with_graph(graph.clone());
        let outcome = runner
            .run(&ResearchGoal::new("rocket companies"), &CancellationToken::new())
            .await
            .unwrap_or_else(|_| unreachable!());

        assert_eq!(outcome.status, WorkerStatus::Completed);
        assert_eq!(outcome.workers_started, 2);
        assert_eq!(outcome.summaries.len(), 1);
        assert_eq!(outcome.proposals.len(), 1);
        assert_eq!(outcome.proposals[0].properties["name"], json!("Acme Corp"));
        assert_eq!(outcome.persisted, 1);
        assert_eq!(graph.entities().len(), 1);
    }

    #[tokio::test]
    async fn test_committed_entities_seed_the_root() {
        let committed = StoredEntity {
            entity_id: LocalEntityId::new(),
            entity_type_id: company_type().entity_type_id,
            name: "Globex".to_string(),
            summary: "A conglomerate.".to_string(),
            properties: Map::new(),
        };
        let graph = Arc::new(InMemoryGraphStore::with_entities([committed.clone()]));
        let runner = ResearchRunner::new(research_env(
            &provider(),
            &web(),
            scripted_config().build().unwrap_or_else(|_| unreachable!()),
        ))
        .with_graph(graph);
        let outcome = runner
            .run(&ResearchGoal::new("rocket companies"), &CancellationToken::new())
            .await
            .unwrap_or_else(|_| unreachable!());

        assert!(outcome.summaries.iter().any(|s| s.local_id == committed.entity_id));
        assert_eq!(outcome.persisted, 0);
    }

    #[tokio::test]
    async fn test_empty_goal_is_rejected() {
        let runner = ResearchRunner::new(research_env(
            &provider(),
            &web(),
            scripted_config().build().unwrap_or_else(|_| unreachable!()),
        ));
        let err = runner
            .run(&ResearchGoal::new("  "), &CancellationToken::new())
            .await;
        assert!(matches!(err, Err(AgentError::InvalidGoal { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_run_returns_error() {
        let runner = ResearchRunner::new(research_env(
            &provider(),
            &web(),
            scripted_config().build().unwrap_or_else(|_| unreachable!()),
        ));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner.run(&ResearchGoal::new("rockets"), &cancel).await;
        assert!(matches!(err, Err(AgentError::Cancelled)));
    }
}
