//! The worker loop shared by coordinators, sub-coordinators and
//! link-followers.
//!
//! A worker plans, then repeatedly asks its model for tool calls and runs
//! them concurrently until it completes, terminates, is stopped, fails or
//! hits its iteration cap. Children are spawned into the worker's
//! [`WorkerTree`]; their outcomes are merged back, followed by a dedup pass
//! whenever new entities arrived.
//!
//! # Stop and cancellation
//!
//! A stop request is graceful: calls already started are drained (children
//! are asked to stop too) and whatever they found is kept. Children get
//! `stop_ack_timeout` to acknowledge before their tokens are cancelled.
//! Cancellation is immediate and discards the worker's facts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, ready};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::context::ResearchEnv;
use super::dedup::{DedupAgent, apply_duplicates};
use super::entity::{Claim, EntitySummary};
use super::events::ProgressEvent;
use super::extraction::{infer_claims, infer_entity_summaries};
use super::identifiers::{WorkerIdentifiers, WorkerKind};
use super::prompt::{build_planning_prompt, build_worker_prompt};
use super::state::{
    CoordinatorState, OutstandingTask, PreviousCall, Resource, WorkerPhase, WorkerStatus,
};
use super::tools::{self, CoordinatorAction, LinkRequest};
use super::tree::{StopSignal, WorkerTree};
use crate::error::{AgentError, ServiceError};
use crate::llm::message::user_message;
use crate::llm::{LlmModel, LlmRequest, ToolChoice, ToolUse, Usage};
use crate::services::SearchHit;

/// Hits listed in a search call's result.
const SEARCH_RESULTS_SHOWN: usize = 10;

/// Everything needed to resume a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    /// Run this worker belongs to.
    pub execution_id: Uuid,
    /// Worker identity.
    pub identifiers: WorkerIdentifiers,
    /// Lifecycle phase.
    pub phase: WorkerPhase,
    /// Owned state.
    pub state: CoordinatorState,
    /// Iterations completed.
    pub iteration: u32,
    /// Tokens spent by this worker and its finished children.
    pub usage: Usage,
    /// Workers started below this one, at any depth.
    #[serde(default)]
    pub descendants: usize,
    /// Final status, once finished.
    pub status: Option<WorkerStatus>,
    /// Why the worker finished.
    pub note: Option<String>,
    /// Last save time.
    pub updated_at: DateTime<Utc>,
}

impl WorkerSnapshot {
    /// A worker that has not started yet.
    #[must_use]
    pub fn new(execution_id: Uuid, identifiers: WorkerIdentifiers, state: CoordinatorState) -> Self {
        Self {
            execution_id,
            identifiers,
            phase: WorkerPhase::Created,
            state,
            iteration: 0,
            usage: Usage::default(),
            descendants: 0,
            status: None,
            note: None,
            updated_at: Utc::now(),
        }
    }
}

/// What a finished worker hands back to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutcome {
    /// Worker identity.
    pub identifiers: WorkerIdentifiers,
    /// How it ended.
    pub status: WorkerStatus,
    /// Entities found; empty unless the status contributes facts.
    pub summaries: Vec<EntitySummary>,
    /// Claims found; empty unless the status contributes facts.
    pub claims: Vec<Claim>,
    /// Tokens spent by the worker and its descendants.
    pub usage: Usage,
    /// Iterations completed.
    pub iterations: u32,
    /// Workers in this subtree, including this one.
    pub workers_started: usize,
    /// Why it ended.
    pub note: Option<String>,
}

/// Runs a worker from `snapshot` to a terminal phase.
///
/// Boxed so workers can spawn workers.
#[must_use]
pub fn run_worker(
    env: ResearchEnv,
    snapshot: WorkerSnapshot,
    stop: StopSignal,
    cancel: CancellationToken,
) -> BoxFuture<'static, WorkerOutcome> {
    Box::pin(async move { Worker::new(env, snapshot, stop, cancel).run().await })
}

/// Runs one step of a worker and returns the updated snapshot.
///
/// A step is one phase: planning, or one request-and-execute iteration.
/// Children started during a step finish within it, so the returned snapshot
/// can be persisted and fed back in later to resume. Finished snapshots are
/// returned unchanged.
pub async fn advance(
    env: ResearchEnv,
    snapshot: WorkerSnapshot,
    stop: StopSignal,
    cancel: CancellationToken,
) -> WorkerSnapshot {
    let mut worker = Worker::new(env, snapshot, stop, cancel);
    if worker.snap.phase.is_terminal() {
        return worker.snap;
    }
    let exit = match worker.step().await {
        Ok(None) => return worker.snap,
        Ok(Some(exit)) => exit,
        Err(err) => Exit::from_error(err),
    };
    worker.close(exit).await;
    worker.snap
}

/// How a worker ends.
struct Exit {
    phase: WorkerPhase,
    status: WorkerStatus,
    note: Option<String>,
}

impl Exit {
    const fn completed(note: Option<String>) -> Self {
        Self {
            phase: WorkerPhase::Completed,
            status: WorkerStatus::Completed,
            note,
        }
    }

    fn stopped(reason: String) -> Self {
        Self {
            phase: WorkerPhase::Terminated,
            status: WorkerStatus::Stopped,
            note: Some(reason),
        }
    }

    const fn terminated(note: Option<String>) -> Self {
        Self {
            phase: WorkerPhase::Terminated,
            status: WorkerStatus::Terminated,
            note,
        }
    }

    fn from_error(err: AgentError) -> Self {
        let status = if matches!(err, AgentError::Cancelled) {
            WorkerStatus::Cancelled
        } else {
            warn!(error = %err, "worker failed");
            WorkerStatus::Failed
        };
        Self {
            phase: WorkerPhase::Terminated,
            status,
            note: Some(err.to_string()),
        }
    }
}

/// How an iteration's batch of calls ended.
enum BatchEnd {
    Continue,
    Complete(String),
    Terminate(String),
    Stopped(String),
}

impl BatchEnd {
    fn into_exit(self) -> Exit {
        match self {
            Self::Continue => Exit::completed(None),
            Self::Complete(note) => Exit::completed(Some(note)),
            Self::Terminate(note) => Exit::terminated(Some(note)),
            Self::Stopped(reason) => Exit::stopped(reason),
        }
    }
}

/// One page read by a link-follower.
struct ExploredPage {
    url: String,
    usage: Usage,
    findings: Result<PageFindings, AgentError>,
}

struct PageFindings {
    title: String,
    summaries: Vec<EntitySummary>,
    claims: Vec<Claim>,
    links: Vec<String>,
}

struct ChildResult {
    task_id: Uuid,
    goal: String,
    outcome: Result<WorkerOutcome, JoinError>,
}

/// Result of one tool call, applied to state once the batch drains.
enum Performed {
    Searched {
        query: String,
        hits: Result<Vec<SearchHit>, ServiceError>,
    },
    Children {
        results: Vec<ChildResult>,
        skipped: Vec<String>,
    },
    Pages(Vec<ExploredPage>),
    Answered {
        answer: Option<String>,
    },
    Note(String),
    Rejected(String),
}

struct Worker {
    env: ResearchEnv,
    snap: WorkerSnapshot,
    stop: StopSignal,
    cancel: CancellationToken,
    tree: WorkerTree,
}

impl Worker {
    fn new(
        env: ResearchEnv,
        mut snap: WorkerSnapshot,
        stop: StopSignal,
        cancel: CancellationToken,
    ) -> Self {
        // A checkpoint is only taken between iterations; anything in flight
        // when it was written is re-requested.
        if matches!(
            snap.phase,
            WorkerPhase::ExecutingTools | WorkerPhase::StopRequested
        ) {
            snap.phase = WorkerPhase::RequestingActions;
        }
        snap.state.outstanding_tasks.clear();
        Self {
            env,
            snap,
            stop,
            cancel,
            tree: WorkerTree::new(),
        }
    }

    const fn kind(&self) -> WorkerKind {
        self.snap.identifiers.worker_type
    }

    fn model(&self) -> LlmModel {
        let models = &self.env.config.models;
        match self.kind() {
            WorkerKind::Coordinator => models.coordinator,
            WorkerKind::SubCoordinator => models.sub_coordinator,
            WorkerKind::LinkFollower => models.link_follower,
        }
    }

    fn emit(&self, event: ProgressEvent) {
        self.env.events.emit(&self.snap.identifiers, event);
    }

    fn transition(&mut self, next: WorkerPhase) -> Result<(), AgentError> {
        self.snap.phase.transition(next)
    }

    fn checkpoint(&mut self) {
        let Some(store) = &self.env.snapshots else {
            return;
        };
        self.snap.updated_at = Utc::now();
        if let Err(err) = store.save(&self.snap) {
            warn!(worker = %self.snap.identifiers, error = %err, "failed to save checkpoint");
        }
    }

    #[instrument(skip(self), fields(worker = %self.snap.identifiers, goal = %self.snap.state.goal))]
    async fn run(mut self) -> WorkerOutcome {
        if self.snap.phase.is_terminal() {
            debug!("worker already finished, returning saved outcome");
            return self.outcome();
        }
        let exit = loop {
            match self.step().await {
                Ok(None) => {}
                Ok(Some(exit)) => break exit,
                Err(err) => break Exit::from_error(err),
            }
        };
        self.close(exit).await;
        self.outcome()
    }

    /// Advances one phase: planning, or one request-and-execute iteration.
    ///
    /// Returns the exit once the worker is done.
    async fn step(&mut self) -> Result<Option<Exit>, AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if let Some(reason) = self.stop.requested() {
            return self.acknowledge_stop(reason).map(Some);
        }
        match self.snap.phase {
            WorkerPhase::Created => {
                self.emit(ProgressEvent::WorkerStarted {
                    goal: self.snap.state.goal.clone(),
                });
                self.transition(WorkerPhase::Planning)?;
            }
            WorkerPhase::Planning => match self.plan().await? {
                BatchEnd::Continue => self.transition(WorkerPhase::RequestingActions)?,
                end => return Ok(Some(end.into_exit())),
            },
            WorkerPhase::RequestingActions => {
                let cap = self.env.config.iteration_cap(self.kind());
                if self.snap.iteration >= cap {
                    info!(cap, "iteration cap reached");
                    return Ok(Some(Exit::completed(Some(format!(
                        "reached the iteration cap of {cap}"
                    )))));
                }
                let mut stop = self.stop.clone();
                let requested = tokio::select! {
                    biased;
                    reason = stop.wait() => Err(reason),
                    uses = self.request_actions() => Ok(uses),
                };
                let uses = match requested {
                    Ok(uses) => uses?,
                    Err(reason) => return self.acknowledge_stop(reason).map(Some),
                };
                self.transition(WorkerPhase::ExecutingTools)?;
                let end = self.run_actions(uses).await?;
                self.snap.iteration += 1;
                match end {
                    BatchEnd::Continue => self.transition(WorkerPhase::RequestingActions)?,
                    BatchEnd::Stopped(reason) => {
                        self.transition(WorkerPhase::StopRequested)?;
                        return Ok(Some(Exit::stopped(reason)));
                    }
                    end => return Ok(Some(end.into_exit())),
                }
            }
            phase => {
                return Err(AgentError::InvalidTransition {
                    from: phase.to_string(),
                    to: WorkerPhase::RequestingActions.to_string(),
                });
            }
        }
        self.checkpoint();
        Ok(None)
    }

    fn acknowledge_stop(&mut self, reason: String) -> Result<Exit, AgentError> {
        info!(%reason, "stop requested");
        self.emit(ProgressEvent::WorkerWasStopped {
            reason: reason.clone(),
        });
        if self.snap.phase == WorkerPhase::RequestingActions {
            self.transition(WorkerPhase::StopRequested)?;
        }
        Ok(Exit::stopped(reason))
    }

    /// Stops the children, then records the exit.
    async fn close(&mut self, exit: Exit) {
        self.tree
            .shutdown("parent finished", self.env.config.stop_ack_timeout)
            .await;
        if let Err(err) = self.snap.phase.transition(exit.phase) {
            warn!(error = %err, "forcing final phase");
            self.snap.phase = exit.phase;
        }
        self.snap.status = Some(exit.status);
        self.snap.note.clone_from(&exit.note);
        self.checkpoint();
        info!(
            status = %exit.status,
            iterations = self.snap.iteration,
            entities = self.snap.state.entity_summaries.len(),
            claims = self.snap.state.claims.len(),
            tokens = self.snap.usage.total_tokens,
            "worker finished"
        );
        self.emit(ProgressEvent::WorkerFinished {
            status: exit.status,
            note: exit.note,
        });
    }

    fn outcome(self) -> WorkerOutcome {
        let status = self.snap.status.unwrap_or(WorkerStatus::Completed);
        let (summaries, claims) = if status.contributes_facts() {
            (self.snap.state.entity_summaries, self.snap.state.claims)
        } else {
            (Vec::new(), Vec::new())
        };
        WorkerOutcome {
            identifiers: self.snap.identifiers,
            status,
            summaries,
            claims,
            usage: self.snap.usage,
            iterations: self.snap.iteration,
            workers_started: 1 + self.snap.descendants,
            note: self.snap.note,
        }
    }

    /// Coordinators write a plan; link-followers read their starting pages.
    async fn plan(&mut self) -> Result<BatchEnd, AgentError> {
        if self.kind() == WorkerKind::LinkFollower {
            let links: Vec<LinkRequest> = self
                .snap
                .state
                .resources_not_visited
                .iter()
                .map(|r| LinkRequest {
                    url: r.url.clone(),
                    explanation: r.summary.clone(),
                })
                .collect();
            let input = serde_json::json!({ "links": links });
            return self
                .run_actions(vec![(
                    tools::EXPLORE_LINKS.to_string(),
                    input,
                    Ok(CoordinatorAction::ExploreLinks { links }),
                )])
                .await;
        }

        let request = LlmRequest::new(
            self.model(),
            vec![user_message(&build_planning_prompt(
                &self.snap.state,
                &self.env.entity_types,
            ))],
        )
        .system(self.env.prompts.for_worker(self.kind()).to_string())
        .tools(vec![tools::update_plan()])
        .tool_choice(ToolChoice::tool(tools::UPDATE_PLAN))
        .max_tokens(self.env.config.max_tokens);
        let mut usage = Usage::default();
        let mut stop = self.stop.clone();
        let result = tokio::select! {
            biased;
            reason = stop.wait() => Err(reason),
            result = self.env.call(self.kind().as_str(), &request, &self.cancel, &mut usage) => Ok(result),
        };
        self.snap.usage += usage;
        let success = match result {
            Ok(result) => result?,
            Err(reason) => {
                self.emit(ProgressEvent::WorkerWasStopped {
                    reason: reason.clone(),
                });
                return Ok(BatchEnd::Stopped(reason));
            }
        };
        self.run_actions(decode_actions(&success.tool_uses())).await
    }

    async fn request_actions(&mut self) -> Result<Vec<Action>, AgentError> {
        let kind = self.kind();
        let prompt = build_worker_prompt(
            kind,
            &self.snap.state,
            &self.env.entity_types,
            self.snap.iteration,
            self.env.config.iteration_cap(kind),
        );
        let request = LlmRequest::new(self.model(), vec![user_message(&prompt)])
            .system(self.env.prompts.for_worker(kind).to_string())
            .tools(tools::tools_for(
                kind,
                self.env.human.is_some(),
                self.env.config.links_per_follower,
            ))
            .tool_choice(ToolChoice::Required)
            .max_tokens(self.env.config.max_tokens);
        let success = self
            .env
            .call(kind.as_str(), &request, &self.cancel, &mut self.snap.usage)
            .await?;
        Ok(decode_actions(&success.tool_uses()))
    }

    /// Starts every call, drains them, then applies their results in call
    /// order. A `terminate` anywhere in the batch ends the worker before any
    /// other call starts.
    async fn run_actions(&mut self, actions: Vec<Action>) -> Result<BatchEnd, AgentError> {
        if let Some(explanation) = actions.iter().find_map(|(_, _, action)| match action {
            Ok(CoordinatorAction::Terminate { explanation }) => Some(explanation.clone()),
            _ => None,
        }) {
            return Ok(self.terminate_batch(actions, explanation));
        }

        let batch_cancel = self.cancel.child_token();
        let mut end = BatchEnd::Continue;
        let mut calls = Vec::with_capacity(actions.len());
        let mut pending: FuturesUnordered<BoxFuture<'static, (usize, Performed)>> =
            FuturesUnordered::new();

        for (index, (name, input, action)) in actions.into_iter().enumerate() {
            calls.push((name, input));
            let future = match action {
                Ok(action) => self.start(action, &batch_cancel, &mut end),
                Err(err) => ready(Performed::Rejected(err.to_string())).boxed(),
            };
            pending.push(future.map(move |p| (index, p)).boxed());
        }

        let finishing = !matches!(end, BatchEnd::Continue);
        if finishing {
            self.tree.stop_all("parent is finishing");
        }
        let ack_timeout = self.env.config.stop_ack_timeout;
        let mut deadline = finishing.then(|| tokio::time::Instant::now() + ack_timeout);
        let mut stopped: Option<String> = None;
        let mut stop = self.stop.clone();
        let mut performed = Vec::with_capacity(calls.len());

        loop {
            let expiry = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                next = pending.next() => match next {
                    Some(result) => performed.push(result),
                    None => break,
                },
                reason = stop.wait(), if stopped.is_none() => {
                    info!(%reason, running = pending.len(), "stop requested, draining started calls");
                    self.emit(ProgressEvent::WorkerWasStopped { reason: reason.clone() });
                    self.tree.stop_all(&reason);
                    stopped = Some(reason);
                    deadline.get_or_insert_with(|| tokio::time::Instant::now() + ack_timeout);
                },
                () = expiry => {
                    warn!(running = pending.len(), "calls did not drain in time, cancelling");
                    batch_cancel.cancel();
                    deadline = None;
                },
            }
        }

        performed.sort_by_key(|(index, _)| *index);
        let iteration = self.snap.iteration;
        let mut new_summaries = 0;
        for (index, result) in performed {
            let (tool_name, input) = calls[index].clone();
            let (text, added) = self.apply(result);
            new_summaries += added;
            self.snap.state.previous_calls.push(PreviousCall {
                iteration,
                tool_name,
                input,
                result: text,
            });
        }

        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if new_summaries > 0 {
            self.deduplicate().await?;
        }

        Ok(match (end, stopped) {
            (BatchEnd::Continue, Some(reason)) => BatchEnd::Stopped(reason),
            (end, _) => end,
        })
    }

    /// Starts one call. Children are spawned before this returns.
    fn start(
        &mut self,
        action: CoordinatorAction,
        batch_cancel: &CancellationToken,
        end: &mut BatchEnd,
    ) -> BoxFuture<'static, Performed> {
        match action {
            CoordinatorAction::WebSearch { query, .. } => {
                if self.snap.state.web_queries_made.contains(&query) {
                    return ready(Performed::Rejected(format!(
                        "\"{query}\" was already searched; use a different query"
                    )))
                    .boxed();
                }
                self.snap.state.web_queries_made.push(query.clone());
                let search = Arc::clone(&self.env.search);
                let cancel = batch_cancel.clone();
                async move {
                    let hits = tokio::select! {
                        biased;
                        () = cancel.cancelled() => Err(ServiceError::Unavailable {
                            service: "web",
                            message: "search cancelled".to_string(),
                        }),
                        hits = search.search(&query) => hits,
                    };
                    Performed::Searched { query, hits }
                }
                .boxed()
            }
            CoordinatorAction::InferClaimsFromResources { resources } => {
                let mut skipped = Vec::new();
                let mut children = Vec::new();
                for resource in resources {
                    if self.snap.state.resources_visited.contains(&resource.url) {
                        skipped.push(resource.url);
                        continue;
                    }
                    self.snap.state.mark_visited(&resource.url);
                    let mut state = self.snap.state.for_child(resource.goal.clone());
                    state.resources_visited.remove(&resource.url);
                    state.resources_not_visited.push(Resource {
                        url: resource.url.clone(),
                        title: String::new(),
                        summary: resource.goal.clone(),
                    });
                    children.push(self.spawn_child(
                        WorkerKind::LinkFollower,
                        state,
                        batch_cancel,
                    ));
                }
                await_children(children, skipped)
            }
            CoordinatorAction::StartResearchTasks { tasks } => {
                let children = tasks
                    .into_iter()
                    .map(|task| {
                        let state = self.snap.state.for_child(task.goal);
                        self.spawn_child(WorkerKind::SubCoordinator, state, batch_cancel)
                    })
                    .collect();
                await_children(children, Vec::new())
            }
            CoordinatorAction::UpdatePlan { plan } => {
                self.snap.state.plan.clone_from(&plan);
                self.emit(ProgressEvent::UpdatedPlan { plan });
                ready(Performed::Note("Plan updated.".to_string())).boxed()
            }
            CoordinatorAction::RequestHumanInput { question } => {
                let Some(human) = self.env.human.clone() else {
                    return ready(Performed::Rejected(
                        "No human is available to answer questions.".to_string(),
                    ))
                    .boxed();
                };
                let cancel = batch_cancel.clone();
                async move {
                    let answer = tokio::select! {
                        biased;
                        () = cancel.cancelled() => None,
                        answer = human.ask(&question) => answer,
                    };
                    Performed::Answered { answer }
                }
                .boxed()
            }
            CoordinatorAction::ExploreLinks { links } => {
                let mut urls: Vec<String> = Vec::new();
                for link in links {
                    if urls.len() >= self.env.config.links_per_follower {
                        break;
                    }
                    if !self.snap.state.resources_visited.contains(&link.url)
                        && !urls.contains(&link.url)
                    {
                        urls.push(link.url);
                    }
                }
                if urls.is_empty() {
                    return ready(Performed::Rejected(
                        "Every requested link was already read.".to_string(),
                    ))
                    .boxed();
                }
                for url in &urls {
                    self.snap.state.mark_visited(url);
                }
                let known = Arc::new(self.snap.state.entity_summaries.clone());
                let pages = urls.into_iter().map(|url| {
                    explore_page(
                        self.env.clone(),
                        self.snap.identifiers,
                        self.snap.state.goal.clone(),
                        url,
                        Arc::clone(&known),
                        batch_cancel.clone(),
                    )
                });
                futures_util::future::join_all(pages)
                    .map(Performed::Pages)
                    .boxed()
            }
            CoordinatorAction::Complete { explanation } => {
                if matches!(end, BatchEnd::Continue) {
                    *end = BatchEnd::Complete(explanation);
                }
                ready(Performed::Note("Completing.".to_string())).boxed()
            }
            CoordinatorAction::Terminate { .. } => {
                ready(Performed::Note("Terminating.".to_string())).boxed()
            }
        }
    }

    /// Records the batch without running it and stops any children.
    fn terminate_batch(&mut self, actions: Vec<Action>, explanation: String) -> BatchEnd {
        info!(calls = actions.len(), %explanation, "terminate requested, skipping the batch");
        self.tree.stop_all("parent is terminating");
        let iteration = self.snap.iteration;
        for (tool_name, input, action) in actions {
            let result = match action {
                Ok(CoordinatorAction::Terminate { .. }) => "Terminating.",
                _ => "Not run: the worker terminated.",
            };
            self.snap.state.previous_calls.push(PreviousCall {
                iteration,
                tool_name,
                input,
                result: result.to_string(),
            });
        }
        BatchEnd::Terminate(explanation)
    }

    fn spawn_child(
        &mut self,
        kind: WorkerKind,
        state: CoordinatorState,
        batch_cancel: &CancellationToken,
    ) -> (Uuid, String, JoinHandle<WorkerOutcome>) {
        let identifiers = self.snap.identifiers.child(kind);
        let task_id = identifiers.worker_instance_id;
        let goal = state.goal.clone();
        self.snap.state.workers_started.push(task_id);
        self.snap.state.outstanding_tasks.push(OutstandingTask {
            worker_instance_id: task_id,
            goal: goal.clone(),
        });
        self.emit(ProgressEvent::StartedTask {
            task_id,
            goal: goal.clone(),
        });
        debug!(child = %identifiers, %goal, "starting child worker");
        let env = self.env.clone();
        let snapshot = WorkerSnapshot::new(self.snap.execution_id, identifiers, state);
        let handle = self.tree.spawn(identifiers, batch_cancel, move |stop, cancel| {
            run_worker(env, snapshot, stop, cancel)
        });
        (task_id, goal, handle)
    }

    /// Applies a call's result; returns its text and the number of new
    /// entities it added.
    fn apply(&mut self, performed: Performed) -> (String, usize) {
        match performed {
            Performed::Searched { query, hits } => match hits {
                Ok(hits) => {
                    self.emit(ProgressEvent::QueriedWeb {
                        query,
                        hit_count: hits.len(),
                    });
                    let mut text = format!("{} results:", hits.len());
                    for hit in hits.iter().take(SEARCH_RESULTS_SHOWN) {
                        text.push_str(&format!("\n- {} | {}", hit.url, hit.title));
                    }
                    self.snap.state.add_candidates(hits.into_iter().map(|h| Resource {
                        url: h.url,
                        title: h.title,
                        summary: h.summary,
                    }));
                    (text, 0)
                }
                Err(err) => (format!("Search failed: {err}"), 0),
            },
            Performed::Children { results, skipped } => {
                let mut lines = Vec::new();
                let mut added = 0;
                for url in skipped {
                    lines.push(format!("{url}: already read"));
                }
                for child in results {
                    self.snap
                        .state
                        .outstanding_tasks
                        .retain(|t| t.worker_instance_id != child.task_id);
                    match child.outcome {
                        Ok(outcome) => {
                            self.snap.usage += outcome.usage;
                            self.snap.descendants += outcome.workers_started;
                            let entity_count = outcome.summaries.len();
                            let claim_count = outcome.claims.len();
                            if outcome.status.contributes_facts() {
                                added += self.snap.state.add_summaries(outcome.summaries);
                                self.snap.state.add_claims(outcome.claims);
                            }
                            self.emit(ProgressEvent::ClosedTask {
                                task_id: child.task_id,
                                status: outcome.status,
                                entity_count,
                                claim_count,
                            });
                            lines.push(format!(
                                "{}: {} with {entity_count} entities and {claim_count} claims",
                                child.goal, outcome.status
                            ));
                        }
                        Err(err) => {
                            warn!(task = %child.task_id, error = %err, "child worker panicked");
                            self.snap.descendants += 1;
                            lines.push(format!("{}: worker crashed", child.goal));
                        }
                    }
                }
                (lines.join("\n"), added)
            }
            Performed::Pages(pages) => {
                let mut lines = Vec::new();
                let mut added = 0;
                for page in pages {
                    self.snap.usage += page.usage;
                    match page.findings {
                        Ok(findings) => {
                            lines.push(format!(
                                "{} ({}): {} entities, {} claims, {} links",
                                page.url,
                                findings.title,
                                findings.summaries.len(),
                                findings.claims.len(),
                                findings.links.len()
                            ));
                            added += self.snap.state.add_summaries(findings.summaries);
                            self.snap.state.add_claims(findings.claims);
                            self.snap
                                .state
                                .add_candidates(findings.links.into_iter().map(|url| Resource {
                                    url,
                                    title: String::new(),
                                    summary: String::new(),
                                }));
                        }
                        Err(err) => {
                            debug!(url = %page.url, error = %err, "page not read");
                            lines.push(format!("{}: could not be read ({err})", page.url));
                        }
                    }
                }
                (lines.join("\n"), added)
            }
            Performed::Answered { answer } => (
                answer.map_or_else(
                    || "No answer was given.".to_string(),
                    |a| format!("The human answered: {a}"),
                ),
                0,
            ),
            Performed::Note(text) => (text, 0),
            Performed::Rejected(text) => (format!("Error: {text}"), 0),
        }
    }

    async fn deduplicate(&mut self) -> Result<(), AgentError> {
        let agent = DedupAgent::new(&self.env);
        let result = agent
            .identify_duplicates(
                &self.snap.state.entity_summaries,
                &self.snap.state.committed_entity_ids,
                &self.cancel,
                &mut self.snap.usage,
            )
            .await;
        match result {
            Ok(outcome) if outcome.duplicates.is_empty() => Ok(()),
            Ok(outcome) => {
                apply_duplicates(&mut self.snap.state, &outcome.duplicates);
                self.emit(ProgressEvent::DeduplicatedEntities {
                    duplicates: outcome.duplicates,
                });
                Ok(())
            }
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(err) => {
                warn!(error = %err, "dedup pass failed, keeping entities as they are");
                Ok(())
            }
        }
    }
}

/// A requested call: tool name, raw input and the decoded action.
type Action = (String, Value, Result<CoordinatorAction, AgentError>);

fn decode_actions(uses: &[&ToolUse]) -> Vec<Action> {
    uses.iter()
        .map(|u| {
            (
                u.name.clone(),
                u.input.clone(),
                CoordinatorAction::from_tool_use(u),
            )
        })
        .collect()
}

fn await_children(
    children: Vec<(Uuid, String, JoinHandle<WorkerOutcome>)>,
    skipped: Vec<String>,
) -> BoxFuture<'static, Performed> {
    async move {
        let mut results = Vec::with_capacity(children.len());
        for (task_id, goal, handle) in children {
            results.push(ChildResult {
                task_id,
                goal,
                outcome: handle.await,
            });
        }
        Performed::Children { results, skipped }
    }
    .boxed()
}

async fn explore_page(
    env: ResearchEnv,
    worker: WorkerIdentifiers,
    goal: String,
    url: String,
    known: Arc<Vec<EntitySummary>>,
    cancel: CancellationToken,
) -> ExploredPage {
    let mut usage = Usage::default();
    let findings = read_page(&env, &worker, &goal, &url, &known, &cancel, &mut usage).await;
    ExploredPage {
        url,
        usage,
        findings,
    }
}

/// Fetches a page and extracts its entities and claims under the
/// concurrency limiter.
async fn read_page(
    env: &ResearchEnv,
    worker: &WorkerIdentifiers,
    goal: &str,
    url: &str,
    known: &[EntitySummary],
    cancel: &CancellationToken,
    usage: &mut Usage,
) -> Result<PageFindings, AgentError> {
    let permit = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(AgentError::Cancelled),
        permit = env.limiter.acquire() => permit,
    };
    let _permit = permit.map_err(|_| AgentError::Cancelled)?;
    let page = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(AgentError::Cancelled),
        page = env.fetch.fetch(url) => page?,
    };
    env.events.emit(
        worker,
        ProgressEvent::VisitedWebPage {
            url: page.url.clone(),
            title: page.title.clone(),
        },
    );
    let summaries = infer_entity_summaries(env, goal, &page, cancel, usage).await?;
    let claims = infer_claims(env, goal, &page, &summaries, known, cancel, usage).await?;
    env.events.emit(
        worker,
        ProgressEvent::InferredClaims {
            url: page.url.clone(),
            entity_count: summaries.len(),
            claim_count: claims.len(),
        },
    );
    Ok(PageFindings {
        title: page.title,
        summaries,
        claims,
        links: page.links,
    })
}
