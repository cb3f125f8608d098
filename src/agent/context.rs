//! Collaborators shared by every worker in a run.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::config::ResearchConfig;
use super::entity::EntityTypeDefinition;
use super::events::ProgressSink;
use super::prompt::PromptSet;
use crate::error::AgentError;
use crate::llm::{LlmErrorKind, LlmGateway, LlmRequest, LlmSuccess, Usage};
use crate::services::{HumanInput, WebFetch, WebSearch};
use crate::storage::SnapshotStore;

/// Everything a worker needs besides its own state.
///
/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct ResearchEnv {
    /// LLM gateway.
    pub gateway: Arc<LlmGateway>,
    /// Run configuration.
    pub config: Arc<ResearchConfig>,
    /// System prompts.
    pub prompts: Arc<PromptSet>,
    /// Entity types the current run looks for.
    pub entity_types: Arc<[EntityTypeDefinition]>,
    /// Web search.
    pub search: Arc<dyn WebSearch>,
    /// Page fetching.
    pub fetch: Arc<dyn WebFetch>,
    /// Operator channel, when one is attached.
    pub human: Option<Arc<dyn HumanInput>>,
    /// Progress events.
    pub events: ProgressSink,
    /// Checkpoint store.
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
    /// Bounds concurrent page extractions and proposals.
    pub limiter: Arc<Semaphore>,
}

impl std::fmt::Debug for ResearchEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResearchEnv")
            .field("gateway", &self.gateway)
            .field("config", &self.config)
            .field("entity_types", &self.entity_types.len())
            .field("human", &self.human.is_some())
            .field("snapshots", &self.snapshots.is_some())
            .finish_non_exhaustive()
    }
}

impl ResearchEnv {
    /// Creates an environment; prompts are loaded from `config.prompt_dir`.
    #[must_use]
    pub fn new(
        gateway: Arc<LlmGateway>,
        config: ResearchConfig,
        search: Arc<dyn WebSearch>,
        fetch: Arc<dyn WebFetch>,
    ) -> Self {
        let prompts = PromptSet::load(config.prompt_dir.as_deref());
        let limiter = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            gateway,
            config: Arc::new(config),
            prompts: Arc::new(prompts),
            entity_types: Arc::from(Vec::new()),
            search,
            fetch,
            human: None,
            events: ProgressSink::disabled(),
            snapshots: None,
            limiter,
        }
    }

    /// Replaces the prompts.
    #[must_use]
    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = Arc::new(prompts);
        self
    }

    /// Sets the entity types.
    #[must_use]
    pub fn with_entity_types(mut self, entity_types: Vec<EntityTypeDefinition>) -> Self {
        self.entity_types = Arc::from(entity_types);
        self
    }

    /// Attaches an operator channel.
    #[must_use]
    pub fn with_human(mut self, human: Arc<dyn HumanInput>) -> Self {
        self.human = Some(human);
        self
    }

    /// Routes progress events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: ProgressSink) -> Self {
        self.events = events;
        self
    }

    /// Checkpoints workers into `store`.
    #[must_use]
    pub fn with_snapshots(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Looks up an entity type by id.
    #[must_use]
    pub fn entity_type(&self, id: &str) -> Option<&EntityTypeDefinition> {
        self.entity_types.iter().find(|t| t.entity_type_id == id)
    }

    /// Sends `request` through the gateway on behalf of `agent`.
    ///
    /// Usage is added to `usage` whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Cancelled`] for aborted calls and
    /// [`AgentError::Llm`] for every other terminal failure.
    pub async fn call(
        &self,
        agent: &'static str,
        request: &LlmRequest,
        cancel: &CancellationToken,
        usage: &mut Usage,
    ) -> Result<LlmSuccess, AgentError> {
        let response = self.gateway.get_response(request, cancel).await;
        *usage += response.usage();
        match response.into_result() {
            Ok(success) => {
                debug!(agent, model = %request.model, tools = success.tool_uses().len(), "llm call succeeded");
                Ok(success)
            }
            Err(failure) if failure.kind == LlmErrorKind::Aborted => Err(AgentError::Cancelled),
            Err(failure) => Err(AgentError::Llm {
                agent,
                message: format!("{}: {}", failure.kind, failure.message),
            }),
        }
    }
}
