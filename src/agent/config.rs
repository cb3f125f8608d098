//! Research configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment variables → defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::{DEFAULT_CAPACITY, DEFAULT_TTL};
use crate::error::ConfigError;
use crate::llm::LlmModel;
use crate::services::web::DEFAULT_PAGE_CHAR_BUDGET;

/// Default model for coordinators.
const DEFAULT_COORDINATOR_MODEL: LlmModel = LlmModel::ClaudeSonnet45;
/// Default model for link-followers and extraction.
const DEFAULT_WORKER_MODEL: LlmModel = LlmModel::ClaudeHaiku45;
/// Default coordinator iteration cap.
const DEFAULT_COORDINATOR_ITERATIONS: u32 = 10;
/// Default sub-coordinator iteration cap.
const DEFAULT_SUB_COORDINATOR_ITERATIONS: u32 = 6;
/// Default link-follower iteration cap.
const DEFAULT_LINK_FOLLOWER_ITERATIONS: u32 = 4;
/// Default maximum concurrent page extractions and proposals.
const DEFAULT_MAX_CONCURRENCY: usize = 8;
/// Default time children get to acknowledge a stop.
const DEFAULT_STOP_ACK_TIMEOUT_SECS: u64 = 30;
/// Default links one `exploreLinks` call may follow.
const DEFAULT_LINKS_PER_FOLLOWER: usize = 5;
/// Default output token budget per call.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Models used for each role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleModels {
    /// Root coordinator.
    pub coordinator: LlmModel,
    /// Sub-coordinators.
    pub sub_coordinator: LlmModel,
    /// Link-followers.
    pub link_follower: LlmModel,
    /// Entity-summary and claim extraction.
    pub extraction: LlmModel,
    /// Duplicate detection.
    pub dedup: LlmModel,
    /// Entity proposals.
    pub proposal: LlmModel,
}

impl RoleModels {
    /// Uses `model` for every role.
    #[must_use]
    pub const fn uniform(model: LlmModel) -> Self {
        Self {
            coordinator: model,
            sub_coordinator: model,
            link_follower: model,
            extraction: model,
            dedup: model,
            proposal: model,
        }
    }
}

impl Default for RoleModels {
    fn default() -> Self {
        Self {
            coordinator: DEFAULT_COORDINATOR_MODEL,
            sub_coordinator: DEFAULT_COORDINATOR_MODEL,
            link_follower: DEFAULT_WORKER_MODEL,
            extraction: DEFAULT_WORKER_MODEL,
            dedup: DEFAULT_WORKER_MODEL,
            proposal: DEFAULT_COORDINATOR_MODEL,
        }
    }
}

/// Iteration caps per worker kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationLimits {
    /// Root coordinator.
    pub coordinator: u32,
    /// Sub-coordinators.
    pub sub_coordinator: u32,
    /// Link-followers.
    pub link_follower: u32,
}

impl Default for IterationLimits {
    fn default() -> Self {
        Self {
            coordinator: DEFAULT_COORDINATOR_ITERATIONS,
            sub_coordinator: DEFAULT_SUB_COORDINATOR_ITERATIONS,
            link_follower: DEFAULT_LINK_FOLLOWER_ITERATIONS,
        }
    }
}

/// Configuration for a research run.
#[derive(Debug, Clone)]
pub struct ResearchConfig {
    /// Models per role.
    pub models: RoleModels,
    /// Iteration caps per worker kind.
    pub iterations: IterationLimits,
    /// Maximum concurrent page extractions and proposals.
    pub max_concurrency: usize,
    /// How long children get to acknowledge a stop before being cancelled.
    pub stop_ack_timeout: Duration,
    /// Links one `exploreLinks` call may follow.
    pub links_per_follower: usize,
    /// Characters of page text kept per page.
    pub page_char_budget: usize,
    /// Output token budget per call.
    pub max_tokens: u32,
    /// Capacity of the page and run-parameter caches.
    pub cache_capacity: usize,
    /// Lifetime of cache entries.
    pub cache_ttl: Duration,
    /// SQLite file for worker checkpoints.
    pub checkpoint_db: Option<PathBuf>,
    /// Write proposals back to the graph store.
    pub persist_to_graph: bool,
    /// Directory containing prompt template files.
    pub prompt_dir: Option<PathBuf>,
}

impl ResearchConfig {
    /// Creates a new builder for `ResearchConfig`.
    #[must_use]
    pub fn builder() -> ResearchConfigBuilder {
        ResearchConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable holds an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder().from_env()?.build()
    }

    /// Iteration cap for `kind`.
    #[must_use]
    pub const fn iteration_cap(&self, kind: super::identifiers::WorkerKind) -> u32 {
        match kind {
            super::identifiers::WorkerKind::Coordinator => self.iterations.coordinator,
            super::identifiers::WorkerKind::SubCoordinator => self.iterations.sub_coordinator,
            super::identifiers::WorkerKind::LinkFollower => self.iterations.link_follower,
        }
    }
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            models: RoleModels::default(),
            iterations: IterationLimits::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            stop_ack_timeout: Duration::from_secs(DEFAULT_STOP_ACK_TIMEOUT_SECS),
            links_per_follower: DEFAULT_LINKS_PER_FOLLOWER,
            page_char_budget: DEFAULT_PAGE_CHAR_BUDGET,
            max_tokens: DEFAULT_MAX_TOKENS,
            cache_capacity: DEFAULT_CAPACITY,
            cache_ttl: DEFAULT_TTL,
            checkpoint_db: None,
            persist_to_graph: false,
            prompt_dir: None,
        }
    }
}

fn env_parsed<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Builder for [`ResearchConfig`].
#[derive(Debug, Clone, Default)]
pub struct ResearchConfigBuilder {
    all_models: Option<LlmModel>,
    coordinator_model: Option<LlmModel>,
    sub_coordinator_model: Option<LlmModel>,
    link_follower_model: Option<LlmModel>,
    extraction_model: Option<LlmModel>,
    dedup_model: Option<LlmModel>,
    proposal_model: Option<LlmModel>,
    coordinator_iterations: Option<u32>,
    sub_coordinator_iterations: Option<u32>,
    link_follower_iterations: Option<u32>,
    max_concurrency: Option<usize>,
    stop_ack_timeout: Option<Duration>,
    links_per_follower: Option<usize>,
    page_char_budget: Option<usize>,
    max_tokens: Option<u32>,
    cache_capacity: Option<usize>,
    cache_ttl: Option<Duration>,
    checkpoint_db: Option<PathBuf>,
    persist_to_graph: Option<bool>,
    prompt_dir: Option<PathBuf>,
}

impl ResearchConfigBuilder {
    /// Populates unset fields from `QUARRY_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparsable values.
    pub fn from_env(mut self) -> Result<Self, ConfigError> {
        if self.all_models.is_none() {
            self.all_models = env_parsed("QUARRY_MODEL")?;
        }
        if self.coordinator_model.is_none() {
            self.coordinator_model = env_parsed("QUARRY_COORDINATOR_MODEL")?;
        }
        if self.sub_coordinator_model.is_none() {
            self.sub_coordinator_model = env_parsed("QUARRY_SUB_COORDINATOR_MODEL")?;
        }
        if self.link_follower_model.is_none() {
            self.link_follower_model = env_parsed("QUARRY_LINK_FOLLOWER_MODEL")?;
        }
        if self.extraction_model.is_none() {
            self.extraction_model = env_parsed("QUARRY_EXTRACTION_MODEL")?;
        }
        if self.dedup_model.is_none() {
            self.dedup_model = env_parsed("QUARRY_DEDUP_MODEL")?;
        }
        if self.proposal_model.is_none() {
            self.proposal_model = env_parsed("QUARRY_PROPOSAL_MODEL")?;
        }
        if self.coordinator_iterations.is_none() {
            self.coordinator_iterations = env_parsed("QUARRY_COORDINATOR_ITERATIONS")?;
        }
        if self.max_concurrency.is_none() {
            self.max_concurrency = env_parsed("QUARRY_MAX_CONCURRENCY")?;
        }
        if self.stop_ack_timeout.is_none() {
            self.stop_ack_timeout =
                env_parsed::<u64>("QUARRY_STOP_ACK_TIMEOUT_SECS")?.map(Duration::from_secs);
        }
        if self.checkpoint_db.is_none() {
            self.checkpoint_db = std::env::var("QUARRY_CHECKPOINT_DB").ok().map(PathBuf::from);
        }
        if self.persist_to_graph.is_none() {
            self.persist_to_graph = env_flag("QUARRY_PERSIST");
        }
        if self.prompt_dir.is_none() {
            self.prompt_dir = std::env::var("QUARRY_PROMPT_DIR").ok().map(PathBuf::from);
        }
        Ok(self)
    }

    /// Uses `model` for every role not set individually.
    #[must_use]
    pub const fn model(mut self, model: LlmModel) -> Self {
        self.all_models = Some(model);
        self
    }

    /// Sets the coordinator model.
    #[must_use]
    pub const fn coordinator_model(mut self, model: LlmModel) -> Self {
        self.coordinator_model = Some(model);
        self
    }

    /// Sets the sub-coordinator model.
    #[must_use]
    pub const fn sub_coordinator_model(mut self, model: LlmModel) -> Self {
        self.sub_coordinator_model = Some(model);
        self
    }

    /// Sets the link-follower model.
    #[must_use]
    pub const fn link_follower_model(mut self, model: LlmModel) -> Self {
        self.link_follower_model = Some(model);
        self
    }

    /// Sets the extraction model.
    #[must_use]
    pub const fn extraction_model(mut self, model: LlmModel) -> Self {
        self.extraction_model = Some(model);
        self
    }

    /// Sets the dedup model.
    #[must_use]
    pub const fn dedup_model(mut self, model: LlmModel) -> Self {
        self.dedup_model = Some(model);
        self
    }

    /// Sets the proposal model.
    #[must_use]
    pub const fn proposal_model(mut self, model: LlmModel) -> Self {
        self.proposal_model = Some(model);
        self
    }

    /// Sets the coordinator iteration cap.
    #[must_use]
    pub const fn coordinator_iterations(mut self, n: u32) -> Self {
        self.coordinator_iterations = Some(n);
        self
    }

    /// Sets the sub-coordinator iteration cap.
    #[must_use]
    pub const fn sub_coordinator_iterations(mut self, n: u32) -> Self {
        self.sub_coordinator_iterations = Some(n);
        self
    }

    /// Sets the link-follower iteration cap.
    #[must_use]
    pub const fn link_follower_iterations(mut self, n: u32) -> Self {
        self.link_follower_iterations = Some(n);
        self
    }

    /// Sets the maximum concurrency.
    #[must_use]
    pub const fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    /// Sets the stop acknowledgement timeout.
    #[must_use]
    pub const fn stop_ack_timeout(mut self, timeout: Duration) -> Self {
        self.stop_ack_timeout = Some(timeout);
        self
    }

    /// Sets how many links one `exploreLinks` call may follow.
    #[must_use]
    pub const fn links_per_follower(mut self, n: usize) -> Self {
        self.links_per_follower = Some(n);
        self
    }

    /// Sets the page text budget.
    #[must_use]
    pub const fn page_char_budget(mut self, n: usize) -> Self {
        self.page_char_budget = Some(n);
        self
    }

    /// Sets the output token budget per call.
    #[must_use]
    pub const fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    /// Sets cache capacity and entry lifetime.
    #[must_use]
    pub const fn cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.cache_capacity = Some(capacity);
        self.cache_ttl = Some(ttl);
        self
    }

    /// Sets the checkpoint database path.
    #[must_use]
    pub fn checkpoint_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_db = Some(path.into());
        self
    }

    /// Enables or disables writing proposals to the graph.
    #[must_use]
    pub const fn persist_to_graph(mut self, persist: bool) -> Self {
        self.persist_to_graph = Some(persist);
        self
    }

    /// Sets the prompt template directory.
    #[must_use]
    pub fn prompt_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.prompt_dir = Some(dir.into());
        self
    }

    /// Builds the [`ResearchConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a limit is zero.
    pub fn build(self) -> Result<ResearchConfig, ConfigError> {
        let zero = |key: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        };
        let base = self.all_models.map_or_else(RoleModels::default, RoleModels::uniform);
        let models = RoleModels {
            coordinator: self.coordinator_model.unwrap_or(base.coordinator),
            sub_coordinator: self.sub_coordinator_model.unwrap_or(base.sub_coordinator),
            link_follower: self.link_follower_model.unwrap_or(base.link_follower),
            extraction: self.extraction_model.unwrap_or(base.extraction),
            dedup: self.dedup_model.unwrap_or(base.dedup),
            proposal: self.proposal_model.unwrap_or(base.proposal),
        };
        let iterations = IterationLimits {
            coordinator: self
                .coordinator_iterations
                .unwrap_or(DEFAULT_COORDINATOR_ITERATIONS),
            sub_coordinator: self
                .sub_coordinator_iterations
                .unwrap_or(DEFAULT_SUB_COORDINATOR_ITERATIONS),
            link_follower: self
                .link_follower_iterations
                .unwrap_or(DEFAULT_LINK_FOLLOWER_ITERATIONS),
        };
        if iterations.coordinator == 0 {
            return Err(zero("coordinator_iterations"));
        }
        let max_concurrency = self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY);
        if max_concurrency == 0 {
            return Err(zero("max_concurrency"));
        }
        let links_per_follower = self.links_per_follower.unwrap_or(DEFAULT_LINKS_PER_FOLLOWER);
        if links_per_follower == 0 {
            return Err(zero("links_per_follower"));
        }

        Ok(ResearchConfig {
            models,
            iterations,
            max_concurrency,
            stop_ack_timeout: self
                .stop_ack_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_STOP_ACK_TIMEOUT_SECS)),
            links_per_follower,
            page_char_budget: self.page_char_budget.unwrap_or(DEFAULT_PAGE_CHAR_BUDGET),
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            cache_capacity: self.cache_capacity.unwrap_or(DEFAULT_CAPACITY),
            cache_ttl: self.cache_ttl.unwrap_or(DEFAULT_TTL),
            checkpoint_db: self.checkpoint_db,
            persist_to_graph: self.persist_to_graph.unwrap_or(false),
            prompt_dir: self.prompt_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::identifiers::WorkerKind;

    #[test]
    fn test_builder_defaults() {
        let config = ResearchConfig::builder()
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.models, RoleModels::default());
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(config.iteration_cap(WorkerKind::LinkFollower), DEFAULT_LINK_FOLLOWER_ITERATIONS);
        assert!(!config.persist_to_graph);
    }

    #[test]
    fn test_uniform_model_with_override() {
        let config = ResearchConfig::builder()
            .model(LlmModel::Gpt4oMini)
            .coordinator_model(LlmModel::Gpt41)
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.models.coordinator, LlmModel::Gpt41);
        assert_eq!(config.models.dedup, LlmModel::Gpt4oMini);
        assert_eq!(config.models.link_follower, LlmModel::Gpt4oMini);
    }

    #[test]
    fn test_builder_custom_values() {
        let config = ResearchConfig::builder()
            .max_concurrency(2)
            .stop_ack_timeout(Duration::from_millis(50))
            .links_per_follower(3)
            .persist_to_graph(true)
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.stop_ack_timeout, Duration::from_millis(50));
        assert_eq!(config.links_per_follower, 3);
        assert!(config.persist_to_graph);
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert!(ResearchConfig::builder().max_concurrency(0).build().is_err());
        assert!(ResearchConfig::builder().coordinator_iterations(0).build().is_err());
        assert!(ResearchConfig::builder().links_per_follower(0).build().is_err());
    }
}
