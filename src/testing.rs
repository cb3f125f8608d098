//! Deterministic doubles for the gateway and external services.
//!
//! Used by this crate's tests and by integration tests; nothing here talks
//! to the network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::agent::{
    EntityTypeDefinition, PromptSet, ResearchConfig, ResearchConfigBuilder, ResearchEnv,
};
use crate::error::{ProviderError, ServiceError};
use crate::llm::message::assistant_tool_uses;
use crate::llm::{
    LlmGateway, LlmModel, LlmProvider, LlmRequest, Message, ProviderKind, ProviderReply,
    ProviderRoute, RetryLimits, StopReason, ToolUse, Usage,
};
use crate::services::{HumanInput, SearchHit, WebFetch, WebPage, WebSearch};

type Responder = Arc<dyn Fn(&LlmRequest) -> ScriptedReply + Send + Sync>;

/// One scripted provider round-trip.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    outcome: Result<(Message, Option<StopReason>, Usage), ScriptedFailure>,
    delay: Duration,
}

#[derive(Debug, Clone, Copy)]
enum ScriptedFailure {
    RateLimited(Option<Duration>),
    Server(u16),
    Api(u16),
}

impl ScriptedReply {
    /// Replies with `message`.
    #[must_use]
    pub const fn message(message: Message) -> Self {
        Self {
            outcome: Ok((message, None, Usage::new(10, 5))),
            delay: Duration::ZERO,
        }
    }

    /// Replies with a single tool call.
    #[must_use]
    pub fn tool_call(name: &str, input: Value) -> Self {
        Self::tool_calls(vec![(name, input)])
    }

    /// Replies with several tool calls in one turn.
    #[must_use]
    pub fn tool_calls(calls: Vec<(&str, Value)>) -> Self {
        let uses = calls
            .into_iter()
            .map(|(name, input)| ToolUse {
                id: format!("toolu_{}", Uuid::new_v4().simple()),
                name: name.to_string(),
                input,
            })
            .collect();
        Self::message(assistant_tool_uses(uses))
    }

    /// Fails with a rate limit.
    #[must_use]
    pub const fn rate_limited(reset_after: Option<Duration>) -> Self {
        Self {
            outcome: Err(ScriptedFailure::RateLimited(reset_after)),
            delay: Duration::ZERO,
        }
    }

    /// Fails with a retryable server error.
    #[must_use]
    pub const fn server_error(status: u16) -> Self {
        Self {
            outcome: Err(ScriptedFailure::Server(status)),
            delay: Duration::ZERO,
        }
    }

    /// Fails with a non-retryable API error.
    #[must_use]
    pub const fn api_error(status: u16) -> Self {
        Self {
            outcome: Err(ScriptedFailure::Api(status)),
            delay: Duration::ZERO,
        }
    }

    /// Overrides the stop reason.
    #[must_use]
    pub fn stop(mut self, stop_reason: StopReason) -> Self {
        if let Ok((_, stop, _)) = &mut self.outcome {
            *stop = Some(stop_reason);
        }
        self
    }

    /// Overrides the reported usage.
    #[must_use]
    pub fn usage(mut self, usage: Usage) -> Self {
        if let Ok((_, _, u)) = &mut self.outcome {
            *u = usage;
        }
        self
    }

    /// Delays the reply.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn into_result(self, route: ProviderRoute) -> Result<ProviderReply, ProviderError> {
        match self.outcome {
            Ok((message, stop, usage)) => {
                let stop_reason = stop.unwrap_or(if message.tool_uses().is_empty() {
                    StopReason::Stop
                } else {
                    StopReason::ToolUse
                });
                Ok(ProviderReply {
                    message,
                    stop_reason,
                    usage,
                })
            }
            Err(ScriptedFailure::RateLimited(reset_after)) => {
                Err(ProviderError::RateLimited { route, reset_after })
            }
            Err(ScriptedFailure::Server(status)) => Err(ProviderError::Server {
                route,
                status,
                message: "scripted server error".to_string(),
            }),
            Err(ScriptedFailure::Api(status)) => Err(ProviderError::Api {
                route,
                status: Some(status),
                message: "scripted api error".to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct Log {
    requests: Vec<LlmRequest>,
    routes: Vec<ProviderRoute>,
}

/// Provider that replays a script instead of calling a vendor.
///
/// Replies are taken from the queue in order; once it is empty the
/// `repeat` reply (or the responder) answers every call.
pub struct ScriptedProvider {
    kind: ProviderKind,
    routes: Vec<ProviderRoute>,
    queue: Mutex<VecDeque<ScriptedReply>>,
    repeat: Option<ScriptedReply>,
    responder: Option<Responder>,
    log: Mutex<Log>,
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("kind", &self.kind)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl ScriptedProvider {
    /// Empty script for `kind` with its primary route.
    #[must_use]
    pub fn new(kind: ProviderKind) -> Self {
        let route = match kind {
            ProviderKind::Anthropic => ProviderRoute::AnthropicDirect,
            ProviderKind::OpenAi => ProviderRoute::OpenAi,
            ProviderKind::Google => ProviderRoute::Google,
        };
        Self {
            kind,
            routes: vec![route],
            queue: Mutex::new(VecDeque::new()),
            repeat: None,
            responder: None,
            log: Mutex::new(Log::default()),
        }
    }

    /// Overrides the configured routes.
    #[must_use]
    pub fn with_routes(mut self, routes: Vec<ProviderRoute>) -> Self {
        self.routes = routes;
        self
    }

    /// Queues one reply.
    #[must_use]
    pub fn reply(self, reply: ScriptedReply) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(reply);
        }
        self
    }

    /// Answers every call after the queue with `reply`.
    #[must_use]
    pub fn repeat(mut self, reply: ScriptedReply) -> Self {
        self.repeat = Some(reply);
        self
    }

    /// Answers every call after the queue by inspecting the request.
    #[must_use]
    pub fn respond_with(
        mut self,
        responder: impl Fn(&LlmRequest) -> ScriptedReply + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Number of round-trips made.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.log.lock().map(|l| l.requests.len()).unwrap_or_default()
    }

    /// The `index`-th request received.
    #[must_use]
    pub fn request(&self, index: usize) -> Option<LlmRequest> {
        self.log.lock().ok()?.requests.get(index).cloned()
    }

    /// Every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.log.lock().map(|l| l.requests.clone()).unwrap_or_default()
    }

    /// Routes used, in order.
    #[must_use]
    pub fn routes_used(&self) -> Vec<ProviderRoute> {
        self.log.lock().map(|l| l.routes.clone()).unwrap_or_default()
    }

    fn next_reply(&self, request: &LlmRequest) -> Option<ScriptedReply> {
        if let Some(reply) = self.queue.lock().ok().and_then(|mut q| q.pop_front()) {
            return Some(reply);
        }
        if let Some(responder) = &self.responder {
            return Some(responder(request));
        }
        self.repeat.clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn routes(&self) -> Vec<ProviderRoute> {
        self.routes.clone()
    }

    async fn complete(
        &self,
        request: &LlmRequest,
        route: ProviderRoute,
    ) -> Result<ProviderReply, ProviderError> {
        if let Ok(mut log) = self.log.lock() {
            log.requests.push(request.clone());
            log.routes.push(route);
        }
        let Some(reply) = self.next_reply(request) else {
            return Err(ProviderError::Api {
                route,
                status: None,
                message: "script exhausted".to_string(),
            });
        };
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        reply.into_result(route)
    }
}

/// Whether `request` offers a tool named `tool`.
#[must_use]
pub fn offers(request: &LlmRequest, tool: &str) -> bool {
    request.tools.iter().any(|t| t.name == tool)
}

/// In-memory web: fixed search results and pages.
#[derive(Debug, Default)]
pub struct StaticWeb {
    results: HashMap<String, Vec<SearchHit>>,
    default_results: Vec<SearchHit>,
    pages: HashMap<String, WebPage>,
    fetched: Mutex<Vec<String>>,
}

impl StaticWeb {
    /// Empty web.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Results for an exact query.
    #[must_use]
    pub fn with_results(mut self, query: &str, hits: Vec<SearchHit>) -> Self {
        self.results.insert(query.to_string(), hits);
        self
    }

    /// Results for any other query.
    #[must_use]
    pub fn with_default_results(mut self, hits: Vec<SearchHit>) -> Self {
        self.default_results = hits;
        self
    }

    /// A page served at `url`.
    #[must_use]
    pub fn with_page(mut self, url: &str, title: &str, text: &str, links: &[&str]) -> Self {
        self.pages.insert(
            url.to_string(),
            WebPage {
                url: url.to_string(),
                title: title.to_string(),
                text: text.to_string(),
                links: links.iter().map(ToString::to_string).collect(),
            },
        );
        self
    }

    /// URLs fetched so far.
    #[must_use]
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl WebSearch for StaticWeb {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ServiceError> {
        Ok(self
            .results
            .get(query)
            .cloned()
            .unwrap_or_else(|| self.default_results.clone()))
    }
}

#[async_trait]
impl WebFetch for StaticWeb {
    async fn fetch(&self, url: &str) -> Result<WebPage, ServiceError> {
        if let Ok(mut fetched) = self.fetched.lock() {
            fetched.push(url.to_string());
        }
        self.pages.get(url).cloned().ok_or_else(|| ServiceError::NotFound {
            service: "web",
            what: url.to_string(),
        })
    }
}

/// Human input that answers from a queue.
#[derive(Debug, Default)]
pub struct ScriptedHumanInput {
    answers: Mutex<VecDeque<String>>,
    questions: Mutex<Vec<String>>,
}

impl ScriptedHumanInput {
    /// Answers the next questions with `answers`, then with nothing.
    #[must_use]
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(ToString::to_string).collect()),
            questions: Mutex::new(Vec::new()),
        }
    }

    /// Questions asked so far.
    #[must_use]
    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HumanInput for ScriptedHumanInput {
    async fn ask(&self, question: &str) -> Option<String> {
        if let Ok(mut questions) = self.questions.lock() {
            questions.push(question.to_string());
        }
        self.answers.lock().ok()?.pop_front()
    }
}

/// Retry limits with millisecond waits.
#[must_use]
pub fn fast_retry_limits() -> RetryLimits {
    RetryLimits {
        default_rate_limit_wait: Duration::from_millis(5),
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(5),
        ..RetryLimits::default()
    }
}

/// Configuration routing every role to GPT-4o, so a single OpenAI
/// [`ScriptedProvider`] serves the whole run.
#[must_use]
pub fn scripted_config() -> ResearchConfigBuilder {
    ResearchConfig::builder()
        .model(LlmModel::Gpt4o)
        .stop_ack_timeout(Duration::from_secs(2))
}

/// Environment backed by `provider` and `web` with the built-in prompts.
#[must_use]
pub fn research_env(
    provider: &Arc<ScriptedProvider>,
    web: &Arc<StaticWeb>,
    config: ResearchConfig,
) -> ResearchEnv {
    let gateway = LlmGateway::new(fast_retry_limits()).with_provider(provider.clone());
    ResearchEnv::new(Arc::new(gateway), config, web.clone(), web.clone())
        .with_prompts(PromptSet::defaults())
        .with_entity_types(vec![company_type()])
}

/// A small `Company` entity type.
#[must_use]
pub fn company_type() -> EntityTypeDefinition {
    EntityTypeDefinition {
        entity_type_id: "https://example.com/types/company/v/1".to_string(),
        title: "Company".to_string(),
        description: "A business organisation.".to_string(),
        properties_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "foundedYear": {"type": "integer"}
            },
            "additionalProperties": false
        }),
    }
}

/// Scripted answers for the extraction and dedup agents.
///
/// Every page yields one entity called `entity_name` and one claim about
/// it; dedup reports nothing and proposals echo the name. Returns `None`
/// for worker requests so callers can script those separately.
#[must_use]
pub fn extraction_reply(request: &LlmRequest, entity_name: &str) -> Option<ScriptedReply> {
    let first = request.tools.first()?;
    let reply = match first.name.as_str() {
        "registerEntitySummaries" => {
            let type_id = first.input_schema["properties"]["entitySummaries"]["items"]
                ["properties"]["entityTypeId"]["enum"][0]
                .clone();
            ScriptedReply::tool_call(
                "registerEntitySummaries",
                serde_json::json!({"entitySummaries": [{
                    "name": entity_name,
                    "summary": format!("{entity_name} is a company."),
                    "entityTypeId": type_id
                }]}),
            )
        }
        "submitClaims" => {
            let subject = first.input_schema["properties"]["claims"]["items"]["properties"]
                ["subjectEntityLocalId"]["enum"][0]
                .clone();
            ScriptedReply::tool_call(
                "submitClaims",
                serde_json::json!({"claims": [{
                    "text": format!("{entity_name} makes rockets."),
                    "subjectEntityLocalId": subject
                }]}),
            )
        }
        "identifyDuplicates" => {
            ScriptedReply::tool_call("identifyDuplicates", serde_json::json!({"duplicates": []}))
        }
        "proposeEntity" => ScriptedReply::tool_call(
            "proposeEntity",
            serde_json::json!({"properties": {"name": entity_name}}),
        ),
        _ => return None,
    };
    Some(reply)
}
