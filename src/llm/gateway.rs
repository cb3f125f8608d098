//! The LLM gateway: one entry point over every provider.
//!
//! [`LlmGateway::get_response`] routes a request to the owning provider and
//! runs three nested, bounded retry layers around it:
//!
//! 1. rate limits (route alternation for Anthropic, vendor-reported waits
//!    elsewhere),
//! 2. server and transport errors (exponential backoff with jitter),
//! 3. tool-input validation (the whole conversation is resubmitted with
//!    corrective tool results).
//!
//! Usage accumulates across all three. Failures are returned as
//! [`LlmResponse::Error`], never as `Err`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::config::{GatewayConfig, RetryLimits};
use super::message::{AssistantContent, Message, ToolUse, UserContent, tool_result};
use super::provider::{LlmProvider, ProviderKind, ProviderReply, ProviderRoute};
use super::providers::create_providers;
use super::response::{
    LlmErrorKind, LlmFailure, LlmRequest, LlmResponse, LlmSuccess, StopReason, Timing,
};
use super::retry::{BackoffPolicy, RateLimitTracker, RouteDecision, sleep_or_cancel};
use super::schema::{describe_errors, sanitize_then_validate};
use super::tool::{ToolChoice, ToolDefinition, find_tool};
use super::usage::{Usage, UsageLimiter};
use crate::error::{ConfigError, ProviderError};

/// Tool result sent for a valid call whose sibling failed validation.
const ACCEPTED_ACK: &str =
    "Accepted. Do not repeat this call; only fix the calls that reported errors.";

/// Routes requests to providers and owns every retry decision.
pub struct LlmGateway {
    providers: HashMap<ProviderKind, Arc<dyn LlmProvider>>,
    tracker: RateLimitTracker,
    limits: RetryLimits,
    backoff: BackoffPolicy,
    usage_limiter: Option<Arc<dyn UsageLimiter>>,
}

impl std::fmt::Debug for LlmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmGateway")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("limits", &self.limits)
            .field("usage_limiter", &self.usage_limiter.is_some())
            .finish_non_exhaustive()
    }
}

/// Terminal outcome of the transport layers.
struct DispatchFailure {
    kind: LlmErrorKind,
    message: String,
}

/// Per-call accumulator carried through every retry layer.
struct CallState {
    started: Instant,
    started_at: DateTime<Utc>,
    usage: Usage,
    accepted: Vec<ToolUse>,
    invalid_responses: Vec<Message>,
}

impl CallState {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            usage: Usage::default(),
            accepted: Vec::new(),
            invalid_responses: Vec::new(),
        }
    }

    fn timing(&self) -> Timing {
        Timing {
            started_at: self.started_at,
            elapsed: self.started.elapsed(),
        }
    }

    fn fail(
        self,
        request: &LlmRequest,
        kind: LlmErrorKind,
        message: impl Into<String>,
        last_message: Option<Message>,
    ) -> LlmResponse {
        LlmResponse::Error(LlmFailure {
            kind,
            message: message.into(),
            usage: self.usage,
            model: request.model,
            last_message,
            timing: self.timing(),
            accepted_tool_uses: self.accepted,
            invalid_responses: self.invalid_responses,
        })
    }
}

/// Result of checking one tool use.
enum Verdict {
    Valid(ToolUse),
    Invalid { id: String, feedback: String },
}

impl LlmGateway {
    /// Creates a gateway with no providers.
    #[must_use]
    pub fn new(limits: RetryLimits) -> Self {
        Self {
            providers: HashMap::new(),
            tracker: RateLimitTracker::new(),
            backoff: BackoffPolicy::new(limits.backoff_base, limits.backoff_cap),
            limits,
            usage_limiter: None,
        }
    }

    /// Creates a gateway with every vendor adapter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an HTTP client cannot be built.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        Ok(create_providers(config)?
            .into_iter()
            .fold(Self::new(config.retry), Self::with_provider))
    }

    /// Registers (or replaces) the adapter for its provider.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Installs a caller-side quota check.
    #[must_use]
    pub fn with_usage_limiter(mut self, limiter: Arc<dyn UsageLimiter>) -> Self {
        self.usage_limiter = Some(limiter);
        self
    }

    /// Retry limits in effect.
    #[must_use]
    pub const fn limits(&self) -> RetryLimits {
        self.limits
    }

    /// Routes currently configured for `kind`.
    #[must_use]
    pub fn routes_for(&self, kind: ProviderKind) -> Vec<ProviderRoute> {
        self.providers
            .get(&kind)
            .map(|p| p.routes())
            .unwrap_or_default()
    }

    /// Sends a request and returns a provider-agnostic response.
    ///
    /// Observes `cancel` before and after every outbound request and during
    /// every wait; a cancelled call returns `aborted`.
    #[instrument(skip_all, fields(model = %request.model))]
    pub async fn get_response(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> LlmResponse {
        if let Some(limiter) = &self.usage_limiter
            && !limiter.allows(request.model).await
        {
            info!("usage limit reached before dispatch");
            return CallState::new().fail(
                request,
                LlmErrorKind::ExceededUsageLimit,
                "caller usage limit exceeded",
                None,
            );
        }

        let response = self.respond(request, cancel).await;

        if let Some(limiter) = &self.usage_limiter {
            limiter.record(request.model, response.usage()).await;
        }
        response
    }

    async fn respond(&self, request: &LlmRequest, cancel: &CancellationToken) -> LlmResponse {
        let mut state = CallState::new();

        let Some(provider) = self.providers.get(&request.model.provider()) else {
            return state.fail(
                request,
                LlmErrorKind::InternalError,
                format!("no adapter registered for {}", request.model.provider()),
                None,
            );
        };
        let routes = provider.routes();
        if routes.is_empty() {
            return state.fail(
                request,
                LlmErrorKind::InternalError,
                format!("{} has no configured credentials", request.model.provider()),
                None,
            );
        }

        let tool_required = request.tool_choice.is_some() && !request.tools.is_empty();
        let mut attempt_request = request.clone();
        let max_attempts = self.limits.max_validation_retries + 1;

        for attempt in 1..=max_attempts {
            let (reply, route) = match self
                .dispatch(&attempt_request, provider.as_ref(), &routes, cancel)
                .await
            {
                Ok(ok) => ok,
                Err(failure) => return state.fail(request, failure.kind, failure.message, None),
            };
            state.usage += reply.usage;
            debug!(
                attempt,
                %route,
                stop_reason = ?reply.stop_reason,
                input_tokens = reply.usage.input_tokens,
                output_tokens = reply.usage.output_tokens,
                "provider replied"
            );

            if reply.stop_reason == StopReason::Length {
                warn!(attempt, "model hit its output token limit");
                return state.fail(
                    request,
                    LlmErrorKind::MaxTokens,
                    format!("output exceeded {} tokens", request.max_tokens),
                    Some(reply.message),
                );
            }

            let tool_uses: Vec<ToolUse> = reply.message.tool_uses().into_iter().cloned().collect();

            if tool_uses.is_empty() {
                if tool_required && state.accepted.is_empty() {
                    warn!(attempt, "tool call required but none was made");
                    state.invalid_responses.push(reply.message.clone());
                    if attempt < max_attempts {
                        push_missing_tool_feedback(&mut attempt_request, reply.message, request);
                    }
                    continue;
                }
                return succeed(request, state, reply, route, Vec::new());
            }

            let verdicts: Vec<Verdict> = tool_uses
                .iter()
                .map(|t| check_tool_use(t, &request.tools))
                .collect();
            let invalid_count = verdicts
                .iter()
                .filter(|v| matches!(v, Verdict::Invalid { .. }))
                .count();

            if invalid_count == 0 {
                let valid = verdicts
                    .into_iter()
                    .filter_map(|v| match v {
                        Verdict::Valid(t) => Some(t),
                        Verdict::Invalid { .. } => None,
                    })
                    .collect();
                return succeed(request, state, reply, route, valid);
            }

            warn!(
                attempt,
                invalid_count,
                total = verdicts.len(),
                "tool input failed validation"
            );
            let mut results = Vec::with_capacity(verdicts.len());
            for verdict in verdicts {
                match verdict {
                    Verdict::Valid(tool_use) => {
                        results.push(tool_result(&tool_use.id, ACCEPTED_ACK, false));
                        state.accepted.push(tool_use);
                    }
                    Verdict::Invalid { id, feedback } => {
                        results.push(tool_result(&id, &feedback, true));
                    }
                }
            }
            state.invalid_responses.push(reply.message.clone());
            attempt_request.messages.push(reply.message);
            attempt_request.messages.push(Message::User { content: results });
        }

        let accepted = state.accepted.len();
        state.fail(
            request,
            LlmErrorKind::ExceededMaximumRetries,
            format!(
                "tool input still invalid after {max_attempts} attempts ({accepted} calls accepted)"
            ),
            None,
        )
    }

    /// Sends one logical request, absorbing rate limits and server errors.
    async fn dispatch(
        &self,
        request: &LlmRequest,
        provider: &dyn LlmProvider,
        routes: &[ProviderRoute],
        cancel: &CancellationToken,
    ) -> Result<(ProviderReply, ProviderRoute), DispatchFailure> {
        let aborted = || DispatchFailure {
            kind: LlmErrorKind::Aborted,
            message: "call cancelled".to_string(),
        };
        let mut route = self.tracker.preferred(routes).ok_or_else(|| DispatchFailure {
            kind: LlmErrorKind::InternalError,
            message: "no routes configured".to_string(),
        })?;
        let mut rate_limit_retries = 0_u32;
        let mut server_retries = 0_u32;

        loop {
            if cancel.is_cancelled() {
                return Err(aborted());
            }
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(aborted()),
                result = provider.complete(request, route) => result,
            };
            if cancel.is_cancelled() {
                return Err(aborted());
            }

            match result {
                Ok(reply) => {
                    self.tracker.clear(route);
                    return Ok((reply, route));
                }
                Err(ProviderError::RateLimited { reset_after, .. }) => {
                    rate_limit_retries += 1;
                    if rate_limit_retries > self.limits.max_rate_limit_retries {
                        warn!(%route, rate_limit_retries, "rate-limit retries exhausted");
                        return Err(DispatchFailure {
                            kind: LlmErrorKind::ExceededMaximumRetries,
                            message: format!(
                                "rate limited {} times",
                                self.limits.max_rate_limit_retries + 1
                            ),
                        });
                    }
                    let reset = reset_after.unwrap_or(self.limits.default_rate_limit_wait);
                    self.tracker.mark_limited(route, reset);
                    match self.tracker.after_rate_limit(
                        route,
                        routes,
                        self.limits.default_rate_limit_wait,
                    ) {
                        RouteDecision::Switch(next) => {
                            info!(
                                from = %route,
                                to = %next,
                                rate_limit_retries,
                                "rate limited, switching route"
                            );
                            route = next;
                        }
                        RouteDecision::Wait(next, wait) => {
                            info!(
                                %route,
                                next = %next,
                                wait_ms = millis(wait),
                                rate_limit_retries,
                                "rate limited, waiting"
                            );
                            if !sleep_or_cancel(wait, cancel).await {
                                return Err(aborted());
                            }
                            route = next;
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    server_retries += 1;
                    if server_retries > self.limits.max_server_retries {
                        warn!(%route, server_retries, error = %err, "server retries exhausted");
                        return Err(DispatchFailure {
                            kind: LlmErrorKind::ExceededMaximumRetries,
                            message: format!("{err} (after {server_retries} attempts)"),
                        });
                    }
                    let delay = self.backoff.delay(server_retries);
                    warn!(
                        %route,
                        server_retries,
                        delay_ms = millis(delay),
                        error = %err,
                        "transient provider error, backing off"
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return Err(aborted());
                    }
                    route = self.tracker.alternate(route, routes);
                }
                Err(err @ ProviderError::NotConfigured { .. }) => {
                    return Err(DispatchFailure {
                        kind: LlmErrorKind::InternalError,
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(%route, error = %err, "provider rejected request");
                    return Err(DispatchFailure {
                        kind: LlmErrorKind::ApiError,
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

/// Builds the success value, merging tool calls accepted on earlier
/// attempts ahead of this reply's content.
fn succeed(
    request: &LlmRequest,
    state: CallState,
    reply: ProviderReply,
    route: ProviderRoute,
    validated: Vec<ToolUse>,
) -> LlmResponse {
    let Message::Assistant { content } = reply.message else {
        return state.fail(
            request,
            LlmErrorKind::InternalError,
            "provider returned a non-assistant message",
            None,
        );
    };

    let mut validated = validated.into_iter();
    let mut merged: Vec<AssistantContent> = state
        .accepted
        .iter()
        .cloned()
        .map(AssistantContent::ToolUse)
        .collect();
    for block in content {
        match block {
            // Replace raw inputs with their sanitized form, in order.
            AssistantContent::ToolUse(raw) => {
                merged.push(AssistantContent::ToolUse(validated.next().unwrap_or(raw)));
            }
            text @ AssistantContent::Text { .. } => merged.push(text),
        }
    }

    let has_tool_uses = merged
        .iter()
        .any(|b| matches!(b, AssistantContent::ToolUse(_)));
    let stop_reason = if has_tool_uses {
        StopReason::ToolUse
    } else {
        reply.stop_reason
    };
    debug!(
        %route,
        total_tokens = state.usage.total_tokens,
        elapsed_ms = millis(state.started.elapsed()),
        "gateway call succeeded"
    );
    LlmResponse::Ok(LlmSuccess {
        stop_reason,
        usage: state.usage,
        message: Message::Assistant { content: merged },
        route,
        model: request.model,
        timing: state.timing(),
    })
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn check_tool_use(tool_use: &ToolUse, tools: &[ToolDefinition]) -> Verdict {
    let Some(definition) = find_tool(tools, &tool_use.name) else {
        let available: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        return Verdict::Invalid {
            id: tool_use.id.clone(),
            feedback: format!(
                "Unknown tool \"{}\". Available tools: {}.",
                tool_use.name,
                available.join(", ")
            ),
        };
    };
    match sanitize_then_validate(&tool_use.input, definition) {
        Ok(input) => Verdict::Valid(ToolUse {
            input,
            ..tool_use.clone()
        }),
        Err(errors) => Verdict::Invalid {
            id: tool_use.id.clone(),
            feedback: format!(
                "Invalid input for {}:\n{}\nCorrect the input and call the tool again.",
                tool_use.name,
                describe_errors(&errors)
            ),
        },
    }
}

fn push_missing_tool_feedback(attempt_request: &mut LlmRequest, reply: Message, request: &LlmRequest) {
    let has_content = matches!(&reply, Message::Assistant { content } if !content.is_empty());
    if has_content {
        attempt_request.messages.push(reply);
    }
    let instruction = match &request.tool_choice {
        Some(ToolChoice::Tool(name)) => format!("You must respond by calling the {name} tool."),
        _ => {
            let names: Vec<&str> = request.tools.iter().map(|t| t.name.as_str()).collect();
            format!(
                "You must respond by calling one of the available tools: {}.",
                names.join(", ")
            )
        }
    };
    attempt_request.messages.push(Message::User {
        content: vec![UserContent::Text { text: instruction }],
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::message::{assistant_message, assistant_tool_uses, user_message};
    use crate::llm::model::LlmModel;
    use crate::llm::usage::TokenBudget;
    use crate::testing::{ScriptedProvider, ScriptedReply};
    use serde_json::json;
    use std::time::Duration;

    fn fast_limits() -> RetryLimits {
        RetryLimits {
            default_rate_limit_wait: Duration::from_millis(5),
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
            ..RetryLimits::default()
        }
    }

    fn search_tool() -> ToolDefinition {
        ToolDefinition::new(
            "webSearch",
            "Search",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        )
    }

    fn call(id: &str, input: serde_json::Value) -> ToolUse {
        ToolUse {
            id: id.to_string(),
            name: "webSearch".to_string(),
            input,
        }
    }

    fn request() -> LlmRequest {
        LlmRequest::new(LlmModel::Gpt4o, vec![user_message("go")])
            .tools(vec![search_tool()])
            .tool_choice(ToolChoice::Required)
    }

    fn gateway(provider: &Arc<ScriptedProvider>) -> LlmGateway {
        LlmGateway::new(fast_limits()).with_provider(provider.clone())
    }

    #[tokio::test]
    async fn test_plain_success() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::OpenAi).reply(
            ScriptedReply::message(assistant_tool_uses(vec![call("a", json!({"query": "q"}))])),
        ));
        let response = gateway(&provider)
            .get_response(&request(), &CancellationToken::new())
            .await;
        let ok = response.into_result().unwrap_or_else(|_| unreachable!());
        assert_eq!(ok.stop_reason, StopReason::ToolUse);
        assert_eq!(ok.tool_uses().len(), 1);
        assert_eq!(ok.route, ProviderRoute::OpenAi);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_provider_is_internal_error() {
        let gateway = LlmGateway::new(fast_limits());
        let response = gateway
            .get_response(&request(), &CancellationToken::new())
            .await;
        assert_eq!(response.error_kind(), Some(LlmErrorKind::InternalError));
    }

    #[tokio::test]
    async fn test_validation_retry_preserves_accepted_calls() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::OpenAi)
                .reply(ScriptedReply::message(assistant_tool_uses(vec![
                    call("good", json!({"query": "first"})),
                    call("bad", json!({"qry": "oops"})),
                ])))
                .reply(ScriptedReply::message(assistant_tool_uses(vec![call(
                    "fixed",
                    json!({"query": "second"}),
                )]))),
        );
        let response = gateway(&provider)
            .get_response(&request(), &CancellationToken::new())
            .await;
        let ok = response.into_result().unwrap_or_else(|_| unreachable!());
        let ids: Vec<&str> = ok.tool_uses().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["good", "fixed"]);

        // The resubmission carries the corrective tool results.
        let second = provider.request(1).unwrap_or_else(|| unreachable!());
        let Some(Message::User { content }) = second.messages.last() else {
            unreachable!()
        };
        assert!(content.iter().any(|c| matches!(
            c,
            UserContent::ToolResult { tool_use_id, is_error: true, .. } if tool_use_id == "bad"
        )));
        assert!(content.iter().any(|c| matches!(
            c,
            UserContent::ToolResult { tool_use_id, is_error: false, .. } if tool_use_id == "good"
        )));
    }

    #[tokio::test]
    async fn test_validation_exhaustion_attempt_count() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::OpenAi).repeat(ScriptedReply::message(
                assistant_tool_uses(vec![call("x", json!({"wrong": 1}))]),
            )),
        );
        let response = gateway(&provider)
            .get_response(&request(), &CancellationToken::new())
            .await;
        assert_eq!(
            response.error_kind(),
            Some(LlmErrorKind::ExceededMaximumRetries)
        );
        assert_eq!(provider.calls(), 4);
        if let LlmResponse::Error(failure) = response {
            assert_eq!(failure.invalid_responses.len(), 4);
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_gets_feedback() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::OpenAi)
                .reply(ScriptedReply::message(assistant_tool_uses(vec![ToolUse {
                    id: "u".to_string(),
                    name: "browse".to_string(),
                    input: json!({}),
                }])))
                .reply(ScriptedReply::message(assistant_tool_uses(vec![call(
                    "v",
                    json!({"query": "q"}),
                )]))),
        );
        let response = gateway(&provider)
            .get_response(&request(), &CancellationToken::new())
            .await;
        assert!(response.is_ok());
        let second = provider.request(1).unwrap_or_else(|| unreachable!());
        let feedback = second.messages.last().map(|m| format!("{m:?}")).unwrap_or_default();
        assert!(feedback.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_required_tool_not_called_is_retried() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::OpenAi)
                .reply(ScriptedReply::message(assistant_message("I think I am done")))
                .reply(ScriptedReply::message(assistant_tool_uses(vec![call(
                    "a",
                    json!({"query": "q"}),
                )]))),
        );
        let response = gateway(&provider)
            .get_response(&request(), &CancellationToken::new())
            .await;
        assert!(response.is_ok());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_sanitized_input_is_returned() {
        let tool = search_tool().with_sanitizer(crate::llm::tool::Sanitizer::common());
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::OpenAi).reply(
            ScriptedReply::message(assistant_tool_uses(vec![call(
                "a",
                json!({"properties": {"query": "q"}}),
            )])),
        ));
        let request = LlmRequest::new(LlmModel::Gpt4o, vec![user_message("go")]).tools(vec![tool]);
        let ok = gateway(&provider)
            .get_response(&request, &CancellationToken::new())
            .await
            .into_result()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(ok.tool_uses()[0].input, json!({"query": "q"}));
    }

    #[tokio::test]
    async fn test_length_is_max_tokens_failure() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::OpenAi).reply(
            ScriptedReply::message(assistant_message("truncated")).stop(StopReason::Length),
        ));
        let response = gateway(&provider)
            .get_response(&request(), &CancellationToken::new())
            .await;
        let LlmResponse::Error(failure) = response else {
            unreachable!()
        };
        assert_eq!(failure.kind, LlmErrorKind::MaxTokens);
        assert!(failure.last_message.is_some());
        assert!(!failure.usage.is_zero());
    }

    #[tokio::test]
    async fn test_anthropic_rate_limit_alternates_routes() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::Anthropic)
                .with_routes(vec![
                    ProviderRoute::AnthropicDirect,
                    ProviderRoute::AnthropicManaged,
                ])
                .reply(ScriptedReply::rate_limited(Some(Duration::from_secs(30))))
                .reply(ScriptedReply::message(assistant_tool_uses(vec![call(
                    "a",
                    json!({"query": "q"}),
                )]))),
        );
        let request = LlmRequest::new(LlmModel::ClaudeHaiku45, vec![user_message("go")])
            .tools(vec![search_tool()]);
        let started = Instant::now();
        let ok = gateway(&provider)
            .get_response(&request, &CancellationToken::new())
            .await
            .into_result()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(ok.route, ProviderRoute::AnthropicManaged);
        assert_eq!(
            provider.routes_used(),
            vec![ProviderRoute::AnthropicDirect, ProviderRoute::AnthropicManaged]
        );
        // Failover is immediate, not a 30 s wait.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::Google)
                .repeat(ScriptedReply::rate_limited(Some(Duration::from_millis(1)))),
        );
        let request = LlmRequest::new(LlmModel::Gemini25Flash, vec![user_message("go")]);
        let response = gateway(&provider)
            .get_response(&request, &CancellationToken::new())
            .await;
        assert_eq!(
            response.error_kind(),
            Some(LlmErrorKind::ExceededMaximumRetries)
        );
        assert_eq!(provider.calls(), 11);
    }

    #[tokio::test]
    async fn test_server_errors_back_off_then_succeed() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::OpenAi)
                .reply(ScriptedReply::server_error(503))
                .reply(ScriptedReply::server_error(500))
                .reply(ScriptedReply::message(assistant_message("fine"))),
        );
        let request = LlmRequest::new(LlmModel::Gpt4o, vec![user_message("go")]);
        let ok = gateway(&provider)
            .get_response(&request, &CancellationToken::new())
            .await
            .into_result()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(ok.stop_reason, StopReason::Stop);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_api_error_not_retried() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::OpenAi).repeat(ScriptedReply::api_error(400)),
        );
        let request = LlmRequest::new(LlmModel::Gpt4o, vec![user_message("go")]);
        let response = gateway(&provider)
            .get_response(&request, &CancellationToken::new())
            .await;
        assert_eq!(response.error_kind(), Some(LlmErrorKind::ApiError));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::OpenAi)
                .repeat(ScriptedReply::message(assistant_message("never"))),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let response = gateway(&provider).get_response(&request(), &cancel).await;
        assert_eq!(response.error_kind(), Some(LlmErrorKind::Aborted));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_during_rate_limit_wait() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::OpenAi)
                .repeat(ScriptedReply::rate_limited(Some(Duration::from_secs(60)))),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let request = LlmRequest::new(LlmModel::Gpt4o, vec![user_message("go")]);
        let response = gateway(&provider).get_response(&request, &cancel).await;
        assert_eq!(response.error_kind(), Some(LlmErrorKind::Aborted));
    }

    #[tokio::test]
    async fn test_usage_limiter_blocks_dispatch() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::OpenAi)
                .repeat(ScriptedReply::message(assistant_message("ok")).usage(Usage::new(60, 40))),
        );
        let budget = Arc::new(TokenBudget::new(100));
        let gateway = gateway(&provider).with_usage_limiter(budget.clone());
        let request = LlmRequest::new(LlmModel::Gpt4o, vec![user_message("go")]);
        assert!(gateway.get_response(&request, &CancellationToken::new()).await.is_ok());
        assert_eq!(budget.spent(), 100);
        let second = gateway.get_response(&request, &CancellationToken::new()).await;
        assert_eq!(second.error_kind(), Some(LlmErrorKind::ExceededUsageLimit));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_usage_accumulates_over_validation_retries() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::OpenAi)
                .reply(
                    ScriptedReply::message(assistant_tool_uses(vec![call("x", json!({}))]))
                        .usage(Usage::new(10, 2)),
                )
                .reply(
                    ScriptedReply::message(assistant_tool_uses(vec![call("y", json!({"query": "q"}))]))
                        .usage(Usage::new(15, 3)),
                ),
        );
        let response = gateway(&provider)
            .get_response(&request(), &CancellationToken::new())
            .await;
        assert_eq!(response.usage(), Usage::new(25, 5));
    }
}
