//! Provider-agnostic request and response types.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::message::{Message, ToolUse};
use super::model::LlmModel;
use super::provider::ProviderRoute;
use super::tool::{ToolChoice, ToolDefinition};
use super::usage::Usage;

/// Default output budget when a request does not set one.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// A request to the gateway.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Target model (decides the provider).
    pub model: LlmModel,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
    /// Conversation so far.
    pub messages: Vec<Message>,
    /// Tools offered to the model.
    pub tools: Vec<ToolDefinition>,
    /// Tool-use constraint; `None` lets the model decide.
    pub tool_choice: Option<ToolChoice>,
    /// Output token budget.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Vendor-specific fields merged verbatim into the request body.
    pub passthrough: Map<String, Value>,
}

impl LlmRequest {
    /// Creates a request with defaults for everything but model and messages.
    #[must_use]
    pub fn new(model: LlmModel, messages: Vec<Message>) -> Self {
        Self {
            model,
            system_prompt: None,
            messages,
            tools: Vec::new(),
            tool_choice: None,
            max_tokens: DEFAULT_MAX_TOKENS.min(model.max_output_tokens()),
            temperature: None,
            passthrough: Map::new(),
        }
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn system(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the offered tools.
    #[must_use]
    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the tool-use constraint.
    #[must_use]
    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    /// Sets the output token budget (clamped to the model maximum).
    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.min(self.model.max_output_tokens());
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Why a model turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of turn.
    Stop,
    /// The model requested tool calls.
    ToolUse,
    /// Output token limit reached.
    Length,
    /// Output was filtered by the vendor.
    ContentFilter,
    /// A custom stop sequence matched.
    StopSequence,
}

/// Wall-clock accounting for one gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    /// When the call started.
    pub started_at: DateTime<Utc>,
    /// Total time including retries and waits.
    pub elapsed: Duration,
}

/// Successful gateway response.
#[derive(Debug, Clone)]
pub struct LlmSuccess {
    /// Why the final turn ended.
    pub stop_reason: StopReason,
    /// Usage accumulated over every attempt.
    pub usage: Usage,
    /// Final assistant message, with accepted tool calls from earlier
    /// attempts merged in.
    pub message: Message,
    /// Route that produced the final turn.
    pub route: ProviderRoute,
    /// Model that served the call.
    pub model: LlmModel,
    /// Timing.
    pub timing: Timing,
}

impl LlmSuccess {
    /// Tool uses in the final message.
    #[must_use]
    pub fn tool_uses(&self) -> Vec<&ToolUse> {
        self.message.tool_uses()
    }
}

/// Terminal failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LlmErrorKind {
    /// Unrecoverable vendor fault.
    ApiError,
    /// A bounded retry loop ran out.
    ExceededMaximumRetries,
    /// The model hit its output limit.
    MaxTokens,
    /// Caller quota exhausted before dispatch.
    ExceededUsageLimit,
    /// Cancelled by the caller.
    Aborted,
    /// Gateway-side failure (no provider, missing credentials).
    InternalError,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ApiError => "api-error",
            Self::ExceededMaximumRetries => "exceeded-maximum-retries",
            Self::MaxTokens => "max-tokens",
            Self::ExceededUsageLimit => "exceeded-usage-limit",
            Self::Aborted => "aborted",
            Self::InternalError => "internal-error",
        })
    }
}

/// Failed gateway response.
///
/// Carries whatever partial work the call produced so callers can log it or
/// charge for it.
#[derive(Debug, Clone)]
pub struct LlmFailure {
    /// Failure kind.
    pub kind: LlmErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Usage accumulated before the failure.
    pub usage: Usage,
    /// Model the call targeted.
    pub model: LlmModel,
    /// The raw final message, when one was produced (`max-tokens`).
    pub last_message: Option<Message>,
    /// Tool calls that validated before the failure.
    pub accepted_tool_uses: Vec<ToolUse>,
    /// Responses rejected by validation, oldest first.
    pub invalid_responses: Vec<Message>,
    /// Timing.
    pub timing: Timing,
}

/// Gateway result. Never an `Err`; callers branch on the variant.
#[derive(Debug, Clone)]
pub enum LlmResponse {
    /// The call succeeded.
    Ok(LlmSuccess),
    /// The call failed terminally.
    Error(LlmFailure),
}

impl LlmResponse {
    /// Usage regardless of outcome.
    #[must_use]
    pub const fn usage(&self) -> Usage {
        match self {
            Self::Ok(ok) => ok.usage,
            Self::Error(err) => err.usage,
        }
    }

    /// Returns `true` for the `Ok` variant.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Failure kind, if any.
    #[must_use]
    pub const fn error_kind(&self) -> Option<LlmErrorKind> {
        match self {
            Self::Ok(_) => None,
            Self::Error(err) => Some(err.kind),
        }
    }

    /// Converts into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the failure when the call did not succeed.
    pub fn into_result(self) -> Result<LlmSuccess, LlmFailure> {
        match self {
            Self::Ok(ok) => Ok(ok),
            Self::Error(err) => Err(err),
        }
    }
}
