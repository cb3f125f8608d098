//! Anthropic messages API adapter.
//!
//! Serves two routes with the same body shape: the direct API
//! (`x-api-key`) and the managed-inference endpoint on Amazon Bedrock
//! (bearer token, model id in the URL, `anthropic_version` in the body).

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::http::{self, RawResponse};
use crate::error::{ConfigError, ProviderError};
use crate::llm::config::GatewayConfig;
use crate::llm::message::{AssistantContent, Message, ToolUse, UserContent};
use crate::llm::provider::{LlmProvider, ProviderKind, ProviderReply, ProviderRoute};
use crate::llm::response::{LlmRequest, StopReason};
use crate::llm::tool::ToolChoice;
use crate::llm::usage::Usage;

/// API version header for the direct route.
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Body field required by the managed route.
const MANAGED_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

const RESET_HEADERS: [&str; 4] = [
    "anthropic-ratelimit-requests-reset",
    "anthropic-ratelimit-tokens-reset",
    "anthropic-ratelimit-input-tokens-reset",
    "anthropic-ratelimit-output-tokens-reset",
];

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    anthropic_version: Option<&'static str>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<WireToolChoice<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: Vec<WireBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock<'a> {
    Text {
        text: &'a str,
    },
    ToolUse {
        id: &'a str,
        name: &'a str,
        input: &'a Value,
    },
    ToolResult {
        tool_use_id: &'a str,
        content: &'a str,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireToolChoice<'a> {
    Any,
    Tool { name: &'a str },
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<WireResponseBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Anthropic adapter covering the direct and managed routes.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    managed_token: Option<String>,
    managed_base_url: String,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("routes", &self.routes())
            .field("base_url", &self.base_url)
            .field("managed_base_url", &self.managed_base_url)
            .finish_non_exhaustive()
    }
}

impl AnthropicProvider {
    /// Creates the adapter from gateway configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the HTTP client cannot be built.
    pub fn new(config: &GatewayConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: http::build_client(config.timeout)?,
            api_key: config.anthropic_api_key.clone(),
            base_url: config.anthropic_base_url().trim_end_matches('/').to_string(),
            managed_token: config.managed_token.clone(),
            managed_base_url: config.managed_base_url().trim_end_matches('/').to_string(),
        })
    }

    fn build_body(request: &LlmRequest, route: ProviderRoute) -> Result<Value, ProviderError> {
        let managed = route == ProviderRoute::AnthropicManaged;
        let wire = WireRequest {
            model: (!managed).then(|| request.model.id()),
            anthropic_version: managed.then_some(MANAGED_ANTHROPIC_VERSION),
            max_tokens: request.max_tokens,
            system: request.system_prompt.as_deref(),
            messages: request.messages.iter().map(convert_message).collect(),
            tools: request
                .tools
                .iter()
                .map(|t| WireTool {
                    name: &t.name,
                    description: &t.description,
                    input_schema: &t.input_schema,
                })
                .collect(),
            tool_choice: if request.tools.is_empty() {
                None
            } else {
                request.tool_choice.as_ref().map(|choice| match choice {
                    ToolChoice::Required => WireToolChoice::Any,
                    ToolChoice::Tool(name) => WireToolChoice::Tool { name },
                })
            },
            temperature: request.temperature,
        };
        let mut body = serde_json::to_value(&wire).map_err(|e| ProviderError::Api {
            route,
            status: None,
            message: format!("could not encode request: {e}"),
        })?;
        merge_passthrough(&mut body, &request.passthrough);
        Ok(body)
    }

    fn request_for(
        &self,
        request: &LlmRequest,
        route: ProviderRoute,
    ) -> Result<reqwest::RequestBuilder, ProviderError> {
        let body = Self::build_body(request, route)?;
        match route {
            ProviderRoute::AnthropicDirect => {
                let key = self.api_key.as_deref().ok_or_else(|| ProviderError::NotConfigured {
                    route,
                    message: "ANTHROPIC_API_KEY is not set".to_string(),
                })?;
                Ok(self
                    .client
                    .post(format!("{}/v1/messages", self.base_url))
                    .header("x-api-key", key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&body))
            }
            ProviderRoute::AnthropicManaged => {
                let token = self
                    .managed_token
                    .as_deref()
                    .ok_or_else(|| ProviderError::NotConfigured {
                        route,
                        message: "managed-inference token is not set".to_string(),
                    })?;
                let model_id = request.model.managed_id().ok_or_else(|| {
                    ProviderError::NotConfigured {
                        route,
                        message: format!("{} has no managed-inference id", request.model),
                    }
                })?;
                Ok(self
                    .client
                    .post(format!("{}/model/{model_id}/invoke", self.managed_base_url))
                    .bearer_auth(token)
                    .json(&body))
            }
            other => Err(ProviderError::NotConfigured {
                route: other,
                message: "not an Anthropic route".to_string(),
            }),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn routes(&self) -> Vec<ProviderRoute> {
        let mut routes = Vec::with_capacity(2);
        if self.api_key.is_some() {
            routes.push(ProviderRoute::AnthropicDirect);
        }
        if self.managed_token.is_some() {
            routes.push(ProviderRoute::AnthropicManaged);
        }
        routes
    }

    async fn complete(
        &self,
        request: &LlmRequest,
        route: ProviderRoute,
    ) -> Result<ProviderReply, ProviderError> {
        let raw = http::send(self.request_for(request, route)?, route).await?;
        if !raw.status.is_success() {
            return Err(classify_error(&raw, route));
        }
        let wire: WireResponse = http::decode(&raw, route)?;
        Ok(convert_response(wire))
    }
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

fn convert_message(message: &Message) -> WireMessage<'_> {
    match message {
        Message::User { content } => WireMessage {
            role: "user",
            content: content
                .iter()
                .map(|block| match block {
                    UserContent::Text { text } => WireBlock::Text { text },
                    UserContent::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => WireBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error: *is_error,
                    },
                })
                .collect(),
        },
        Message::Assistant { content } => WireMessage {
            role: "assistant",
            content: content
                .iter()
                .map(|block| match block {
                    AssistantContent::Text { text } => WireBlock::Text { text },
                    AssistantContent::ToolUse(tool_use) => WireBlock::ToolUse {
                        id: &tool_use.id,
                        name: &tool_use.name,
                        input: &tool_use.input,
                    },
                })
                .collect(),
        },
    }
}

fn convert_response(wire: WireResponse) -> ProviderReply {
    let content: Vec<AssistantContent> = wire
        .content
        .into_iter()
        .filter_map(|block| match block {
            WireResponseBlock::Text { text } => Some(AssistantContent::Text { text }),
            WireResponseBlock::ToolUse { id, name, input } => {
                Some(AssistantContent::ToolUse(ToolUse { id, name, input }))
            }
            WireResponseBlock::Other => None,
        })
        .collect();
    ProviderReply {
        message: Message::Assistant { content },
        stop_reason: map_stop_reason(wire.stop_reason.as_deref()),
        usage: Usage::new(wire.usage.input_tokens, wire.usage.output_tokens),
    }
}

fn map_stop_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens" | "model_context_window_exceeded") => StopReason::Length,
        Some("stop_sequence") => StopReason::StopSequence,
        Some("refusal") => StopReason::ContentFilter,
        _ => StopReason::Stop,
    }
}

fn classify_error(raw: &RawResponse, route: ProviderRoute) -> ProviderError {
    let throttled = raw.status == StatusCode::TOO_MANY_REQUESTS
        || raw
            .headers
            .get("x-amzn-errortype")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("ThrottlingException"));
    if throttled {
        return ProviderError::RateLimited {
            route,
            reset_after: reset_after(&raw.headers),
        };
    }
    http::status_error(raw, route)
}

/// Reset delay from `retry-after`, else the latest `anthropic-ratelimit-*-reset`.
fn reset_after(headers: &HeaderMap) -> Option<Duration> {
    http::retry_after(headers).or_else(|| {
        let now = Utc::now();
        http::max_header_duration(headers, &RESET_HEADERS, |v| http::until_rfc3339(v, now))
    })
}

pub(super) fn merge_passthrough(body: &mut Value, passthrough: &Map<String, Value>) {
    if let Value::Object(map) = body {
        for (key, value) in passthrough {
            map.insert(key.clone(), value.clone());
        }
    }
}
