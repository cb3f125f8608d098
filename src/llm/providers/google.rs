//! Google generative language API adapter.
//!
//! Gemini accepts only a subset of JSON Schema and has no tool-call ids, so
//! this adapter rewrites schemas, synthesizes call ids and recovers
//! function names for tool results from the conversation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::anthropic::merge_passthrough;
use super::http::{self, RawResponse};
use crate::error::{ConfigError, ProviderError};
use crate::llm::config::GatewayConfig;
use crate::llm::message::{AssistantContent, Message, ToolUse, UserContent};
use crate::llm::provider::{LlmProvider, ProviderKind, ProviderReply, ProviderRoute};
use crate::llm::response::{LlmRequest, StopReason};
use crate::llm::tool::ToolChoice;
use crate::llm::usage::Usage;

const ROUTE: ProviderRoute = ProviderRoute::Google;

/// `$ref` expansion depth before a schema is treated as recursive.
const MAX_INLINE_DEPTH: usize = 16;

/// Keys Gemini rejects in function parameter schemas.
const UNSUPPORTED_SCHEMA_KEYS: [&str; 5] = [
    "additionalProperties",
    "$defs",
    "definitions",
    "$schema",
    "$id",
];

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTools>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<Value>,
    generation_config: WireGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTools {
    function_declarations: Vec<WireFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct WireFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    usage_metadata: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    content: Option<WireContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Google Gemini provider.
pub struct GoogleProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl std::fmt::Debug for GoogleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleProvider")
            .field("base_url", &self.base_url)
            .field("configured", &self.api_key.is_some())
            .finish_non_exhaustive()
    }
}

impl GoogleProvider {
    /// Creates a new provider from gateway configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the HTTP client cannot be built.
    pub fn new(config: &GatewayConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: http::build_client(config.timeout)?,
            api_key: config.google_api_key.clone(),
            base_url: config.google_base_url().trim_end_matches('/').to_string(),
        })
    }

    fn build_request(request: &LlmRequest) -> WireRequest {
        let names = tool_names_by_id(&request.messages);
        let contents = request
            .messages
            .iter()
            .map(|m| convert_message(m, &names))
            .filter(|c| !c.parts.is_empty())
            .collect();

        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![WireTools {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| WireFunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: to_gemini_schema(&t.input_schema),
                    })
                    .collect(),
            }]
        };

        let tool_config = if request.tools.is_empty() {
            None
        } else {
            request.tool_choice.as_ref().map(|choice| match choice {
                ToolChoice::Required => json!({"functionCallingConfig": {"mode": "ANY"}}),
                ToolChoice::Tool(name) => json!({
                    "functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": [name]}
                }),
            })
        };

        WireRequest {
            contents,
            system_instruction: request.system_prompt.as_ref().map(|s| WireContent {
                role: None,
                parts: vec![WirePart {
                    text: Some(s.clone()),
                    ..WirePart::default()
                }],
            }),
            tools,
            tool_config,
            generation_config: WireGenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        }
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn routes(&self) -> Vec<ProviderRoute> {
        if self.api_key.is_some() {
            vec![ROUTE]
        } else {
            Vec::new()
        }
    }

    async fn complete(
        &self,
        request: &LlmRequest,
        route: ProviderRoute,
    ) -> Result<ProviderReply, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured {
                route,
                message: "GOOGLE_AI_API_KEY is not set".to_string(),
            })?;
        let mut body =
            serde_json::to_value(Self::build_request(request)).map_err(|e| ProviderError::Api {
                route,
                status: None,
                message: format!("could not encode request: {e}"),
            })?;
        merge_passthrough(&mut body, &request.passthrough);

        let builder = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url,
                request.model.id()
            ))
            .header("x-goog-api-key", key)
            .json(&body);
        let raw = http::send(builder, route).await?;
        if !raw.status.is_success() {
            return Err(classify_error(&raw));
        }
        let wire: WireResponse = http::decode(&raw, route)?;
        convert_response(wire)
    }
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// Maps every tool-use id in the conversation to its function name.
fn tool_names_by_id(messages: &[Message]) -> HashMap<&str, &str> {
    messages
        .iter()
        .flat_map(Message::tool_uses)
        .map(|t| (t.id.as_str(), t.name.as_str()))
        .collect()
}

fn convert_message(message: &Message, names: &HashMap<&str, &str>) -> WireContent {
    match message {
        Message::User { content } => WireContent {
            role: Some("user".to_string()),
            parts: content
                .iter()
                .map(|block| match block {
                    UserContent::Text { text } => WirePart {
                        text: Some(text.clone()),
                        ..WirePart::default()
                    },
                    UserContent::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => WirePart {
                        function_response: Some(WireFunctionResponse {
                            name: names
                                .get(tool_use_id.as_str())
                                .map_or_else(|| tool_use_id.clone(), |n| (*n).to_string()),
                            response: if *is_error {
                                json!({"error": content})
                            } else {
                                json!({"content": content})
                            },
                        }),
                        ..WirePart::default()
                    },
                })
                .collect(),
        },
        Message::Assistant { content } => WireContent {
            role: Some("model".to_string()),
            parts: content
                .iter()
                .map(|block| match block {
                    AssistantContent::Text { text } => WirePart {
                        text: Some(text.clone()),
                        ..WirePart::default()
                    },
                    AssistantContent::ToolUse(tool_use) => WirePart {
                        function_call: Some(WireFunctionCall {
                            name: tool_use.name.clone(),
                            args: tool_use.input.clone(),
                        }),
                        ..WirePart::default()
                    },
                })
                .collect(),
        },
    }
}

fn convert_response(wire: WireResponse) -> Result<ProviderReply, ProviderError> {
    let usage = Usage::new(
        wire.usage_metadata.prompt_token_count,
        wire.usage_metadata.candidates_token_count,
    );
    let candidate = wire
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Decode {
            route: ROUTE,
            message: "response has no candidates".to_string(),
        })?;

    let mut content = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(text) = part.text.filter(|t| !t.is_empty()) {
            content.push(AssistantContent::Text { text });
        }
        if let Some(call) = part.function_call {
            content.push(AssistantContent::ToolUse(ToolUse {
                id: format!("call_{}", Uuid::new_v4().simple()),
                name: call.name,
                input: if call.args.is_null() {
                    Value::Object(Map::new())
                } else {
                    call.args
                },
            }));
        }
    }

    let has_calls = content
        .iter()
        .any(|c| matches!(c, AssistantContent::ToolUse(_)));
    let stop_reason = match candidate.finish_reason.as_deref() {
        _ if has_calls => StopReason::ToolUse,
        Some("MAX_TOKENS") => StopReason::Length,
        Some(
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
            | "IMAGE_SAFETY",
        ) => StopReason::ContentFilter,
        _ => StopReason::Stop,
    };

    Ok(ProviderReply {
        message: Message::Assistant { content },
        stop_reason,
        usage,
    })
}

/// Rewrites a JSON Schema into the subset Gemini accepts.
///
/// Local `$ref`s are inlined, `const` becomes a one-value `enum` and
/// unsupported keywords are dropped.
#[must_use]
pub fn to_gemini_schema(schema: &Value) -> Value {
    rewrite(schema, schema, 0)
}

fn rewrite(node: &Value, root: &Value, depth: usize) -> Value {
    match node {
        Value::Object(map) => {
            if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
                let target = reference
                    .strip_prefix('#')
                    .and_then(|pointer| root.pointer(pointer));
                return match target {
                    Some(target) if depth < MAX_INLINE_DEPTH => rewrite(target, root, depth + 1),
                    _ => json!({"type": "object"}),
                };
            }
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                if UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()) {
                    continue;
                }
                if key == "const" {
                    out.insert("enum".to_string(), Value::Array(vec![value.clone()]));
                    continue;
                }
                out.insert(key.clone(), rewrite(value, root, depth));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| rewrite(v, root, depth)).collect()),
        other => other.clone(),
    }
}

fn classify_error(raw: &RawResponse) -> ProviderError {
    if raw.status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::RateLimited {
            route: ROUTE,
            reset_after: retry_delay(&raw.body).or_else(|| http::retry_after(&raw.headers)),
        };
    }
    http::status_error(raw, ROUTE)
}

/// Reads `RetryInfo.retryDelay` (e.g. `"13s"`) from an error body.
fn retry_delay(body: &str) -> Option<Duration> {
    let json: Value = serde_json::from_str(body).ok()?;
    json.pointer("/error/details")?
        .as_array()?
        .iter()
        .filter(|detail| {
            detail
                .get("@type")
                .and_then(Value::as_str)
                .is_some_and(|t| t.ends_with("google.rpc.RetryInfo"))
        })
        .find_map(|detail| detail.get("retryDelay").and_then(Value::as_str))
        .and_then(http::parse_go_duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::message::{assistant_tool_uses, tool_result, user_message};
    use crate::llm::model::LlmModel;
    use crate::llm::tool::ToolDefinition;
    use reqwest::header::HeaderMap;

    #[test]
    fn test_schema_rewrite() {
        let schema = json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "entity": {"$ref": "#/$defs/entity"},
                "kind": {"const": "person"}
            },
            "$defs": {
                "entity": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {"name": {"type": "string"}}
                }
            }
        });
        let rewritten = to_gemini_schema(&schema);
        assert_eq!(
            rewritten,
            json!({
                "type": "object",
                "properties": {
                    "entity": {"type": "object", "properties": {"name": {"type": "string"}}},
                    "kind": {"enum": ["person"]}
                }
            })
        );
    }

    #[test]
    fn test_recursive_ref_is_cut() {
        let schema = json!({
            "$defs": {"node": {"type": "object", "properties": {"child": {"$ref": "#/$defs/node"}}}},
            "$ref": "#/$defs/node"
        });
        let rewritten = to_gemini_schema(&schema);
        assert_eq!(rewritten["type"], "object");
    }

    #[test]
    fn test_function_response_name_recovered() {
        let request = LlmRequest::new(
            LlmModel::Gemini25Flash,
            vec![
                user_message("go"),
                assistant_tool_uses(vec![ToolUse {
                    id: "call_abc".to_string(),
                    name: "webSearch".to_string(),
                    input: json!({"query": "q"}),
                }]),
                Message::User {
                    content: vec![tool_result("call_abc", "no results", true)],
                },
            ],
        )
        .tools(vec![ToolDefinition::new("webSearch", "Search", json!({"type": "object"}))])
        .tool_choice(ToolChoice::tool("webSearch"));
        let body = serde_json::to_value(GoogleProvider::build_request(&request)).unwrap_or_default();
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["functionCall"]["name"], "webSearch");
        let response = &body["contents"][2]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "webSearch");
        assert_eq!(response["response"]["error"], "no results");
        assert_eq!(
            body["toolConfig"]["functionCallingConfig"]["allowedFunctionNames"][0],
            "webSearch"
        );
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 4096);
    }

    #[test]
    fn test_convert_response_synthesizes_ids() {
        let wire: WireResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "a", "args": {"x": 1}}},
                    {"functionCall": {"name": "b"}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 9, "candidatesTokenCount": 4, "totalTokenCount": 13}
        }))
        .unwrap_or_else(|_| unreachable!());
        let reply = convert_response(wire).unwrap_or_else(|_| unreachable!());
        let uses = reply.message.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_ne!(uses[0].id, uses[1].id);
        assert_eq!(uses[1].input, json!({}));
        assert_eq!(reply.stop_reason, StopReason::ToolUse);
        assert_eq!(reply.usage.total_tokens, 13);
    }

    #[test]
    fn test_finish_reason_mapping() {
        let wire = |reason: &str| WireResponse {
            candidates: vec![WireCandidate {
                content: Some(WireContent {
                    role: None,
                    parts: vec![WirePart {
                        text: Some("x".to_string()),
                        ..WirePart::default()
                    }],
                }),
                finish_reason: Some(reason.to_string()),
            }],
            usage_metadata: WireUsage::default(),
        };
        let stop = |reason: &str| convert_response(wire(reason)).map(|r| r.stop_reason).ok();
        assert_eq!(stop("MAX_TOKENS"), Some(StopReason::Length));
        assert_eq!(stop("SAFETY"), Some(StopReason::ContentFilter));
        assert_eq!(stop("STOP"), Some(StopReason::Stop));
    }

    #[test]
    fn test_retry_delay_from_body() {
        let raw = RawResponse {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers: HeaderMap::new(),
            body: json!({
                "error": {
                    "code": 429,
                    "status": "RESOURCE_EXHAUSTED",
                    "details": [
                        {"@type": "type.googleapis.com/google.rpc.QuotaFailure"},
                        {"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "13s"}
                    ]
                }
            })
            .to_string(),
        };
        assert!(matches!(
            classify_error(&raw),
            ProviderError::RateLimited { reset_after: Some(d), .. } if d == Duration::from_secs(13)
        ));
    }
}
