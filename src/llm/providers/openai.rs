//! `OpenAI`-compatible chat completions adapter.
//!
//! Request and response bodies use the `async-openai` wire types; the
//! request itself goes through `reqwest` so rate-limit headers and status
//! codes stay visible to the gateway. Works with any
//! `OpenAI`-compatible endpoint via the base URL override.

use std::time::Duration;

use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionNamedToolChoice,
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestToolMessage,
    ChatCompletionRequestToolMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, ChatCompletionTool, ChatCompletionToolChoiceOption,
    ChatCompletionToolType, CreateChatCompletionRequest, CreateChatCompletionResponse,
    FinishReason, FunctionCall, FunctionName, FunctionObject,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde_json::Value;

use super::anthropic::merge_passthrough;
use super::http::{self, RawResponse};
use crate::error::{ConfigError, ProviderError};
use crate::llm::config::GatewayConfig;
use crate::llm::message::{AssistantContent, Message, ToolUse, UserContent};
use crate::llm::provider::{LlmProvider, ProviderKind, ProviderReply, ProviderRoute};
use crate::llm::response::{LlmRequest, StopReason};
use crate::llm::tool::ToolChoice;
use crate::llm::usage::Usage;

const ROUTE: ProviderRoute = ProviderRoute::OpenAi;

const RESET_HEADERS: [&str; 2] = ["x-ratelimit-reset-requests", "x-ratelimit-reset-tokens"];

/// Prefix marking a tool result that reports a failure (the wire format has
/// no error flag).
const ERROR_RESULT_PREFIX: &str = "Error: ";

/// `OpenAI`-compatible LLM provider.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("base_url", &self.base_url)
            .field("configured", &self.api_key.is_some())
            .finish_non_exhaustive()
    }
}

impl OpenAiProvider {
    /// Creates a new provider from gateway configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the HTTP client cannot be built.
    pub fn new(config: &GatewayConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: http::build_client(config.timeout)?,
            api_key: config.openai_api_key.clone(),
            base_url: config.openai_base_url().trim_end_matches('/').to_string(),
        })
    }

    /// Converts one of our messages into one or more `OpenAI` messages.
    ///
    /// Tool results become `tool` role messages ahead of any user text.
    fn convert_message(msg: &Message) -> Vec<ChatCompletionRequestMessage> {
        match msg {
            Message::User { content } => {
                let mut out = Vec::new();
                let mut texts = Vec::new();
                for block in content {
                    match block {
                        UserContent::Text { text } => texts.push(text.as_str()),
                        UserContent::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            let text = if *is_error {
                                format!("{ERROR_RESULT_PREFIX}{content}")
                            } else {
                                content.clone()
                            };
                            out.push(ChatCompletionRequestMessage::Tool(
                                ChatCompletionRequestToolMessage {
                                    content: ChatCompletionRequestToolMessageContent::Text(text),
                                    tool_call_id: tool_use_id.clone(),
                                },
                            ));
                        }
                    }
                }
                if !texts.is_empty() {
                    out.push(ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessage {
                            content: ChatCompletionRequestUserMessageContent::Text(
                                texts.join("\n"),
                            ),
                            name: None,
                        },
                    ));
                }
                out
            }
            Message::Assistant { content } => {
                let mut texts = Vec::new();
                let mut tool_calls = Vec::new();
                for block in content {
                    match block {
                        AssistantContent::Text { text } => texts.push(text.as_str()),
                        AssistantContent::ToolUse(tool_use) => {
                            tool_calls.push(ChatCompletionMessageToolCall {
                                id: tool_use.id.clone(),
                                r#type: ChatCompletionToolType::Function,
                                function: FunctionCall {
                                    name: tool_use.name.clone(),
                                    arguments: tool_use.input.to_string(),
                                },
                            });
                        }
                    }
                }
                let content = (!texts.is_empty()).then(|| {
                    ChatCompletionRequestAssistantMessageContent::Text(texts.join("\n"))
                });
                #[allow(deprecated)]
                let message =
                    ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                        content,
                        name: None,
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                        refusal: None,
                        audio: None,
                        function_call: None,
                    });
                vec![message]
            }
        }
    }

    /// Builds an `OpenAI` chat completion request from our generic request.
    fn build_request(request: &LlmRequest) -> CreateChatCompletionRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessage {
                    content: ChatCompletionRequestSystemMessageContent::Text(system.clone()),
                    name: None,
                },
            ));
        }
        messages.extend(request.messages.iter().flat_map(Self::convert_message));

        let tools = (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .map(|td| ChatCompletionTool {
                    r#type: ChatCompletionToolType::Function,
                    function: FunctionObject {
                        name: td.name.clone(),
                        description: Some(td.description.clone()),
                        parameters: Some(td.input_schema.clone()),
                        strict: None,
                    },
                })
                .collect()
        });

        let tool_choice = if request.tools.is_empty() {
            None
        } else {
            request.tool_choice.as_ref().map(|choice| match choice {
                ToolChoice::Required => ChatCompletionToolChoiceOption::Required,
                ToolChoice::Tool(name) => {
                    ChatCompletionToolChoiceOption::Named(ChatCompletionNamedToolChoice {
                        r#type: ChatCompletionToolType::Function,
                        function: FunctionName { name: name.clone() },
                    })
                }
            })
        };

        CreateChatCompletionRequest {
            model: request.model.id().to_string(),
            messages,
            temperature: request.temperature,
            max_completion_tokens: Some(request.max_tokens),
            tools,
            tool_choice,
            ..Default::default()
        }
    }

    fn convert_response(response: CreateChatCompletionResponse) -> Result<ProviderReply, ProviderError> {
        let usage = response
            .usage
            .map_or_else(Usage::default, |u| {
                Usage::new(u64::from(u.prompt_tokens), u64::from(u.completion_tokens))
            });
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Decode {
                route: ROUTE,
                message: "response has no choices".to_string(),
            })?;

        let mut content = Vec::new();
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            content.push(AssistantContent::Text { text });
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            // Unparsable arguments stay a string so validation reports them.
            let input = serde_json::from_str(&call.function.arguments)
                .unwrap_or(Value::String(call.function.arguments));
            content.push(AssistantContent::ToolUse(ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            }));
        }

        let stop_reason = match choice.finish_reason {
            Some(FinishReason::ToolCalls | FinishReason::FunctionCall) => StopReason::ToolUse,
            Some(FinishReason::Length) => StopReason::Length,
            Some(FinishReason::ContentFilter) => StopReason::ContentFilter,
            Some(FinishReason::Stop) | None => {
                if content.iter().any(|c| matches!(c, AssistantContent::ToolUse(_))) {
                    StopReason::ToolUse
                } else {
                    StopReason::Stop
                }
            }
        };

        Ok(ProviderReply {
            message: Message::Assistant { content },
            stop_reason,
            usage,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
                message: "OPENAI_API_KEY is not set".to_string(),
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
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&body);
        let raw = http::send(builder, route).await?;
        if !raw.status.is_success() {
            return Err(classify_error(&raw));
        }
        let response: CreateChatCompletionResponse = http::decode(&raw, route)?;
        Self::convert_response(response)
    }
}

fn classify_error(raw: &RawResponse) -> ProviderError {
    if raw.status == StatusCode::TOO_MANY_REQUESTS {
        // Quota exhaustion shares the status code but never resets on its own.
        let quota = serde_json::from_str::<Value>(&raw.body)
            .ok()
            .and_then(|json| {
                json.pointer("/error/code")
                    .or_else(|| json.pointer("/error/type"))
                    .and_then(Value::as_str)
                    .map(|code| code == "insufficient_quota")
            })
            .unwrap_or(false);
        if quota {
            return ProviderError::Api {
                route: ROUTE,
                status: Some(429),
                message: http::error_message(&raw.body),
            };
        }
        return ProviderError::RateLimited {
            route: ROUTE,
            reset_after: reset_after(&raw.headers),
        };
    }
    http::status_error(raw, ROUTE)
}

fn reset_after(headers: &HeaderMap) -> Option<Duration> {
    http::retry_after(headers)
        .or_else(|| http::max_header_duration(headers, &RESET_HEADERS, http::parse_go_duration))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::llm::message::{self, tool_result};
    use crate::llm::model::LlmModel;
    use crate::llm::tool::ToolDefinition;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_convert_user_message() {
        let converted = OpenAiProvider::convert_message(&message::user_message("hello"));
        assert_eq!(converted.len(), 1);
        assert!(matches!(converted[0], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn test_convert_tool_results_precede_text() {
        let msg = Message::User {
            content: vec![
                UserContent::Text {
                    text: "continue".to_string(),
                },
                tool_result("call_1", "missing field", true),
            ],
        };
        let converted = OpenAiProvider::convert_message(&msg);
        assert_eq!(converted.len(), 2);
        if let ChatCompletionRequestMessage::Tool(tool) = &converted[0] {
            assert_eq!(tool.tool_call_id, "call_1");
            assert!(matches!(
                &tool.content,
                ChatCompletionRequestToolMessageContent::Text(t) if t.starts_with(ERROR_RESULT_PREFIX)
            ));
        } else {
            panic!("Expected Tool message");
        }
        assert!(matches!(converted[1], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn test_convert_assistant_with_tool_calls() {
        let msg = message::assistant_tool_uses(vec![ToolUse {
            id: "call_1".to_string(),
            name: "webSearch".to_string(),
            input: json!({"query": "q"}),
        }]);
        let converted = OpenAiProvider::convert_message(&msg);
        if let ChatCompletionRequestMessage::Assistant(a) = &converted[0] {
            let calls = a.tool_calls.as_deref().unwrap_or_default();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].function.arguments, r#"{"query":"q"}"#);
            assert!(a.content.is_none());
        } else {
            panic!("Expected Assistant message");
        }
    }

    #[test]
    fn test_build_request_tool_choice() {
        let request = LlmRequest::new(LlmModel::Gpt4o, vec![message::user_message("test")])
            .system("sys")
            .tools(vec![ToolDefinition::new("complete", "Finish", json!({"type": "object"}))])
            .tool_choice(ToolChoice::tool("complete"));
        let built = OpenAiProvider::build_request(&request);
        assert_eq!(built.messages.len(), 2);
        assert!(matches!(
            built.tool_choice,
            Some(ChatCompletionToolChoiceOption::Named(ref named)) if named.function.name == "complete"
        ));
        assert_eq!(built.tools.as_ref().map_or(0, Vec::len), 1);

        let required = OpenAiProvider::build_request(&request.tool_choice(ToolChoice::Required));
        assert!(matches!(
            required.tool_choice,
            Some(ChatCompletionToolChoiceOption::Required)
        ));
    }

    #[test]
    fn test_build_request_without_tools_drops_choice() {
        let request = LlmRequest::new(LlmModel::Gpt4oMini, vec![message::user_message("test")])
            .tool_choice(ToolChoice::Required);
        let built = OpenAiProvider::build_request(&request);
        assert!(built.tools.is_none());
        assert!(built.tool_choice.is_none());
    }

    fn response_json(finish_reason: &str, arguments: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "webSearch", "arguments": arguments}
                    }]
                },
                "finish_reason": finish_reason
            }],
            "usage": {"prompt_tokens": 20, "completion_tokens": 5, "total_tokens": 25}
        })
    }

    #[test]
    fn test_convert_response_tool_calls() {
        let response: CreateChatCompletionResponse =
            serde_json::from_value(response_json("tool_calls", r#"{"query":"q"}"#))
                .unwrap_or_else(|e| panic!("decode: {e}"));
        let reply = OpenAiProvider::convert_response(response).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(reply.stop_reason, StopReason::ToolUse);
        assert_eq!(reply.usage, Usage::new(20, 5));
        assert_eq!(reply.message.tool_uses()[0].input, json!({"query": "q"}));
    }

    #[test]
    fn test_convert_response_bad_arguments_kept_as_string() {
        let response: CreateChatCompletionResponse =
            serde_json::from_value(response_json("tool_calls", "{not json"))
                .unwrap_or_else(|e| panic!("decode: {e}"));
        let reply = OpenAiProvider::convert_response(response).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(reply.message.tool_uses()[0].input, json!("{not json"));
    }

    #[test]
    fn test_convert_response_length() {
        let response: CreateChatCompletionResponse =
            serde_json::from_value(response_json("length", "{}"))
                .unwrap_or_else(|e| panic!("decode: {e}"));
        let reply = OpenAiProvider::convert_response(response).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(reply.stop_reason, StopReason::Length);
    }

    #[test]
    fn test_classify_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-reset-requests", HeaderValue::from_static("120ms"));
        headers.insert("x-ratelimit-reset-tokens", HeaderValue::from_static("1.5s"));
        let raw = RawResponse {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers,
            body: r#"{"error": {"message": "Rate limit reached", "code": "rate_limit_exceeded"}}"#
                .to_string(),
        };
        match classify_error(&raw) {
            ProviderError::RateLimited { reset_after, .. } => {
                assert_eq!(reset_after, Some(Duration::from_millis(1500)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_insufficient_quota() {
        let raw = RawResponse {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers: HeaderMap::new(),
            body: r#"{"error": {"message": "You exceeded your quota", "code": "insufficient_quota"}}"#
                .to_string(),
        };
        assert!(matches!(
            classify_error(&raw),
            ProviderError::Api { status: Some(429), .. }
        ));
    }
}
