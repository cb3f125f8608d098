//! Gateway retry bounds and usage accounting.

use std::sync::Arc;

use proptest::prelude::*;
use quarry::llm::message::{assistant_tool_uses, user_message};
use quarry::llm::{
    LlmErrorKind, LlmGateway, LlmModel, LlmRequest, ProviderKind, RetryLimits, ToolChoice,
    ToolDefinition, ToolUse, Usage,
};
use quarry::testing::{ScriptedProvider, ScriptedReply, fast_retry_limits};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

fn lookup_tool() -> ToolDefinition {
    ToolDefinition::new(
        "lookup",
        "Look something up",
        json!({
            "type": "object",
            "properties": {"term": {"type": "string", "minLength": 1}},
            "required": ["term"]
        }),
    )
}

fn reply(input: Value, usage: Usage) -> ScriptedReply {
    ScriptedReply::message(assistant_tool_uses(vec![ToolUse {
        id: format!("call_{}", usage.input_tokens),
        name: "lookup".to_string(),
        input,
    }]))
    .usage(usage)
}

fn request() -> LlmRequest {
    LlmRequest::new(LlmModel::Gpt4o, vec![user_message("find it")])
        .tools(vec![lookup_tool()])
        .tool_choice(ToolChoice::Required)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|_| unreachable!())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Invalid replies are resubmitted at most `max_validation_retries`
    /// times, and every attempt's usage is counted.
    #[test]
    fn validation_retries_are_bounded(invalid in 0_u32..6, max_retries in 0_u32..4) {
        let mut provider = ScriptedProvider::new(ProviderKind::OpenAi);
        for i in 0..invalid {
            provider = provider.reply(reply(json!({"term": ""}), Usage::new(u64::from(i) + 1, 1)));
        }
        provider = provider.repeat(reply(json!({"term": "rust"}), Usage::new(100, 1)));
        let provider = Arc::new(provider);
        let limits = RetryLimits {
            max_validation_retries: max_retries,
            ..fast_retry_limits()
        };
        let gateway = LlmGateway::new(limits).with_provider(provider.clone());

        let response = runtime().block_on(gateway.get_response(&request(), &CancellationToken::new()));

        let expected_calls = invalid.min(max_retries) + 1;
        prop_assert_eq!(provider.calls(), expected_calls as usize);
        if invalid <= max_retries {
            prop_assert!(response.is_ok());
        } else {
            prop_assert_eq!(response.error_kind(), Some(LlmErrorKind::ExceededMaximumRetries));
        }

        let spent: Usage = (0..expected_calls)
            .map(|i| if i < invalid { Usage::new(u64::from(i) + 1, 1) } else { Usage::new(100, 1) })
            .sum();
        prop_assert_eq!(response.usage(), spent);
    }
}

#[tokio::test]
async fn test_server_errors_exhaust_to_failure() {
    let provider = Arc::new(
        ScriptedProvider::new(ProviderKind::OpenAi).repeat(ScriptedReply::server_error(503)),
    );
    let gateway = LlmGateway::new(fast_retry_limits()).with_provider(provider.clone());
    let response = gateway
        .get_response(&request(), &CancellationToken::new())
        .await;
    assert_eq!(
        response.error_kind(),
        Some(LlmErrorKind::ExceededMaximumRetries)
    );
    let limits = fast_retry_limits();
    assert_eq!(provider.calls(), limits.max_server_retries as usize + 1);
}
