//! Entity-summary extraction from one page.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::decode_calls;
use crate::agent::context::ResearchEnv;
use crate::agent::entity::{EntitySummary, EntityTypeDefinition, LocalEntityId};
use crate::agent::prompt::build_summaries_prompt;
use crate::error::AgentError;
use crate::llm::message::user_message;
use crate::llm::{LlmRequest, Sanitizer, ToolChoice, ToolDefinition, Usage};
use crate::services::WebPage;

/// Tool the model answers with.
pub const REGISTER_ENTITY_SUMMARIES: &str = "registerEntitySummaries";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Registration {
    entity_summaries: Vec<RegisteredSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisteredSummary {
    name: String,
    summary: String,
    entity_type_id: String,
}

fn register_tool(entity_types: &[EntityTypeDefinition]) -> ToolDefinition {
    let ids: Vec<&str> = entity_types.iter().map(|t| t.entity_type_id.as_str()).collect();
    ToolDefinition::new(
        REGISTER_ENTITY_SUMMARIES,
        "Register the entities mentioned in the text.",
        json!({
            "type": "object",
            "properties": {
                "entitySummaries": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string", "minLength": 1},
                            "summary": {"type": "string"},
                            "entityTypeId": {"type": "string", "enum": ids}
                        },
                        "required": ["name", "summary", "entityTypeId"]
                    }
                }
            },
            "required": ["entitySummaries"]
        }),
    )
    .with_sanitizer(Sanitizer::common())
}

/// Finds the entities of the run's types mentioned on `page`.
///
/// Each entity gets a fresh local id. Repeats of the same name and type
/// within the page are collapsed.
///
/// # Errors
///
/// Returns [`AgentError`] if the call fails or its input cannot be decoded.
pub async fn infer_entity_summaries(
    env: &ResearchEnv,
    goal: &str,
    page: &WebPage,
    cancel: &CancellationToken,
    usage: &mut Usage,
) -> Result<Vec<EntitySummary>, AgentError> {
    if env.entity_types.is_empty() || page.text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let request = LlmRequest::new(
        env.config.models.extraction,
        vec![user_message(&build_summaries_prompt(goal, page, &env.entity_types))],
    )
    .system(env.prompts.entity_summaries.clone())
    .tools(vec![register_tool(&env.entity_types)])
    .tool_choice(ToolChoice::tool(REGISTER_ENTITY_SUMMARIES))
    .max_tokens(env.config.max_tokens);

    let success = env.call("entity-summaries", &request, cancel, usage).await?;
    let registrations: Vec<Registration> = decode_calls(&success, REGISTER_ENTITY_SUMMARIES)?;

    let mut seen = HashSet::new();
    let summaries: Vec<EntitySummary> = registrations
        .into_iter()
        .flat_map(|r| r.entity_summaries)
        .filter(|s| seen.insert((s.name.trim().to_lowercase(), s.entity_type_id.clone())))
        .map(|s| EntitySummary {
            local_id: LocalEntityId::new(),
            name: s.name.trim().to_string(),
            summary: s.summary,
            entity_type_id: s.entity_type_id,
        })
        .collect();
    debug!(url = %page.url, count = summaries.len(), "inferred entity summaries");
    Ok(summaries)
}
