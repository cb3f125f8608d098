//! Turns an entity summary and its claims into a structured proposal.

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use super::decode_calls;
use crate::agent::context::ResearchEnv;
use crate::agent::entity::{Claim, EntitySummary, ProposedEntity};
use crate::agent::prompt::build_proposal_prompt;
use crate::error::AgentError;
use crate::llm::message::user_message;
use crate::llm::{LlmRequest, Sanitizer, ToolChoice, ToolDefinition, Usage};

/// Tool the model answers with.
pub const PROPOSE_ENTITY: &str = "proposeEntity";

#[derive(Debug, Deserialize)]
struct Proposal {
    properties: Map<String, Value>,
}

fn propose_tool(properties_schema: &Value) -> ToolDefinition {
    ToolDefinition::new(
        PROPOSE_ENTITY,
        "Propose the entity's property values.",
        json!({
            "type": "object",
            "properties": {"properties": properties_schema},
            "required": ["properties"]
        }),
    )
    .with_sanitizer(Sanitizer::stringified_json())
}

/// Proposes property values for `summary` from `claims`.
///
/// # Errors
///
/// Returns [`AgentError::InvalidGoal`] if the summary's entity type is not
/// part of the run, or the call's error.
pub async fn propose_entity(
    env: &ResearchEnv,
    summary: &EntitySummary,
    claims: &[&Claim],
    cancel: &CancellationToken,
    usage: &mut Usage,
) -> Result<ProposedEntity, AgentError> {
    let entity_type = env
        .entity_type(&summary.entity_type_id)
        .ok_or_else(|| AgentError::InvalidGoal {
            message: format!("unknown entity type {}", summary.entity_type_id),
        })?;
    let request = LlmRequest::new(
        env.config.models.proposal,
        vec![user_message(&build_proposal_prompt(summary, claims, entity_type))],
    )
    .system(env.prompts.proposal.clone())
    .tools(vec![propose_tool(&entity_type.properties_schema)])
    .tool_choice(ToolChoice::tool(PROPOSE_ENTITY))
    .max_tokens(env.config.max_tokens);

    let success = env.call("proposal", &request, cancel, usage).await?;
    let properties = decode_calls::<Proposal>(&success, PROPOSE_ENTITY)?
        .into_iter()
        .next()
        .map(|p| p.properties)
        .unwrap_or_default();

    Ok(ProposedEntity {
        local_entity_id: summary.local_id,
        entity_type_id: summary.entity_type_id.clone(),
        name: summary.name.clone(),
        summary: summary.summary.clone(),
        properties,
        claim_ids: claims.iter().map(|c| c.claim_id).collect(),
    })
}
