//! Single-purpose extraction agents.
//!
//! Each agent makes one forced tool call (plus bounded corrective cycles)
//! and returns typed results:
//!
//! - [`summaries`]: entities mentioned on a page
//! - [`claims`]: validated facts about those entities
//! - [`proposal`]: structured properties for one entity

pub mod claims;
pub mod proposal;
pub mod summaries;

pub use claims::{ClaimRejection, infer_claims, validate_claim};
pub use proposal::propose_entity;
pub use summaries::infer_entity_summaries;

use serde::de::DeserializeOwned;

use crate::error::AgentError;
use crate::llm::LlmSuccess;

/// Decodes every call to `tool` in `success`.
///
/// # Errors
///
/// Returns [`AgentError::ToolInput`] if an input does not match `T`.
pub(crate) fn decode_calls<T: DeserializeOwned>(
    success: &LlmSuccess,
    tool: &str,
) -> Result<Vec<T>, AgentError> {
    success
        .tool_uses()
        .into_iter()
        .filter(|u| u.name == tool)
        .map(|u| {
            serde_json::from_value(u.input.clone()).map_err(|e| AgentError::ToolInput {
                tool: tool.to_string(),
                message: e.to_string(),
            })
        })
        .collect()
}
