//! Claim extraction with structural validation.
//!
//! A claim is accepted only if it opens with its subject's name, ends with
//! its object's name (when it has one) and states a single fact. Rejected
//! claims are sent back with reasons; valid ones from every cycle are kept.

use std::collections::HashMap;
use std::fmt::{self, Write};

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::context::ResearchEnv;
use crate::agent::entity::{Claim, EntitySummary, LocalEntityId};
use crate::agent::prompt::build_claims_prompt;
use crate::error::AgentError;
use crate::llm::message::{tool_result, user_message};
use crate::llm::{LlmRequest, Message, Sanitizer, ToolChoice, ToolDefinition, Usage};
use crate::services::WebPage;

/// Tool the model answers with.
pub const SUBMIT_CLAIMS: &str = "submitClaims";

/// Corrective cycles after the first submission.
pub const MAX_CLAIM_CORRECTIONS: u32 = 3;

/// Why a submitted claim was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimRejection {
    /// Subject id is not one of the subject entities.
    UnknownSubject(String),
    /// Object id is not a known entity.
    UnknownObject(String),
    /// Text does not open with the subject's name.
    MissingSubjectName(String),
    /// Text does not end with the object's name.
    MissingObjectName(String),
    /// Text joins several facts with "and".
    Compound,
}

impl fmt::Display for ClaimRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSubject(id) => {
                write!(f, "subjectEntityLocalId {id} is not one of the subject entities")
            }
            Self::UnknownObject(id) => write!(f, "objectEntityLocalId {id} is not a known entity"),
            Self::MissingSubjectName(name) => {
                write!(f, "the claim must begin with the subject's name \"{name}\"")
            }
            Self::MissingObjectName(name) => {
                write!(f, "the claim must end with the object's name \"{name}\"")
            }
            Self::Compound => f.write_str(
                "the claim joins several facts with 'and'; split it into separate claims",
            ),
        }
    }
}

/// Checks the structure of a claim's text.
///
/// # Errors
///
/// Returns the first rule the text breaks.
pub fn validate_claim(
    text: &str,
    subject: &EntitySummary,
    object: Option<&EntitySummary>,
) -> Result<(), ClaimRejection> {
    let lowered = text.trim().to_lowercase();
    let subject_name = subject.name.trim().to_lowercase();
    if !lowered.starts_with(&subject_name) {
        return Err(ClaimRejection::MissingSubjectName(subject.name.clone()));
    }
    let mut remainder = lowered.trim_end_matches('.').trim_end().to_string();
    if let Some(object) = object {
        let object_name = object.name.trim().to_lowercase();
        if !remainder.ends_with(&object_name) {
            return Err(ClaimRejection::MissingObjectName(object.name.clone()));
        }
        remainder.truncate(remainder.len() - object_name.len());
    }
    let remainder = &remainder[subject_name.len().min(remainder.len())..];
    let compound = remainder
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| word == "and");
    if compound {
        return Err(ClaimRejection::Compound);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Submission {
    claims: Vec<SubmittedClaim>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmittedClaim {
    text: String,
    subject_entity_local_id: String,
    #[serde(default)]
    object_entity_local_id: Option<String>,
    #[serde(default)]
    prepositional_phrases: Vec<String>,
}

fn submit_tool(subjects: &[EntitySummary], objects: &[EntitySummary]) -> ToolDefinition {
    let subject_ids: Vec<String> = subjects.iter().map(|s| s.local_id.to_string()).collect();
    let object_ids: Vec<String> = subjects
        .iter()
        .chain(objects)
        .map(|s| s.local_id.to_string())
        .collect();
    ToolDefinition::new(
        SUBMIT_CLAIMS,
        "Submit the claims found in the text.",
        json!({
            "type": "object",
            "properties": {
                "claims": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "text": {"type": "string", "minLength": 1},
                            "subjectEntityLocalId": {"type": "string", "enum": subject_ids},
                            "objectEntityLocalId": {"type": "string", "enum": object_ids},
                            "prepositionalPhrases": {"type": "array", "items": {"type": "string"}}
                        },
                        "required": ["text", "subjectEntityLocalId"]
                    }
                }
            },
            "required": ["claims"]
        }),
    )
    .with_sanitizer(Sanitizer::common())
}

/// Extracts claims about `subjects` from `page`.
///
/// Claims may relate a subject to another subject or to one of
/// `potential_objects`. Runs at most [`MAX_CLAIM_CORRECTIONS`] corrective
/// cycles; claims still invalid afterwards are dropped.
///
/// # Errors
///
/// Returns [`AgentError`] if the first call fails. Failures of corrective
/// cycles keep the claims accepted so far.
pub async fn infer_claims(
    env: &ResearchEnv,
    goal: &str,
    page: &WebPage,
    subjects: &[EntitySummary],
    potential_objects: &[EntitySummary],
    cancel: &CancellationToken,
    usage: &mut Usage,
) -> Result<Vec<Claim>, AgentError> {
    if subjects.is_empty() {
        return Ok(Vec::new());
    }
    let by_subject: HashMap<LocalEntityId, &EntitySummary> =
        subjects.iter().map(|s| (s.local_id, s)).collect();
    let by_object: HashMap<LocalEntityId, &EntitySummary> = subjects
        .iter()
        .chain(potential_objects)
        .map(|s| (s.local_id, s))
        .collect();

    let tool = submit_tool(subjects, potential_objects);
    let mut messages = vec![user_message(&build_claims_prompt(
        goal,
        page,
        subjects,
        potential_objects,
    ))];
    let mut accepted = Vec::new();

    for cycle in 0..=MAX_CLAIM_CORRECTIONS {
        let request = LlmRequest::new(env.config.models.extraction, messages.clone())
            .system(env.prompts.claims.clone())
            .tools(vec![tool.clone()])
            .tool_choice(ToolChoice::tool(SUBMIT_CLAIMS))
            .max_tokens(env.config.max_tokens);
        let success = match env.call("claims", &request, cancel, usage).await {
            Ok(success) => success,
            Err(err) if cycle == 0 => return Err(err),
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(err) => {
                warn!(url = %page.url, cycle, error = %err, "claim correction failed, keeping accepted claims");
                break;
            }
        };

        let mut feedback = Vec::new();
        let mut rejected_total = 0_usize;
        for tool_use in success.tool_uses() {
            if tool_use.name != SUBMIT_CLAIMS {
                continue;
            }
            let submission: Submission = match serde_json::from_value(tool_use.input.clone()) {
                Ok(submission) => submission,
                Err(e) => {
                    rejected_total += 1;
                    feedback.push(tool_result(&tool_use.id, &format!("Invalid input: {e}"), true));
                    continue;
                }
            };
            let mut rejections = String::new();
            let mut accepted_here = 0_usize;
            for submitted in submission.claims {
                match check(&submitted, &by_subject, &by_object) {
                    Ok((subject, object)) => {
                        accepted_here += 1;
                        accepted.push(Claim {
                            claim_id: Uuid::new_v4(),
                            text: submitted.text.trim().to_string(),
                            subject_entity_local_id: subject,
                            object_entity_local_id: object,
                            prepositional_phrases: submitted.prepositional_phrases,
                            sources: vec![page.url.clone()],
                        });
                    }
                    Err(reason) => {
                        rejected_total += 1;
                        let _ = writeln!(rejections, "- \"{}\": {reason}", submitted.text);
                    }
                }
            }
            let content = if rejections.is_empty() {
                format!("Accepted {accepted_here} claims.")
            } else {
                format!(
                    "Accepted {accepted_here} claims. These claims were rejected:\n{rejections}\
                     Submit corrected versions of the rejected claims only."
                )
            };
            feedback.push(tool_result(&tool_use.id, &content, !rejections.is_empty()));
        }

        if rejected_total == 0 {
            break;
        }
        debug!(url = %page.url, cycle, rejected = rejected_total, "requesting claim corrections");
        messages.push(success.message);
        messages.push(Message::User { content: feedback });
    }

    Ok(accepted)
}

fn check(
    submitted: &SubmittedClaim,
    by_subject: &HashMap<LocalEntityId, &EntitySummary>,
    by_object: &HashMap<LocalEntityId, &EntitySummary>,
) -> Result<(LocalEntityId, Option<LocalEntityId>), ClaimRejection> {
    let subject = submitted
        .subject_entity_local_id
        .parse::<LocalEntityId>()
        .ok()
        .and_then(|id| by_subject.get(&id).copied())
        .ok_or_else(|| ClaimRejection::UnknownSubject(submitted.subject_entity_local_id.clone()))?;
    let object = match &submitted.object_entity_local_id {
        Some(raw) => Some(
            raw.parse::<LocalEntityId>()
                .ok()
                .and_then(|id| by_object.get(&id).copied())
                .ok_or_else(|| ClaimRejection::UnknownObject(raw.clone()))?,
        ),
        None => None,
    };
    validate_claim(&submitted.text, subject, object)?;
    Ok((subject.local_id, object.map(|o| o.local_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn entity(name: &str) -> EntitySummary {
        EntitySummary {
            local_id: LocalEntityId::new(),
            name: name.to_string(),
            summary: String::new(),
            entity_type_id: "t".to_string(),
        }
    }

    #[test_case("Acme Corp was founded in 1999." ; "plain fact")]
    #[test_case("acme corp makes rockets" ; "case insensitive")]
    #[test_case("Acme Corp is based in Brandenburg" ; "contains and inside a word")]
    fn test_valid_subject_only(text: &str) {
        assert_eq!(validate_claim(text, &entity("Acme Corp"), None), Ok(()));
    }

    #[test]
    fn test_subject_must_open_claim() {
        assert_eq!(
            validate_claim("Founded in 1999, Acme Corp", &entity("Acme Corp"), None),
            Err(ClaimRejection::MissingSubjectName("Acme Corp".to_string()))
        );
    }

    #[test]
    fn test_object_must_close_claim() {
        let subject = entity("Jane Doe");
        let object = entity("Acme Corp");
        assert_eq!(validate_claim("Jane Doe is CEO of Acme Corp.", &subject, Some(&object)), Ok(()));
        assert_eq!(
            validate_claim("Jane Doe leads Acme Corp since 2020", &subject, Some(&object)),
            Err(ClaimRejection::MissingObjectName("Acme Corp".to_string()))
        );
    }

    #[test]
    fn test_compound_claim_rejected() {
        assert_eq!(
            validate_claim("Acme Corp makes rockets and satellites", &entity("Acme Corp"), None),
            Err(ClaimRejection::Compound)
        );
    }

    #[test]
    fn test_and_inside_entity_names_is_allowed() {
        let subject = entity("Smith and Sons");
        let object = entity("Johnson and Johnson");
        assert_eq!(
            validate_claim("Smith and Sons supplies Johnson and Johnson", &subject, Some(&object)),
            Ok(())
        );
    }

    #[test]
    fn test_check_rejects_unknown_ids() {
        let subject = entity("Acme");
        let by_subject = HashMap::from([(subject.local_id, &subject)]);
        let by_object = by_subject.clone();
        let submitted = SubmittedClaim {
            text: "Acme builds Other".to_string(),
            subject_entity_local_id: subject.local_id.to_string(),
            object_entity_local_id: Some(LocalEntityId::new().to_string()),
            prepositional_phrases: vec![],
        };
        assert!(matches!(
            check(&submitted, &by_subject, &by_object),
            Err(ClaimRejection::UnknownObject(_))
        ));
    }
}
