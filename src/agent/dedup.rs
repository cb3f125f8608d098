//! Duplicate-entity detection and merging.
//!
//! The model proposes groups; [`reconcile`] turns whatever it returned into
//! disjoint groups with exactly one canonical id each, and
//! [`apply_duplicates`] folds them into a worker's state.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::context::ResearchEnv;
use super::entity::{DuplicateReport, EntitySummary, LocalEntityId};
use super::extraction::decode_calls;
use super::prompt::build_dedup_prompt;
use super::state::CoordinatorState;
use crate::error::AgentError;
use crate::llm::message::user_message;
use crate::llm::{LlmRequest, Sanitizer, ToolChoice, ToolDefinition, Usage};

/// Tool the model answers with.
pub const IDENTIFY_DUPLICATES: &str = "identifyDuplicates";

/// Result of one dedup pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupOutcome {
    /// Reconciled merges.
    pub duplicates: Vec<DuplicateReport>,
    /// Tokens this pass spent; also added to the caller's accumulator.
    pub usage: Usage,
    /// Time spent.
    pub elapsed: Duration,
}

#[derive(Debug, Deserialize)]
struct Identified {
    duplicates: Vec<WireReport>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReport {
    canonical_id: LocalEntityId,
    duplicate_ids: Vec<LocalEntityId>,
}

impl From<WireReport> for DuplicateReport {
    fn from(wire: WireReport) -> Self {
        Self {
            canonical_id: wire.canonical_id,
            duplicate_ids: wire.duplicate_ids,
        }
    }
}

fn identify_tool(summaries: &[EntitySummary]) -> ToolDefinition {
    let ids: Vec<String> = summaries.iter().map(|s| s.local_id.to_string()).collect();
    ToolDefinition::new(
        IDENTIFY_DUPLICATES,
        "Report groups of entities that are the same real-world entity.",
        json!({
            "type": "object",
            "properties": {
                "duplicates": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "canonicalId": {"type": "string", "enum": ids},
                            "duplicateIds": {
                                "type": "array",
                                "minItems": 1,
                                "items": {"type": "string", "enum": ids}
                            }
                        },
                        "required": ["canonicalId", "duplicateIds"]
                    }
                }
            },
            "required": ["duplicates"]
        }),
    )
    .with_sanitizer(Sanitizer::common())
}

/// Asks the model which summaries describe the same entity.
pub struct DedupAgent<'a> {
    env: &'a ResearchEnv,
}

impl<'a> DedupAgent<'a> {
    /// Agent using `env`'s gateway and prompts.
    #[must_use]
    pub const fn new(env: &'a ResearchEnv) -> Self {
        Self { env }
    }

    /// Identifies duplicates among `summaries`.
    ///
    /// Fewer than two summaries never reach the model. The returned groups
    /// are already reconciled against `committed`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] if the call fails.
    pub async fn identify_duplicates(
        &self,
        summaries: &[EntitySummary],
        committed: &HashSet<LocalEntityId>,
        cancel: &CancellationToken,
        usage: &mut Usage,
    ) -> Result<DedupOutcome, AgentError> {
        let started = Instant::now();
        if summaries.len() < 2 {
            return Ok(DedupOutcome {
                duplicates: Vec::new(),
                usage: Usage::default(),
                elapsed: started.elapsed(),
            });
        }
        let request = LlmRequest::new(
            self.env.config.models.dedup,
            vec![user_message(&build_dedup_prompt(summaries))],
        )
        .system(self.env.prompts.dedup.clone())
        .tools(vec![identify_tool(summaries)])
        .tool_choice(ToolChoice::tool(IDENTIFY_DUPLICATES))
        .max_tokens(self.env.config.max_tokens);

        let mut spent = Usage::default();
        let result = self.env.call("dedup", &request, cancel, &mut spent).await;
        *usage += spent;
        let success = result?;
        let reported = decode_calls::<Identified>(&success, IDENTIFY_DUPLICATES)?
            .into_iter()
            .flat_map(|i| i.duplicates)
            .map(DuplicateReport::from)
            .collect();
        let known: HashSet<LocalEntityId> = summaries.iter().map(|s| s.local_id).collect();
        let duplicates = reconcile(reported, &known, committed);
        debug!(groups = duplicates.len(), "dedup pass finished");
        Ok(DedupOutcome {
            duplicates,
            usage: spent,
            elapsed: started.elapsed(),
        })
    }
}

struct Groups {
    parent: HashMap<LocalEntityId, LocalEntityId>,
    committed_member: HashMap<LocalEntityId, LocalEntityId>,
}

impl Groups {
    fn find(&mut self, id: LocalEntityId) -> LocalEntityId {
        let mut current = id;
        while let Some(&next) = self.parent.get(&current) {
            if next == current {
                break;
            }
            let grand = self.parent.get(&next).copied().unwrap_or(next);
            self.parent.insert(current, grand);
            current = next;
        }
        current
    }

    fn union(&mut self, a: LocalEntityId, b: LocalEntityId) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return true;
        }
        let ca = self.committed_member.get(&ra).copied();
        let cb = self.committed_member.get(&rb).copied();
        if ca.is_some() && cb.is_some() {
            return false;
        }
        self.parent.insert(rb, ra);
        if let Some(c) = ca.or(cb) {
            self.committed_member.insert(ra, c);
        }
        true
    }
}

/// Normalizes model-reported groups.
///
/// Unknown ids and self-references are dropped and overlapping groups are
/// merged. Within a group a committed id is always canonical; groups that
/// would merge two committed ids are not merged. Otherwise the earliest
/// reported canonical that was never itself reported as a duplicate wins.
/// Output is sorted for determinism.
#[must_use]
pub fn reconcile(
    reports: Vec<DuplicateReport>,
    known: &HashSet<LocalEntityId>,
    committed: &HashSet<LocalEntityId>,
) -> Vec<DuplicateReport> {
    let reports: Vec<DuplicateReport> = reports
        .into_iter()
        .filter(|r| known.contains(&r.canonical_id))
        .map(|r| DuplicateReport {
            canonical_id: r.canonical_id,
            duplicate_ids: r
                .duplicate_ids
                .into_iter()
                .filter(|d| *d != r.canonical_id && known.contains(d))
                .collect(),
        })
        .filter(|r| !r.duplicate_ids.is_empty())
        .collect();

    let mut groups = Groups {
        parent: HashMap::new(),
        committed_member: HashMap::new(),
    };
    for report in &reports {
        for id in std::iter::once(report.canonical_id).chain(report.duplicate_ids.iter().copied()) {
            groups.parent.entry(id).or_insert(id);
            if committed.contains(&id) {
                groups.committed_member.insert(id, id);
            }
        }
    }
    for report in &reports {
        for duplicate in &report.duplicate_ids {
            if !groups.union(report.canonical_id, *duplicate) {
                debug!(
                    canonical = %report.canonical_id,
                    duplicate = %duplicate,
                    "refusing to merge two committed entities"
                );
            }
        }
    }

    let reported_duplicates: HashSet<LocalEntityId> = reports
        .iter()
        .flat_map(|r| r.duplicate_ids.iter().copied())
        .collect();
    let ids: Vec<LocalEntityId> = groups.parent.keys().copied().collect();
    let mut members: HashMap<LocalEntityId, Vec<LocalEntityId>> = HashMap::new();
    for id in ids {
        let root = groups.find(id);
        members.entry(root).or_default().push(id);
    }

    let mut merged: Vec<DuplicateReport> = members
        .into_iter()
        .filter(|(_, m)| m.len() > 1)
        .map(|(root, mut m)| {
            let canonical = groups
                .committed_member
                .get(&root)
                .copied()
                .or_else(|| {
                    reports
                        .iter()
                        .map(|r| r.canonical_id)
                        .find(|c| m.contains(c) && !reported_duplicates.contains(c))
                })
                .or_else(|| {
                    reports
                        .iter()
                        .map(|r| r.canonical_id)
                        .find(|c| m.contains(c))
                })
                .unwrap_or(root);
            m.retain(|id| *id != canonical);
            m.sort_by_key(LocalEntityId::as_uuid);
            DuplicateReport {
                canonical_id: canonical,
                duplicate_ids: m,
            }
        })
        .collect();
    merged.sort_by_key(|r| r.canonical_id.as_uuid());
    merged
}

/// Folds duplicates into their canonical summaries.
///
/// Removes superseded summaries, points claims at canonical ids and drops
/// claims left referencing unknown entities. Returns the number of
/// summaries removed.
pub fn apply_duplicates(state: &mut CoordinatorState, reports: &[DuplicateReport]) -> usize {
    let canonical: HashMap<LocalEntityId, LocalEntityId> = reports
        .iter()
        .flat_map(|r| r.duplicate_ids.iter().map(|d| (*d, r.canonical_id)))
        .filter(|(d, _)| !state.committed_entity_ids.contains(d))
        .collect();
    if canonical.is_empty() {
        return 0;
    }
    let before = state.entity_summaries.len();
    state
        .entity_summaries
        .retain(|s| !canonical.contains_key(&s.local_id));
    for claim in &mut state.claims {
        claim.rewrite_ids(&canonical);
    }
    let orphans = state.drop_orphan_claims();
    let removed = before - state.entity_summaries.len();
    info!(removed, orphans, "merged duplicate entities");
    removed
}
