//! Duplicate detection: reconciliation properties and whole passes.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use quarry::agent::dedup::IDENTIFY_DUPLICATES;
use quarry::agent::tools::{COMPLETE, INFER_CLAIMS_FROM_RESOURCES, START_RESEARCH_TASKS, UPDATE_PLAN};
use quarry::agent::{
    Claim, CoordinatorState, DedupAgent, DuplicateReport, EntitySummary, LocalEntityId,
    ResearchGoal, ResearchRunner, WorkerStatus, apply_duplicates, reconcile,
};
use quarry::llm::{LlmRequest, Message, ProviderKind, Usage};
use quarry::testing::{
    ScriptedProvider, ScriptedReply, StaticWeb, company_type, extraction_reply, offers,
    research_env, scripted_config,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const POOL: u128 = 8;

fn id(n: u128) -> LocalEntityId {
    LocalEntityId::from_uuid(Uuid::from_u128(n + 1))
}

fn reports_strategy() -> impl Strategy<Value = Vec<DuplicateReport>> {
    prop::collection::vec(
        (0..POOL, prop::collection::vec(0..POOL, 1..4)),
        0..6,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .map(|(canonical, duplicates)| DuplicateReport {
                canonical_id: id(canonical),
                duplicate_ids: duplicates.into_iter().map(id).collect(),
            })
            .collect()
    })
}

fn known() -> HashSet<LocalEntityId> {
    (0..POOL).map(id).collect()
}

proptest! {
    #[test]
    fn every_id_lands_in_at_most_one_group(
        reports in reports_strategy(),
        committed_mask in 0_u8..=255,
    ) {
        let committed: HashSet<LocalEntityId> = (0..POOL)
            .filter(|n| committed_mask & (1 << n) != 0)
            .map(id)
            .collect();
        let merged = reconcile(reports, &known(), &committed);

        let mut seen = HashSet::new();
        for report in &merged {
            prop_assert!(!report.duplicate_ids.is_empty());
            for member in std::iter::once(report.canonical_id).chain(report.duplicate_ids.iter().copied()) {
                prop_assert!(seen.insert(member), "{member} appears twice");
            }
            for duplicate in &report.duplicate_ids {
                prop_assert!(!committed.contains(duplicate), "committed {duplicate} was folded");
            }
        }
    }

    #[test]
    fn reconciling_twice_changes_nothing(
        reports in reports_strategy(),
        committed_mask in 0_u8..=255,
    ) {
        let committed: HashSet<LocalEntityId> = (0..POOL)
            .filter(|n| committed_mask & (1 << n) != 0)
            .map(id)
            .collect();
        let once = reconcile(reports, &known(), &committed);
        let twice = reconcile(once.clone(), &known(), &committed);
        prop_assert_eq!(once, twice);
    }
}

#[test]
fn test_reports_about_unknown_entities_are_ignored() {
    let stranger = LocalEntityId::new();
    let merged = reconcile(
        vec![DuplicateReport {
            canonical_id: stranger,
            duplicate_ids: vec![id(0)],
        }],
        &known(),
        &HashSet::new(),
    );
    assert!(merged.is_empty());
}

/// Answers a dedup request by grouping the listed entities on their exact
/// name; the first listed entity of a group is kept.
fn identify_by_name(request: &LlmRequest) -> Option<ScriptedReply> {
    if !offers(request, IDENTIFY_DUPLICATES) {
        return None;
    }
    let listing = request.messages.first().map(Message::text).unwrap_or_default();
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for line in listing.lines().filter_map(|l| l.strip_prefix("- id: ")) {
        let mut fields = line.split(" | ");
        let (Some(id), Some(name)) = (fields.next(), fields.next()) else {
            continue;
        };
        let name = name.trim_start_matches("name: ").to_string();
        match groups.iter_mut().find(|(n, _)| *n == name) {
            Some((_, ids)) => ids.push(id.to_string()),
            None => groups.push((name, vec![id.to_string()])),
        }
    }
    let duplicates: Vec<Value> = groups
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(_, ids)| json!({"canonicalId": ids[0], "duplicateIds": ids[1..]}))
        .collect();
    Some(ScriptedReply::tool_call(
        IDENTIFY_DUPLICATES,
        json!({ "duplicates": duplicates }),
    ))
}

fn summary(name: &str) -> EntitySummary {
    EntitySummary {
        local_id: LocalEntityId::new(),
        name: name.to_string(),
        summary: format!("{name} builds rockets."),
        entity_type_id: company_type().entity_type_id,
    }
}

#[tokio::test]
async fn test_second_pass_after_merging_finds_nothing() {
    let provider = Arc::new(
        ScriptedProvider::new(ProviderKind::OpenAi)
            .respond_with(|request| identify_by_name(request).unwrap_or_else(|| unreachable!())),
    );
    let config = scripted_config().build().unwrap_or_else(|_| unreachable!());
    let env = research_env(&provider, &Arc::new(StaticWeb::new()), config);
    let mut state = CoordinatorState::new("rocket companies");
    state.add_summaries([
        summary("Acme Corp"),
        summary("Globex"),
        summary("Acme Corp"),
        summary("Acme Corp"),
    ]);
    let globex = state.entity_summaries[1].local_id;
    let copy = state.entity_summaries[2].local_id;
    state.add_claims([Claim {
        claim_id: Uuid::new_v4(),
        text: "Acme Corp supplies Globex".to_string(),
        subject_entity_local_id: copy,
        object_entity_local_id: Some(globex),
        prepositional_phrases: Vec::new(),
        sources: Vec::new(),
    }]);
    let agent = DedupAgent::new(&env);
    let cancel = CancellationToken::new();
    let mut usage = Usage::default();

    let first = agent
        .identify_duplicates(&state.entity_summaries, &state.committed_entity_ids, &cancel, &mut usage)
        .await
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(first.duplicates.len(), 1);
    assert_eq!(apply_duplicates(&mut state, &first.duplicates), 2);
    assert_eq!(state.entity_summaries.len(), 2);
    assert_eq!(state.claims.len(), 1);
    assert_eq!(state.claims[0].subject_entity_local_id, first.duplicates[0].canonical_id);

    let second = agent
        .identify_duplicates(&state.entity_summaries, &state.committed_entity_ids, &cancel, &mut usage)
        .await
        .unwrap_or_else(|_| unreachable!());
    assert!(second.duplicates.is_empty());
    assert_eq!(provider.calls(), 2);
}

const PAGE_A: &str = "https://acme.example/about";
const PAGE_B: &str = "https://news.example/acme";

#[tokio::test]
async fn test_merged_run_leaves_no_orphaned_claims() {
    // Two link-followers each report Acme Corp under their own id; the root
    // merges them.
    let provider = Arc::new(ScriptedProvider::new(ProviderKind::OpenAi).respond_with(|request| {
        if let Some(reply) = identify_by_name(request) {
            return reply;
        }
        if let Some(reply) = extraction_reply(request, "Acme Corp") {
            return reply;
        }
        if request.tools.len() == 1 && offers(request, UPDATE_PLAN) {
            return ScriptedReply::tool_call(UPDATE_PLAN, json!({"plan": "read both pages"}));
        }
        let read_already = request.messages.iter().any(|m| format!("{m:?}").contains(PAGE_A));
        if offers(request, START_RESEARCH_TASKS) && !read_already {
            return ScriptedReply::tool_call(
                INFER_CLAIMS_FROM_RESOURCES,
                json!({
                    "resources": [
                        {"url": PAGE_A, "goal": "company facts"},
                        {"url": PAGE_B, "goal": "company news"}
                    ],
                    "explanation": "two sources on the same company"
                }),
            );
        }
        ScriptedReply::tool_call(COMPLETE, json!({"explanation": "done"}))
    }));
    let web = Arc::new(
        StaticWeb::new()
            .with_page(PAGE_A, "About", "Acme Corp makes rockets.", &[])
            .with_page(PAGE_B, "News", "Acme Corp launched again.", &[]),
    );
    let config = scripted_config().build().unwrap_or_else(|_| unreachable!());
    let runner = ResearchRunner::new(research_env(&provider, &web, config));

    let outcome = runner
        .run(&ResearchGoal::new("rocket companies"), &CancellationToken::new())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(outcome.status, WorkerStatus::Completed);
    assert_eq!(outcome.workers_started, 3);
    assert_eq!(outcome.summaries.len(), 1);
    assert_eq!(outcome.claims.len(), 2);
    let known: HashSet<LocalEntityId> = outcome.summaries.iter().map(|s| s.local_id).collect();
    for claim in &outcome.claims {
        assert!(claim.entity_ids().all(|id| known.contains(&id)), "orphaned claim {claim:?}");
    }
}
