//! Output formatting for CLI commands.

use std::fmt::Write;

use serde::Serialize;
use serde_json::json;

use crate::agent::{ProgressEnvelope, ProgressEvent, ResearchOutcome, WorkerSnapshot};
use crate::llm::LlmModel;
use crate::storage::SnapshotSummary;

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// One pretty-printed JSON document.
    Json,
    /// One JSON document per line.
    Ndjson,
}

impl OutputFormat {
    /// Parses a format name; unknown names fall back to text.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "ndjson" | "jsonl" => Self::Ndjson,
            _ => Self::Text,
        }
    }

    /// Serializes `value` in this format's JSON flavour.
    #[must_use]
    pub fn to_json<T: Serialize>(self, value: &T) -> String {
        let rendered = match self {
            Self::Ndjson => serde_json::to_string(value),
            Self::Text | Self::Json => serde_json::to_string_pretty(value),
        };
        rendered.unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string())
    }
}

/// Formats a finished research run.
#[must_use]
pub fn format_outcome(outcome: &ResearchOutcome, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json | OutputFormat::Ndjson => format!("{}\n", format.to_json(outcome)),
        OutputFormat::Text => {
            let mut out = String::new();
            let _ = writeln!(out, "Execution {}", outcome.execution_id);
            let _ = writeln!(
                out,
                "Status: {}{}",
                outcome.status,
                outcome
                    .note
                    .as_deref()
                    .map_or_else(String::new, |n| format!(" ({n})"))
            );
            let _ = writeln!(
                out,
                "Workers: {}  Tokens: {} in / {} out  Elapsed: {:.1}s",
                outcome.workers_started,
                outcome.usage.input_tokens,
                outcome.usage.output_tokens,
                outcome.elapsed.as_secs_f64()
            );
            let _ = writeln!(
                out,
                "Entities: {}  Claims: {}  Proposals: {}  Persisted: {}",
                outcome.summaries.len(),
                outcome.claims.len(),
                outcome.proposals.len(),
                outcome.persisted
            );
            for proposal in &outcome.proposals {
                let _ = writeln!(out, "\n## {}", proposal.name);
                if !proposal.summary.is_empty() {
                    let _ = writeln!(out, "{}", proposal.summary);
                }
                for (key, value) in &proposal.properties {
                    let _ = writeln!(out, "  {key}: {value}");
                }
                for claim in outcome
                    .claims
                    .iter()
                    .filter(|c| proposal.claim_ids.contains(&c.claim_id))
                {
                    let _ = writeln!(out, "  - {}", claim.text);
                }
            }
            out
        }
    }
}

/// One progress line for text output.
#[must_use]
pub fn format_progress(envelope: &ProgressEnvelope) -> String {
    let who = envelope.worker.worker_type;
    match &envelope.event {
        ProgressEvent::WorkerStarted { goal } => format!("[{who}] started: {goal}"),
        ProgressEvent::StartedTask { goal, .. } => format!("[{who}] delegated: {goal}"),
        ProgressEvent::ClosedTask {
            status,
            entity_count,
            claim_count,
            ..
        } => format!("[{who}] task {status}: {entity_count} entities, {claim_count} claims"),
        ProgressEvent::QueriedWeb { query, hit_count } => {
            format!("[{who}] searched \"{query}\" ({hit_count} hits)")
        }
        ProgressEvent::VisitedWebPage { url, .. } => format!("[{who}] read {url}"),
        ProgressEvent::UpdatedPlan { .. } => format!("[{who}] updated plan"),
        ProgressEvent::InferredClaims {
            url,
            entity_count,
            claim_count,
        } => format!("[{who}] {url}: {entity_count} entities, {claim_count} claims"),
        ProgressEvent::DeduplicatedEntities { duplicates } => {
            format!("[{who}] merged {} duplicate groups", duplicates.len())
        }
        ProgressEvent::WorkerWasStopped { reason } => format!("[{who}] stopping: {reason}"),
        ProgressEvent::WorkerFinished { status, .. } => format!("[{who}] {status}"),
    }
}

/// Formats the model table.
#[must_use]
pub fn format_models(format: OutputFormat) -> String {
    match format {
        OutputFormat::Json | OutputFormat::Ndjson => {
            let models: Vec<_> = LlmModel::ALL
                .iter()
                .map(|m| {
                    json!({
                        "id": m.id(),
                        "provider": m.provider().to_string(),
                        "context_window": m.context_window(),
                        "max_output_tokens": m.max_output_tokens(),
                    })
                })
                .collect();
            format!("{}\n", format.to_json(&models))
        }
        OutputFormat::Text => {
            let mut out = String::new();
            let _ = writeln!(
                out,
                "{:<30} {:<10} {:>9} {:>9}",
                "MODEL", "PROVIDER", "CONTEXT", "OUTPUT"
            );
            for model in LlmModel::ALL {
                let _ = writeln!(
                    out,
                    "{:<30} {:<10} {:>9} {:>9}",
                    model.id(),
                    model.provider().to_string(),
                    model.context_window(),
                    model.max_output_tokens()
                );
            }
            out
        }
    }
}

/// Formats a checkpoint listing.
#[must_use]
pub fn format_snapshot_list(summaries: &[SnapshotSummary], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => format!("{}\n", format.to_json(&summaries)),
        OutputFormat::Ndjson => summaries
            .iter()
            .map(|s| format!("{}\n", format.to_json(s)))
            .collect(),
        OutputFormat::Text => {
            if summaries.is_empty() {
                return "No checkpoints.\n".to_string();
            }
            let mut out = String::new();
            for s in summaries {
                let status = s.status.map_or_else(|| "-".to_string(), |st| st.to_string());
                let _ = writeln!(
                    out,
                    "{}  {:<16} {:<18} iter {:<3} {:<10} {}",
                    s.worker.worker_instance_id,
                    s.worker.worker_type.to_string(),
                    s.phase.to_string(),
                    s.iteration,
                    status,
                    s.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            out
        }
    }
}

/// Formats one checkpoint.
#[must_use]
pub fn format_snapshot(snapshot: &WorkerSnapshot, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json | OutputFormat::Ndjson => format!("{}\n", format.to_json(snapshot)),
        OutputFormat::Text => {
            let state = &snapshot.state;
            let mut out = String::new();
            let _ = writeln!(out, "Worker:     {}", snapshot.identifiers);
            let _ = writeln!(out, "Execution:  {}", snapshot.execution_id);
            let _ = writeln!(out, "Phase:      {}", snapshot.phase);
            let _ = writeln!(out, "Iteration:  {}", snapshot.iteration);
            if let Some(status) = snapshot.status {
                let _ = writeln!(out, "Status:     {status}");
            }
            let _ = writeln!(out, "Goal:       {}", state.goal);
            if !state.plan.is_empty() {
                let _ = writeln!(out, "Plan:\n{}", state.plan);
            }
            let _ = writeln!(
                out,
                "Entities: {}  Claims: {}  Pages read: {}  Queries: {}",
                state.entity_summaries.len(),
                state.claims.len(),
                state.resources_visited.len(),
                state.web_queries_made.len()
            );
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("json", OutputFormat::Json; "json")]
    #[test_case("NDJSON", OutputFormat::Ndjson; "ndjson upper")]
    #[test_case("jsonl", OutputFormat::Ndjson; "jsonl alias")]
    #[test_case("text", OutputFormat::Text; "text")]
    #[test_case("yaml", OutputFormat::Text; "unknown falls back")]
    fn test_parse_format(raw: &str, expected: OutputFormat) {
        assert_eq!(OutputFormat::parse(raw), expected);
    }

    #[test]
    fn test_ndjson_is_single_line() {
        let rendered = OutputFormat::Ndjson.to_json(&json!({"a": [1, 2]}));
        assert!(!rendered.contains('\n'));
    }

    #[test]
    fn test_models_table_lists_every_model() {
        let table = format_models(OutputFormat::Text);
        for model in LlmModel::ALL {
            assert!(table.contains(model.id()));
        }
    }
}
