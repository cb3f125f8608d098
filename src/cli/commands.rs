//! CLI command implementations.
//!
//! Contains the business logic for each CLI command.

#![allow(clippy::too_many_lines)]

use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{
    EntityTypeDefinition, ProgressSink, PromptSet, ResearchConfig, ResearchEnv, ResearchGoal,
    ResearchRunner, StopSignal,
};
use crate::cache::TtlCache;
#[cfg(feature = "sqlite-checkpoints")]
use crate::cli::output::{format_snapshot, format_snapshot_list};
use crate::cli::output::{OutputFormat, format_models, format_outcome, format_progress};
#[cfg(feature = "sqlite-checkpoints")]
use crate::cli::parser::CheckpointCommands;
use crate::cli::parser::{Cli, Commands};
use crate::error::{CommandError, Result};
use crate::llm::schema::{describe_errors, validate_schema};
use crate::llm::{GatewayConfig, LlmGateway, LlmModel};
use crate::services::{HttpFetcher, HttpSearch, InMemoryGraphStore, StoredEntity, TerminalInput};
#[cfg(feature = "sqlite-checkpoints")]
use crate::storage::{SnapshotStore, SqliteSnapshotStore};

// ==================== Parameter Structs ====================

/// Parameters for the research command.
#[derive(Debug, Clone, Default)]
pub struct ResearchParams<'a> {
    /// What to find out.
    pub goal: &'a str,
    /// Entity type definition files.
    pub entity_types: &'a [PathBuf],
    /// JSON search endpoint.
    pub search_url: Option<&'a str>,
    /// Bearer token for the search endpoint.
    pub search_api_key: Option<&'a str>,
    /// Model for every role.
    pub model: Option<&'a str>,
    /// Maximum concurrent page reads and proposals.
    pub max_concurrency: Option<usize>,
    /// Coordinator iteration cap.
    pub coordinator_iterations: Option<u32>,
    /// Execution id to resume.
    pub execution_id: Option<&'a str>,
    /// File-backed graph of committed entities.
    pub graph_file: Option<&'a Path>,
    /// Write proposals back to the graph file.
    pub persist: bool,
    /// Allow questions on the terminal.
    pub interactive: bool,
    /// Skip checkpointing.
    pub no_checkpoints: bool,
    /// Prompt template directory.
    pub prompt_dir: Option<&'a Path>,
}

/// Executes the CLI command.
///
/// # Arguments
///
/// * `cli` - Parsed CLI arguments.
///
/// # Returns
///
/// Result with output string on success.
///
/// # Errors
///
/// Returns an error if the command fails to execute.
pub fn execute(cli: &Cli) -> Result<String> {
    let format = OutputFormat::parse(&cli.format);

    match &cli.command {
        Commands::Research {
            goal,
            entity_types,
            search_url,
            search_api_key,
            model,
            max_concurrency,
            coordinator_iterations,
            execution_id,
            graph_file,
            persist,
            interactive,
            no_checkpoints,
            prompt_dir,
        } => {
            let params = ResearchParams {
                goal,
                entity_types,
                search_url: search_url.as_deref(),
                search_api_key: search_api_key.as_deref(),
                model: model.as_deref(),
                max_concurrency: *max_concurrency,
                coordinator_iterations: *coordinator_iterations,
                execution_id: execution_id.as_deref(),
                graph_file: graph_file.as_deref(),
                persist: *persist,
                interactive: *interactive,
                no_checkpoints: *no_checkpoints,
                prompt_dir: prompt_dir.as_deref(),
            };
            cmd_research(&cli.get_checkpoint_db(), &params, format)
        }
        Commands::Models => Ok(format_models(format)),
        Commands::Validate { schema, input } => cmd_validate(schema, input, format),
        Commands::InitPrompts { dir } => cmd_init_prompts(dir.as_deref(), format),
        #[cfg(feature = "sqlite-checkpoints")]
        Commands::Checkpoints(sub) => execute_checkpoints(sub, &cli.get_checkpoint_db(), format),
    }
}

#[cfg(feature = "sqlite-checkpoints")]
fn execute_checkpoints(
    sub: &CheckpointCommands,
    db_path: &Path,
    format: OutputFormat,
) -> Result<String> {
    let store = SqliteSnapshotStore::open(db_path)?;
    match sub {
        CheckpointCommands::List { execution_id } => {
            let execution_id = execution_id.as_deref().map(parse_id).transpose()?;
            let summaries = store.list(execution_id)?;
            Ok(format_snapshot_list(&summaries, format))
        }
        CheckpointCommands::Show { worker_id } => {
            let snapshot = store
                .load(parse_id(worker_id)?)?
                .ok_or_else(|| CommandError::NotFound(format!("checkpoint {worker_id}")))?;
            Ok(format_snapshot(&snapshot, format))
        }
        CheckpointCommands::Clear { execution_id, yes } => {
            if !yes {
                return Err(CommandError::InvalidArgument(
                    "Use --yes to confirm. This deletes every checkpoint of the execution."
                        .to_string(),
                )
                .into());
            }
            let removed = store.clear(parse_id(execution_id)?)?;
            match format {
                OutputFormat::Text => Ok(format!("Removed {removed} checkpoints.\n")),
                OutputFormat::Json | OutputFormat::Ndjson => Ok(format!(
                    "{}\n",
                    format.to_json(&serde_json::json!({
                        "execution_id": execution_id,
                        "removed": removed,
                    }))
                )),
            }
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|e| CommandError::InvalidArgument(format!("invalid id {raw}: {e}")).into())
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        CommandError::ReadFile {
            path: path.display().to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

fn research_config(db_path: &Path, params: &ResearchParams<'_>) -> Result<ResearchConfig> {
    let mut builder = ResearchConfig::builder();
    if let Some(model) = params.model {
        builder = builder.model(model.parse::<LlmModel>()?);
    }
    if let Some(n) = params.max_concurrency {
        builder = builder.max_concurrency(n);
    }
    if let Some(n) = params.coordinator_iterations {
        builder = builder.coordinator_iterations(n);
    }
    if let Some(dir) = params.prompt_dir {
        builder = builder.prompt_dir(dir);
    }
    if !params.no_checkpoints {
        builder = builder.checkpoint_db(db_path);
    }
    builder = builder.persist_to_graph(params.persist);
    let mut config = builder.from_env()?.build()?;
    if params.no_checkpoints {
        config.checkpoint_db = None;
    }
    Ok(config)
}

fn load_graph(path: &Path) -> Result<Vec<StoredEntity>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = read_text(path)?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&text)?)
}

fn cmd_research(db_path: &Path, params: &ResearchParams<'_>, format: OutputFormat) -> Result<String> {
    let search_url = params.search_url.ok_or_else(|| {
        CommandError::InvalidArgument(
            "a search endpoint is required (--search-url or QUARRY_SEARCH_URL)".to_string(),
        )
    })?;
    let entity_types = params
        .entity_types
        .iter()
        .map(|path| EntityTypeDefinition::from_json_file(path))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let config = research_config(db_path, params)?;
    let gateway_config = GatewayConfig::from_env()?;
    let gateway = LlmGateway::from_config(&gateway_config)?;

    let search = HttpSearch::new(
        search_url,
        params.search_api_key.map(String::from),
        gateway_config.timeout,
    )?;
    let page_cache = Arc::new(TtlCache::new(config.cache_capacity, config.cache_ttl));
    let fetcher = HttpFetcher::new(gateway_config.timeout, page_cache, config.page_char_budget)?;

    let goal = match params.execution_id {
        Some(id) => ResearchGoal::new(params.goal).with_execution_id(parse_id(id)?),
        None => ResearchGoal::new(params.goal),
    };

    let (events, mut progress) = ProgressSink::channel();
    let mut env = ResearchEnv::new(Arc::new(gateway), config, Arc::new(search), Arc::new(fetcher))
        .with_entity_types(entity_types)
        .with_events(events);
    if params.interactive {
        env = env.with_human(Arc::new(TerminalInput));
    }
    #[cfg(feature = "sqlite-checkpoints")]
    if let Some(path) = env.config.checkpoint_db.clone() {
        env = env.with_snapshots(Arc::new(SqliteSnapshotStore::open(&path)?));
    }

    let graph = match params.graph_file {
        Some(path) => Some(Arc::new(InMemoryGraphStore::with_entities(load_graph(path)?))),
        None => None,
    };
    let (stop, stop_signal) = StopSignal::channel();
    let mut runner = ResearchRunner::new(env).with_stop(stop_signal);
    if let Some(graph) = &graph {
        runner = runner.with_graph(graph.clone());
    }

    // Create tokio runtime as sync/async bridge
    let rt = tokio::runtime::Runtime::new().map_err(|e| {
        CommandError::ExecutionFailed(format!("Failed to create async runtime: {e}"))
    })?;

    let (result, lines) = rt.block_on(async move {
        let printer = tokio::spawn(async move {
            let mut lines = Vec::new();
            while let Some(envelope) = progress.recv().await {
                match format {
                    OutputFormat::Ndjson => lines.push(format.to_json(&envelope)),
                    OutputFormat::Text | OutputFormat::Json => {
                        info!(target: "quarry::progress", "{}", format_progress(&envelope));
                    }
                }
            }
            lines
        });

        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, stopping workers (press Ctrl-C again to cancel)");
                    stop.stop("interrupted by operator");
                }
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        let result = runner.run(&goal, &cancel).await;
        interrupt.abort();
        drop(runner);
        let lines = printer.await.unwrap_or_default();
        (result, lines)
    });
    let outcome = result?;

    if params.persist
        && let (Some(graph), Some(path)) = (&graph, params.graph_file)
    {
        let json = serde_json::to_string_pretty(&graph.entities())?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), persisted = outcome.persisted, "graph file updated");
    }

    let mut out = String::new();
    for line in lines {
        let _ = writeln!(out, "{line}");
    }
    out.push_str(&format_outcome(&outcome, format));
    Ok(out)
}

fn cmd_validate(schema: &Path, input: &Path, format: OutputFormat) -> Result<String> {
    let schema_value: Value = serde_json::from_str(&read_text(schema)?)?;
    let input_value: Value = serde_json::from_str(&read_text(input)?)?;
    match validate_schema(&input_value, &schema_value) {
        Ok(()) => match format {
            OutputFormat::Text => Ok(format!("{} is valid.\n", input.display())),
            OutputFormat::Json | OutputFormat::Ndjson => Ok(format!(
                "{}\n",
                format.to_json(&serde_json::json!({ "valid": true, "errors": [] }))
            )),
        },
        Err(errors) => match format {
            OutputFormat::Text => Err(CommandError::InvalidDocument(describe_errors(&errors)).into()),
            OutputFormat::Json | OutputFormat::Ndjson => {
                let listed: Vec<_> = errors
                    .iter()
                    .map(|e| serde_json::json!({ "path": e.path, "message": e.message }))
                    .collect();
                Ok(format!(
                    "{}\n",
                    format.to_json(&serde_json::json!({ "valid": false, "errors": listed }))
                ))
            }
        },
    }
}

fn cmd_init_prompts(dir: Option<&Path>, format: OutputFormat) -> Result<String> {
    let dir = dir
        .map(PathBuf::from)
        .or_else(PromptSet::default_dir)
        .ok_or_else(|| {
            CommandError::InvalidArgument("no home directory; pass --dir".to_string())
        })?;
    let written = PromptSet::write_defaults(&dir)?;
    match format {
        OutputFormat::Text => {
            let mut out = String::new();
            if written.is_empty() {
                let _ = writeln!(out, "All prompt templates already exist in {}", dir.display());
            }
            for path in &written {
                let _ = writeln!(out, "Wrote {}", path.display());
            }
            Ok(out)
        }
        OutputFormat::Json | OutputFormat::Ndjson => Ok(format!(
            "{}\n",
            format.to_json(&serde_json::json!({
                "dir": dir.display().to_string(),
                "written": written.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
            }))
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, value: &Value) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, value.to_string()).unwrap_or_else(|_| unreachable!());
        path
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        })
    }

    #[test]
    fn test_validate_accepts_matching_document() {
        let dir = TempDir::new().unwrap_or_else(|_| unreachable!());
        let schema = write(&dir, "s.json", &schema());
        let input = write(&dir, "i.json", &json!({"name": "Acme"}));
        let out = cmd_validate(&schema, &input, OutputFormat::Text).unwrap_or_default();
        assert!(out.contains("is valid"));
    }

    #[test]
    fn test_validate_reports_errors_as_json() {
        let dir = TempDir::new().unwrap_or_else(|_| unreachable!());
        let schema = write(&dir, "s.json", &schema());
        let input = write(&dir, "i.json", &json!({"name": 3}));
        let out = cmd_validate(&schema, &input, OutputFormat::Json).unwrap_or_default();
        let parsed: Value = serde_json::from_str(&out).unwrap_or_default();
        assert_eq!(parsed["valid"], json!(false));
        assert_eq!(parsed["errors"][0]["path"], json!("/name"));
    }

    #[test]
    fn test_validate_text_failure_is_an_error() {
        let dir = TempDir::new().unwrap_or_else(|_| unreachable!());
        let schema = write(&dir, "s.json", &schema());
        let input = write(&dir, "i.json", &json!({}));
        assert!(cmd_validate(&schema, &input, OutputFormat::Text).is_err());
    }

    #[test]
    fn test_init_prompts_writes_templates_once() {
        let dir = TempDir::new().unwrap_or_else(|_| unreachable!());
        let first = cmd_init_prompts(Some(dir.path()), OutputFormat::Text).unwrap_or_default();
        assert!(first.contains("Wrote"));
        let second = cmd_init_prompts(Some(dir.path()), OutputFormat::Text).unwrap_or_default();
        assert!(second.contains("already exist"));
    }

    #[test]
    fn test_missing_graph_file_is_empty() {
        let dir = TempDir::new().unwrap_or_else(|_| unreachable!());
        let entities = load_graph(&dir.path().join("absent.json")).unwrap_or_else(|_| unreachable!());
        assert!(entities.is_empty());
    }

    #[test]
    fn test_research_requires_search_url() {
        let dir = TempDir::new().unwrap_or_else(|_| unreachable!());
        let entity_type = write(
            &dir,
            "company.json",
            &json!({"$id": "https://example.com/types/company/v/1", "title": "Company",
                    "schema": {"type": "object", "properties": {}}}),
        );
        let params = ResearchParams {
            goal: "rockets",
            entity_types: std::slice::from_ref(&entity_type),
            no_checkpoints: true,
            ..ResearchParams::default()
        };
        let err = cmd_research(&dir.path().join("c.db"), &params, OutputFormat::Text);
        assert!(err.is_err_and(|e| e.to_string().contains("search endpoint")));
    }

    #[cfg(feature = "sqlite-checkpoints")]
    #[test]
    fn test_checkpoint_clear_requires_confirmation() {
        let dir = TempDir::new().unwrap_or_else(|_| unreachable!());
        let db = dir.path().join("c.db");
        let cli = Cli::try_parse_from([
            "quarry",
            "--checkpoint-db",
            db.to_str().unwrap_or_default(),
            "checkpoints",
            "clear",
            &Uuid::new_v4().to_string(),
        ])
        .unwrap_or_else(|_| unreachable!());
        assert!(execute(&cli).is_err());
    }
}
