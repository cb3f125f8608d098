//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default checkpoint database, relative to the data directory.
const DEFAULT_CHECKPOINT_DB: &str = "quarry/checkpoints.db";

/// quarry: autonomous research over a tree of LLM workers.
///
/// Searches the web, reads pages and extracts structured entities of the
/// requested types.
#[derive(Parser, Debug)]
#[command(name = "quarry")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the checkpoint database.
    ///
    /// Defaults to `quarry/checkpoints.db` under the user data directory.
    #[arg(long, env = "QUARRY_CHECKPOINT_DB", global = true)]
    pub checkpoint_db: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json, ndjson).
    #[arg(long, default_value = "text", global = true)]
    pub format: String,

    /// Log format on stderr (text, json).
    #[arg(long, default_value = "text", global = true, value_parser = ["text", "json"])]
    pub log_format: String,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Checkpoint database path with the default applied.
    #[must_use]
    pub fn get_checkpoint_db(&self) -> PathBuf {
        self.checkpoint_db.clone().unwrap_or_else(|| {
            dirs::data_dir().map_or_else(
                || PathBuf::from(".quarry").join("checkpoints.db"),
                |dir| dir.join(DEFAULT_CHECKPOINT_DB),
            )
        })
    }
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Research a goal and propose entities of the given types.
    ///
    /// Press Ctrl-C once to stop gracefully (findings so far are kept),
    /// twice to cancel.
    #[command(after_help = r#"Examples:
  quarry research "EU rocket launch startups" -t company.json --search-url https://search.example/api
  quarry research "..." -t company.json --graph-file graph.json --persist
  quarry --format ndjson research "..." -t company.json | jq -c 'select(.event)'
  quarry research "..." -t company.json --execution-id 7b0c...   # resume a run
"#)]
    Research {
        /// What to find out.
        goal: String,

        /// Entity type definition files (JSON with `$id`, `title`, `schema`).
        #[arg(short = 't', long = "entity-type", required = true)]
        entity_types: Vec<PathBuf>,

        /// JSON search endpoint queried with `?q=`.
        #[arg(long, env = "QUARRY_SEARCH_URL")]
        search_url: Option<String>,

        /// Bearer token for the search endpoint.
        #[arg(long, env = "QUARRY_SEARCH_API_KEY", hide_env_values = true)]
        search_api_key: Option<String>,

        /// Model for every role (overrides `QUARRY_MODEL`).
        #[arg(short, long)]
        model: Option<String>,

        /// Maximum concurrent page reads and proposals.
        #[arg(short = 'c', long)]
        max_concurrency: Option<usize>,

        /// Iteration cap for the coordinator.
        #[arg(long)]
        coordinator_iterations: Option<u32>,

        /// Resume (or pin) this execution id.
        #[arg(long)]
        execution_id: Option<String>,

        /// JSON file of committed entities read at the start of the run.
        #[arg(long)]
        graph_file: Option<PathBuf>,

        /// Write proposals back to the graph file.
        #[arg(long, requires = "graph_file")]
        persist: bool,

        /// Let the coordinator ask questions on the terminal.
        #[arg(short, long)]
        interactive: bool,

        /// Do not checkpoint workers.
        #[arg(long)]
        no_checkpoints: bool,

        /// Directory containing prompt template files.
        #[arg(long, env = "QUARRY_PROMPT_DIR")]
        prompt_dir: Option<PathBuf>,
    },

    /// List supported models and their providers.
    Models,

    /// Validate a JSON document against a JSON schema.
    #[command(after_help = r#"Examples:
  quarry validate --schema company.schema.json --input proposal.json
"#)]
    Validate {
        /// Schema file.
        #[arg(long)]
        schema: PathBuf,

        /// Document to validate.
        #[arg(long)]
        input: PathBuf,
    },

    /// Write the built-in prompt templates to a directory for editing.
    InitPrompts {
        /// Target directory (defaults to `~/.config/quarry/prompts`).
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Worker checkpoint operations (list, show, clear).
    #[cfg(feature = "sqlite-checkpoints")]
    #[command(subcommand)]
    Checkpoints(CheckpointCommands),
}

/// Checkpoint subcommands.
#[cfg(feature = "sqlite-checkpoints")]
#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// List saved worker checkpoints, oldest first.
    List {
        /// Only this execution.
        #[arg(short, long)]
        execution_id: Option<String>,
    },

    /// Show one worker's checkpoint.
    Show {
        /// Worker instance id.
        worker_id: String,
    },

    /// Delete every checkpoint of an execution.
    Clear {
        /// Execution id.
        execution_id: String,

        /// Skip confirmation prompt.
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_research_requires_entity_type() {
        let parsed = Cli::try_parse_from(["quarry", "research", "rockets"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_research_arguments() {
        let cli = Cli::try_parse_from([
            "quarry",
            "--format",
            "json",
            "research",
            "rockets",
            "-t",
            "a.json",
            "-t",
            "b.json",
            "--graph-file",
            "g.json",
            "--persist",
        ])
        .unwrap_or_else(|_| unreachable!());
        assert_eq!(cli.format, "json");
        let Commands::Research {
            entity_types,
            persist,
            ..
        } = cli.command
        else {
            unreachable!()
        };
        assert_eq!(entity_types.len(), 2);
        assert!(persist);
    }

    #[test]
    fn test_persist_requires_graph_file() {
        let parsed = Cli::try_parse_from(["quarry", "research", "x", "-t", "a.json", "--persist"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_explicit_checkpoint_db_wins() {
        let cli = Cli::try_parse_from(["quarry", "--checkpoint-db", "/tmp/c.db", "models"])
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(cli.get_checkpoint_db(), PathBuf::from("/tmp/c.db"));
    }
}
