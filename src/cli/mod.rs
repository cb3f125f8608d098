//! CLI layer for quarry.
//!
//! Provides the command-line interface using clap, with commands for
//! running research, inspecting checkpoints and validating documents.

pub mod commands;
pub mod output;
pub mod parser;

pub use commands::execute;
pub use output::OutputFormat;
#[cfg(feature = "sqlite-checkpoints")]
pub use parser::CheckpointCommands;
pub use parser::{Cli, Commands};
