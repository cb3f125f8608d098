//! Human-in-the-loop questions from the coordinator.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Answers questions a coordinator asks the operator.
#[async_trait]
pub trait HumanInput: Send + Sync {
    /// Asks `question`; `None` means no answer is available.
    async fn ask(&self, question: &str) -> Option<String>;
}

/// Prompts on stderr and reads one line from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalInput;

#[async_trait]
impl HumanInput for TerminalInput {
    #[allow(clippy::print_stderr)]
    async fn ask(&self, question: &str) -> Option<String> {
        eprintln!("\n[research question] {question}\n> ");
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                let answer = line.trim();
                (!answer.is_empty()).then(|| answer.to_string())
            }
        }
    }
}
