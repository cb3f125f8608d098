//! LLM gateway.
//!
//! One request/response contract over Anthropic (direct and managed
//! inference), `OpenAI`-compatible and Google models, with schema-validated
//! tool calls, bounded retries, rate-limit failover and cancellation.
//!
//! # Architecture
//!
//! ```text
//! caller ──► LlmGateway::get_response
//!              ├─ UsageLimiter pre-check
//!              ├─ validation loop (schema + sanitizer, corrective resubmit)
//!              │    └─ dispatch loop (429 failover/wait, 5xx backoff)
//!              │         └─ LlmProvider adapter (anthropic | openai | google)
//!              └─ LlmResponse::{Ok, Error}
//! ```

pub mod config;
pub mod gateway;
pub mod message;
pub mod model;
pub mod provider;
pub mod providers;
pub mod response;
pub mod retry;
pub mod schema;
pub mod tool;
pub mod usage;

pub use config::{GatewayConfig, RetryLimits};
pub use gateway::LlmGateway;
pub use message::{AssistantContent, Message, ToolUse, UserContent};
pub use model::LlmModel;
pub use provider::{LlmProvider, ProviderKind, ProviderReply, ProviderRoute};
pub use response::{LlmErrorKind, LlmFailure, LlmRequest, LlmResponse, LlmSuccess, StopReason};
pub use schema::{ValidationError, validate};
pub use tool::{Sanitizer, ToolChoice, ToolDefinition};
pub use usage::{TokenBudget, Usage, UsageLimiter};
