//! Error types for quarry.
//!
//! Each concern gets its own `thiserror` enum; [`Error`] wraps them for
//! callers that only need a single type. The LLM gateway does
//! not surface these across its public boundary; it returns
//! [`LlmResponse`](crate::llm::LlmResponse) values instead.

use std::time::Duration;

use thiserror::Error;

use crate::llm::ProviderRoute;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Snapshot storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// External service (graph store, web) failure.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Coordination engine failure.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// CLI command failure.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Vendor-native failures raised by provider adapters.
///
/// These never leave the gateway: it classifies them into retries,
/// failover, or a terminal [`LlmErrorKind`](crate::llm::LlmErrorKind).
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// HTTP 429 or an equivalent capacity signal.
    #[error("rate limited on {route} (reset after {reset_after:?})")]
    RateLimited {
        /// Route that was limited.
        route: ProviderRoute,
        /// Vendor-reported time until the limit resets, if any.
        reset_after: Option<Duration>,
    },

    /// 5xx, overloaded or throttling responses.
    #[error("server error {status} on {route}: {message}")]
    Server {
        /// Route that failed.
        route: ProviderRoute,
        /// HTTP status code.
        status: u16,
        /// Vendor error message.
        message: String,
    },

    /// Connection, TLS or timeout failure before a response arrived.
    #[error("transport error on {route}: {message}")]
    Transport {
        /// Route that failed.
        route: ProviderRoute,
        /// Underlying error description.
        message: String,
    },

    /// Non-retryable vendor error (4xx other than 429, quota exhaustion).
    #[error("API error {status:?} on {route}: {message}")]
    Api {
        /// Route that failed.
        route: ProviderRoute,
        /// HTTP status code, if the failure came from a response.
        status: Option<u16>,
        /// Vendor error message.
        message: String,
    },

    /// The response body did not match the vendor's documented shape.
    #[error("could not decode response from {route}: {message}")]
    Decode {
        /// Route that produced the response.
        route: ProviderRoute,
        /// Decoder error description.
        message: String,
    },

    /// The adapter is missing credentials or endpoint configuration.
    #[error("{route} is not configured: {message}")]
    NotConfigured {
        /// Route lacking configuration.
        route: ProviderRoute,
        /// What is missing.
        message: String,
    },
}

impl ProviderError {
    /// Route the error originated from.
    #[must_use]
    pub const fn route(&self) -> ProviderRoute {
        match self {
            Self::RateLimited { route, .. }
            | Self::Server { route, .. }
            | Self::Transport { route, .. }
            | Self::Api { route, .. }
            | Self::Decode { route, .. }
            | Self::NotConfigured { route, .. } => *route,
        }
    }

    /// Whether exponential backoff applies to this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Server { .. } | Self::Transport { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value failed to parse.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Setting name.
        key: String,
        /// Why it was rejected.
        message: String,
    },

    /// An entity type definition file could not be loaded.
    #[error("invalid entity type definition {path}: {message}")]
    EntityType {
        /// Source path.
        path: String,
        /// Why it was rejected.
        message: String,
    },

    /// Unknown model identifier.
    #[error("unknown model: {name}")]
    UnknownModel {
        /// The identifier that failed to resolve.
        name: String,
    },
}

/// Snapshot storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(String),

    /// A stored snapshot could not be decoded.
    #[error("corrupt snapshot {worker_id}: {message}")]
    CorruptSnapshot {
        /// Worker instance the snapshot belongs to.
        worker_id: String,
        /// Decoder error.
        message: String,
    },
}

#[cfg(feature = "sqlite-checkpoints")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// External service errors (graph store, web search, web fetch).
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// Temporary failure; the retry wrapper may try again.
    #[error("{service} temporarily unavailable: {message}")]
    Unavailable {
        /// Service name.
        service: &'static str,
        /// Failure description.
        message: String,
    },

    /// Permanent failure; retrying will not help.
    #[error("{service} rejected the request: {message}")]
    Rejected {
        /// Service name.
        service: &'static str,
        /// Failure description.
        message: String,
    },

    /// The requested resource does not exist.
    #[error("{service}: not found: {what}")]
    NotFound {
        /// Service name.
        service: &'static str,
        /// Missing resource.
        what: String,
    },
}

impl ServiceError {
    /// Whether the retry wrapper should try again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Coordination engine errors.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The gateway returned a terminal failure.
    #[error("LLM call for {agent} failed: {message}")]
    Llm {
        /// Agent that made the call.
        agent: &'static str,
        /// Failure summary.
        message: String,
    },

    /// The model's tool input could not be turned into a typed action.
    #[error("could not interpret {tool} input: {message}")]
    ToolInput {
        /// Tool name.
        tool: String,
        /// Decoder error.
        message: String,
    },

    /// The run was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Illegal worker state transition.
    #[error("invalid worker transition from {from} to {to}")]
    InvalidTransition {
        /// Current phase.
        from: String,
        /// Requested phase.
        to: String,
    },

    /// Research goal rejected before any work started.
    #[error("invalid research goal: {message}")]
    InvalidGoal {
        /// Why it was rejected.
        message: String,
    },

    /// External service failure surfaced to the caller.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Snapshot persistence failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// CLI command errors.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Invalid argument combination or value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A file could not be read.
    #[error("cannot read {path}: {message}")]
    ReadFile {
        /// Path that failed.
        path: String,
        /// Underlying error.
        message: String,
    },

    /// Requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The command ran but could not finish.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// A document failed schema validation.
    #[error("document does not match the schema:\n{0}")]
    InvalidDocument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_route() {
        let err = ProviderError::Server {
            route: ProviderRoute::OpenAi,
            status: 503,
            message: "busy".to_string(),
        };
        assert_eq!(err.route(), ProviderRoute::OpenAi);
        assert!(err.is_transient());
    }

    #[test]
    fn test_rate_limit_is_not_transient() {
        let err = ProviderError::RateLimited {
            route: ProviderRoute::AnthropicDirect,
            reset_after: None,
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_service_error_transient() {
        let err = ServiceError::Unavailable {
            service: "graph",
            message: "timeout".to_string(),
        };
        assert!(err.is_transient());
        let err = ServiceError::Rejected {
            service: "graph",
            message: "bad".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_display_chain() {
        let err: Error = AgentError::Cancelled.into();
        assert_eq!(err.to_string(), "cancelled");
    }
}
