//! Pluggable LLM provider trait.
//!
//! Adapters translate the provider-agnostic [`LlmRequest`] into one vendor's
//! wire format, send it over a single [`ProviderRoute`] and translate the
//! reply back. They never retry; the gateway owns every retry decision.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::message::Message;
use super::response::{LlmRequest, StopReason};
use super::usage::Usage;
use crate::error::ProviderError;

/// Vendor that owns a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Anthropic messages API.
    Anthropic,
    /// OpenAI-compatible chat completions.
    OpenAi,
    /// Google generative language API.
    Google,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Google => "google",
        })
    }
}

/// A concrete network path to a provider.
///
/// Anthropic has two: its own API and the managed-inference endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRoute {
    /// api.anthropic.com.
    AnthropicDirect,
    /// Anthropic models served through Amazon Bedrock.
    AnthropicManaged,
    /// OpenAI-compatible endpoint.
    OpenAi,
    /// Google generative language endpoint.
    Google,
}

impl ProviderRoute {
    /// Provider behind the route.
    #[must_use]
    pub const fn provider(self) -> ProviderKind {
        match self {
            Self::AnthropicDirect | Self::AnthropicManaged => ProviderKind::Anthropic,
            Self::OpenAi => ProviderKind::OpenAi,
            Self::Google => ProviderKind::Google,
        }
    }
}

impl fmt::Display for ProviderRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AnthropicDirect => "anthropic-direct",
            Self::AnthropicManaged => "anthropic-managed",
            Self::OpenAi => "openai",
            Self::Google => "google",
        })
    }
}

/// One successful vendor round-trip.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    /// Assistant message produced by the model.
    pub message: Message,
    /// Normalized stop reason.
    pub stop_reason: StopReason,
    /// Tokens consumed by this round-trip alone.
    pub usage: Usage,
}

/// Trait for LLM provider backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider this adapter speaks for.
    fn kind(&self) -> ProviderKind;

    /// Routes this adapter is configured for, in preference order.
    ///
    /// Empty when credentials are missing.
    fn routes(&self) -> Vec<ProviderRoute>;

    /// Sends one request over `route`.
    ///
    /// # Errors
    ///
    /// Returns a vendor-native [`ProviderError`]; the gateway classifies it.
    async fn complete(
        &self,
        request: &LlmRequest,
        route: ProviderRoute,
    ) -> Result<ProviderReply, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_provider() {
        assert_eq!(
            ProviderRoute::AnthropicManaged.provider(),
            ProviderKind::Anthropic
        );
        assert_eq!(ProviderRoute::Google.provider(), ProviderKind::Google);
        assert_eq!(ProviderRoute::AnthropicDirect.to_string(), "anthropic-direct");
    }
}
