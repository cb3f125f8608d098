//! Vendor adapters and the provider registry.
//!
//! Maps configured credentials to concrete [`LlmProvider`] implementations.

pub mod anthropic;
pub mod google;
pub mod http;
pub mod openai;

use std::sync::Arc;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;

use super::config::GatewayConfig;
use super::provider::LlmProvider;
use crate::error::ConfigError;

/// Creates one adapter per vendor.
///
/// Adapters without credentials are still returned; they report no routes
/// and the gateway answers calls to them with `internal-error`.
///
/// # Errors
///
/// Returns [`ConfigError`] if an HTTP client cannot be built.
pub fn create_providers(config: &GatewayConfig) -> Result<Vec<Arc<dyn LlmProvider>>, ConfigError> {
    Ok(vec![
        Arc::new(AnthropicProvider::new(config)?),
        Arc::new(OpenAiProvider::new(config)?),
        Arc::new(GoogleProvider::new(config)?),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::{ProviderKind, ProviderRoute};

    #[test]
    fn test_create_providers() {
        let config = GatewayConfig::builder()
            .openai_api_key("test")
            .build()
            .unwrap_or_else(|_| unreachable!());
        let providers = create_providers(&config).unwrap_or_default();
        let kinds: Vec<ProviderKind> = providers.iter().map(|p| p.kind()).collect();
        assert_eq!(
            kinds,
            vec![ProviderKind::Anthropic, ProviderKind::OpenAi, ProviderKind::Google]
        );
        let configured: Vec<ProviderRoute> = providers.iter().flat_map(|p| p.routes()).collect();
        assert_eq!(configured, vec![ProviderRoute::OpenAi]);
    }
}
