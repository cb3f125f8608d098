//! Gateway configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment variables → defaults.
//! A configuration with no credentials at all is valid; calls to an
//! unconfigured provider fail with `internal-error`.

use std::time::Duration;

use crate::error::ConfigError;

/// Default Anthropic API base URL.
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
/// Default OpenAI API base URL.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
/// Default Google generative language base URL.
pub const DEFAULT_GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com";
/// Default AWS region for the managed-inference route.
pub const DEFAULT_MANAGED_REGION: &str = "us-east-1";

/// Default HTTP timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// Default rate-limit retries per call.
const DEFAULT_MAX_RATE_LIMIT_RETRIES: u32 = 10;
/// Default server-error retries per call.
const DEFAULT_MAX_SERVER_RETRIES: u32 = 10;
/// Default corrective resubmissions after invalid tool input.
const DEFAULT_MAX_VALIDATION_RETRIES: u32 = 3;
/// Wait used when a 429 carries no reset information.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(10);
/// First backoff step for server errors.
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Upper bound for a single backoff step.
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Retry limits applied by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimits {
    /// Rate-limit retries before `exceeded-maximum-retries`.
    pub max_rate_limit_retries: u32,
    /// Server/transport retries before `exceeded-maximum-retries`.
    pub max_server_retries: u32,
    /// Corrective resubmissions after invalid tool input.
    pub max_validation_retries: u32,
    /// Wait used when a 429 carries no reset information.
    pub default_rate_limit_wait: Duration,
    /// First backoff step.
    pub backoff_base: Duration,
    /// Upper bound for a single backoff step.
    pub backoff_cap: Duration,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: DEFAULT_MAX_RATE_LIMIT_RETRIES,
            max_server_retries: DEFAULT_MAX_SERVER_RETRIES,
            max_validation_retries: DEFAULT_MAX_VALIDATION_RETRIES,
            default_rate_limit_wait: DEFAULT_RATE_LIMIT_WAIT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

/// Credentials and endpoints for every vendor.
#[derive(Clone, Default)]
pub struct GatewayConfig {
    /// Anthropic API key (direct route).
    pub anthropic_api_key: Option<String>,
    /// Anthropic base URL override.
    pub anthropic_base_url: Option<String>,
    /// Bearer token for the managed-inference route.
    pub managed_token: Option<String>,
    /// Region of the managed-inference endpoint.
    pub managed_region: Option<String>,
    /// Managed-inference endpoint override (tests, VPC endpoints).
    pub managed_base_url: Option<String>,
    /// OpenAI API key.
    pub openai_api_key: Option<String>,
    /// OpenAI-compatible base URL override.
    pub openai_base_url: Option<String>,
    /// Google AI API key.
    pub google_api_key: Option<String>,
    /// Google base URL override.
    pub google_base_url: Option<String>,
    /// HTTP timeout per request.
    pub timeout: Duration,
    /// Retry limits.
    pub retry: RetryLimits,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("GatewayConfig")
            .field("anthropic_api_key", &redact(&self.anthropic_api_key))
            .field("anthropic_base_url", &self.anthropic_base_url)
            .field("managed_token", &redact(&self.managed_token))
            .field("managed_region", &self.managed_region)
            .field("managed_base_url", &self.managed_base_url)
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("openai_base_url", &self.openai_base_url)
            .field("google_api_key", &redact(&self.google_api_key))
            .field("google_base_url", &self.google_base_url)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl GatewayConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a numeric variable is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder().from_env()?.build()
    }

    /// Anthropic base URL with the default applied.
    #[must_use]
    pub fn anthropic_base_url(&self) -> &str {
        self.anthropic_base_url
            .as_deref()
            .unwrap_or(DEFAULT_ANTHROPIC_BASE_URL)
    }

    /// Managed-inference base URL for the configured region.
    #[must_use]
    pub fn managed_base_url(&self) -> String {
        self.managed_base_url.clone().unwrap_or_else(|| {
            let region = self
                .managed_region
                .as_deref()
                .unwrap_or(DEFAULT_MANAGED_REGION);
            format!("https://bedrock-runtime.{region}.amazonaws.com")
        })
    }

    /// OpenAI base URL with the default applied.
    #[must_use]
    pub fn openai_base_url(&self) -> &str {
        self.openai_base_url
            .as_deref()
            .unwrap_or(DEFAULT_OPENAI_BASE_URL)
    }

    /// Google base URL with the default applied.
    #[must_use]
    pub fn google_base_url(&self) -> &str {
        self.google_base_url
            .as_deref()
            .unwrap_or(DEFAULT_GOOGLE_BASE_URL)
    }
}

/// Builder for [`GatewayConfig`].
#[derive(Debug, Clone, Default)]
pub struct GatewayConfigBuilder {
    anthropic_api_key: Option<String>,
    anthropic_base_url: Option<String>,
    managed_token: Option<String>,
    managed_region: Option<String>,
    managed_base_url: Option<String>,
    openai_api_key: Option<String>,
    openai_base_url: Option<String>,
    google_api_key: Option<String>,
    google_base_url: Option<String>,
    timeout: Option<Duration>,
    retry: Option<RetryLimits>,
}

fn env_first(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .filter(|v| !v.trim().is_empty())
}

impl GatewayConfigBuilder {
    /// Populates unset fields from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for an unparsable timeout.
    pub fn from_env(mut self) -> Result<Self, ConfigError> {
        if self.anthropic_api_key.is_none() {
            self.anthropic_api_key = env_first(&["ANTHROPIC_API_KEY"]);
        }
        if self.anthropic_base_url.is_none() {
            self.anthropic_base_url = env_first(&["ANTHROPIC_BASE_URL"]);
        }
        if self.managed_token.is_none() {
            self.managed_token = env_first(&["QUARRY_BEDROCK_TOKEN", "AWS_BEARER_TOKEN_BEDROCK"]);
        }
        if self.managed_region.is_none() {
            self.managed_region = env_first(&["QUARRY_BEDROCK_REGION", "AWS_REGION"]);
        }
        if self.openai_api_key.is_none() {
            self.openai_api_key = env_first(&["OPENAI_API_KEY"]);
        }
        if self.openai_base_url.is_none() {
            self.openai_base_url = env_first(&["OPENAI_BASE_URL"]);
        }
        if self.google_api_key.is_none() {
            self.google_api_key = env_first(&["GOOGLE_AI_API_KEY", "GEMINI_API_KEY"]);
        }
        if self.timeout.is_none()
            && let Some(raw) = env_first(&["QUARRY_HTTP_TIMEOUT_SECS"])
        {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "QUARRY_HTTP_TIMEOUT_SECS".to_string(),
                message: format!("expected whole seconds, got {raw:?}"),
            })?;
            self.timeout = Some(Duration::from_secs(secs));
        }
        Ok(self)
    }

    /// Sets the Anthropic API key.
    #[must_use]
    pub fn anthropic_api_key(mut self, key: impl Into<String>) -> Self {
        self.anthropic_api_key = Some(key.into());
        self
    }

    /// Sets the Anthropic base URL.
    #[must_use]
    pub fn anthropic_base_url(mut self, url: impl Into<String>) -> Self {
        self.anthropic_base_url = Some(url.into());
        self
    }

    /// Sets the managed-inference bearer token.
    #[must_use]
    pub fn managed_token(mut self, token: impl Into<String>) -> Self {
        self.managed_token = Some(token.into());
        self
    }

    /// Sets the managed-inference region.
    #[must_use]
    pub fn managed_region(mut self, region: impl Into<String>) -> Self {
        self.managed_region = Some(region.into());
        self
    }

    /// Sets the managed-inference base URL.
    #[must_use]
    pub fn managed_base_url(mut self, url: impl Into<String>) -> Self {
        self.managed_base_url = Some(url.into());
        self
    }

    /// Sets the OpenAI API key.
    #[must_use]
    pub fn openai_api_key(mut self, key: impl Into<String>) -> Self {
        self.openai_api_key = Some(key.into());
        self
    }

    /// Sets the OpenAI-compatible base URL.
    #[must_use]
    pub fn openai_base_url(mut self, url: impl Into<String>) -> Self {
        self.openai_base_url = Some(url.into());
        self
    }

    /// Sets the Google API key.
    #[must_use]
    pub fn google_api_key(mut self, key: impl Into<String>) -> Self {
        self.google_api_key = Some(key.into());
        self
    }

    /// Sets the Google base URL.
    #[must_use]
    pub fn google_base_url(mut self, url: impl Into<String>) -> Self {
        self.google_base_url = Some(url.into());
        self
    }

    /// Sets the HTTP timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry limits.
    #[must_use]
    pub const fn retry(mut self, retry: RetryLimits) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a zero timeout.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        let timeout = self
            .timeout
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        if timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(GatewayConfig {
            anthropic_api_key: self.anthropic_api_key,
            anthropic_base_url: self.anthropic_base_url,
            managed_token: self.managed_token,
            managed_region: self.managed_region,
            managed_base_url: self.managed_base_url,
            openai_api_key: self.openai_api_key,
            openai_base_url: self.openai_base_url,
            google_api_key: self.google_api_key,
            google_base_url: self.google_base_url,
            timeout,
            retry: self.retry.unwrap_or_default(),
        })
    }
}
