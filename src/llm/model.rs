//! Supported models and their limits.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::provider::ProviderKind;
use crate::error::ConfigError;

/// A model the gateway can route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmModel {
    /// Claude Opus 4.1.
    ClaudeOpus41,
    /// Claude Sonnet 4.5.
    ClaudeSonnet45,
    /// Claude Sonnet 4.
    ClaudeSonnet4,
    /// Claude Haiku 4.5.
    ClaudeHaiku45,
    /// Claude 3.5 Haiku.
    Claude35Haiku,
    /// GPT-4o.
    Gpt4o,
    /// GPT-4o mini.
    Gpt4oMini,
    /// GPT-4.1.
    Gpt41,
    /// GPT-5.
    Gpt5,
    /// Gemini 2.5 Pro.
    Gemini25Pro,
    /// Gemini 2.5 Flash.
    Gemini25Flash,
}

impl LlmModel {
    /// Every supported model, grouped by provider.
    pub const ALL: [Self; 11] = [
        Self::ClaudeOpus41,
        Self::ClaudeSonnet45,
        Self::ClaudeSonnet4,
        Self::ClaudeHaiku45,
        Self::Claude35Haiku,
        Self::Gpt4o,
        Self::Gpt4oMini,
        Self::Gpt41,
        Self::Gpt5,
        Self::Gemini25Pro,
        Self::Gemini25Flash,
    ];

    /// Public model identifier sent to the vendor.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::ClaudeOpus41 => "claude-opus-4-1-20250805",
            Self::ClaudeSonnet45 => "claude-sonnet-4-5-20250929",
            Self::ClaudeSonnet4 => "claude-sonnet-4-20250514",
            Self::ClaudeHaiku45 => "claude-haiku-4-5-20251001",
            Self::Claude35Haiku => "claude-3-5-haiku-20241022",
            Self::Gpt4o => "gpt-4o",
            Self::Gpt4oMini => "gpt-4o-mini",
            Self::Gpt41 => "gpt-4.1",
            Self::Gpt5 => "gpt-5",
            Self::Gemini25Pro => "gemini-2.5-pro",
            Self::Gemini25Flash => "gemini-2.5-flash",
        }
    }

    /// Provider that serves the model.
    #[must_use]
    pub const fn provider(self) -> ProviderKind {
        match self {
            Self::ClaudeOpus41
            | Self::ClaudeSonnet45
            | Self::ClaudeSonnet4
            | Self::ClaudeHaiku45
            | Self::Claude35Haiku => ProviderKind::Anthropic,
            Self::Gpt4o | Self::Gpt4oMini | Self::Gpt41 | Self::Gpt5 => ProviderKind::OpenAi,
            Self::Gemini25Pro | Self::Gemini25Flash => ProviderKind::Google,
        }
    }

    /// Context window in tokens.
    #[must_use]
    pub const fn context_window(self) -> u32 {
        match self {
            Self::ClaudeOpus41
            | Self::ClaudeSonnet45
            | Self::ClaudeSonnet4
            | Self::ClaudeHaiku45
            | Self::Claude35Haiku => 200_000,
            Self::Gpt4o | Self::Gpt4oMini => 128_000,
            Self::Gpt41 => 1_047_576,
            Self::Gpt5 => 400_000,
            Self::Gemini25Pro | Self::Gemini25Flash => 1_048_576,
        }
    }

    /// Maximum output tokens per response.
    #[must_use]
    pub const fn max_output_tokens(self) -> u32 {
        match self {
            Self::ClaudeOpus41 => 32_000,
            Self::ClaudeSonnet45 | Self::ClaudeSonnet4 | Self::ClaudeHaiku45 => 64_000,
            Self::Claude35Haiku => 8_192,
            Self::Gpt4o | Self::Gpt4oMini => 16_384,
            Self::Gpt41 => 32_768,
            Self::Gpt5 => 128_000,
            Self::Gemini25Pro | Self::Gemini25Flash => 65_536,
        }
    }

    /// Model id on the managed-inference (Bedrock) route, Anthropic only.
    #[must_use]
    pub const fn managed_id(self) -> Option<&'static str> {
        match self {
            Self::ClaudeOpus41 => Some("us.anthropic.claude-opus-4-1-20250805-v1:0"),
            Self::ClaudeSonnet45 => Some("us.anthropic.claude-sonnet-4-5-20250929-v1:0"),
            Self::ClaudeSonnet4 => Some("us.anthropic.claude-sonnet-4-20250514-v1:0"),
            Self::ClaudeHaiku45 => Some("us.anthropic.claude-haiku-4-5-20251001-v1:0"),
            Self::Claude35Haiku => Some("us.anthropic.claude-3-5-haiku-20241022-v1:0"),
            _ => None,
        }
    }
}

impl fmt::Display for LlmModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for LlmModel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.id() == wanted || m.managed_id() == Some(wanted))
            .ok_or_else(|| ConfigError::UnknownModel {
                name: wanted.to_string(),
            })
    }
}

impl Serialize for LlmModel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id())
    }
}

impl<'de> Deserialize<'de> for LlmModel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_ids() {
        for model in LlmModel::ALL {
            assert_eq!(model.id().parse::<LlmModel>().ok(), Some(model));
            assert!(model.max_output_tokens() < model.context_window());
        }
    }

    #[test]
    fn test_managed_ids_only_for_anthropic() {
        for model in LlmModel::ALL {
            assert_eq!(
                model.managed_id().is_some(),
                model.provider() == ProviderKind::Anthropic
            );
        }
    }

    #[test]
    fn test_parse_managed_id() {
        let parsed: LlmModel = "us.anthropic.claude-sonnet-4-5-20250929-v1:0"
            .parse()
            .unwrap_or(LlmModel::Gpt4o);
        assert_eq!(parsed, LlmModel::ClaudeSonnet45);
    }

    #[test]
    fn test_unknown_model() {
        let err = "gpt-2".parse::<LlmModel>().err();
        assert!(matches!(err, Some(ConfigError::UnknownModel { .. })));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&LlmModel::Gemini25Flash).unwrap_or_default();
        assert_eq!(json, "\"gemini-2.5-flash\"");
        let back: LlmModel = serde_json::from_str(&json).unwrap_or(LlmModel::Gpt4o);
        assert_eq!(back, LlmModel::Gemini25Flash);
    }
}
