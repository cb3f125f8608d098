//! Provider-agnostic conversation types.
//!
//! A conversation alternates user and assistant messages. Assistant
//! messages carry text and tool-use blocks; user messages carry text and
//! tool-result blocks answering earlier tool uses. Adapters translate these
//! into each vendor's wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A block inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantContent {
    /// Free text.
    Text {
        /// The text.
        text: String,
    },
    /// A request to invoke a tool.
    ToolUse(ToolUse),
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    /// Identifier unique within the conversation.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Structured tool input (unvalidated until the gateway checks it).
    pub input: Value,
}

/// A block inside a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContent {
    /// Free text.
    Text {
        /// The text.
        text: String,
    },
    /// The result of a tool use.
    ToolResult {
        /// Id of the tool use this answers.
        tool_use_id: String,
        /// Result text.
        content: String,
        /// Whether the result reports a failure.
        #[serde(default)]
        is_error: bool,
    },
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    /// Input from the caller (or tool results).
    User {
        /// Ordered content blocks.
        content: Vec<UserContent>,
    },
    /// Output from the model.
    Assistant {
        /// Ordered content blocks.
        content: Vec<AssistantContent>,
    },
}

impl Message {
    /// Returns the tool uses in an assistant message (empty for user messages).
    #[must_use]
    pub fn tool_uses(&self) -> Vec<&ToolUse> {
        match self {
            Self::Assistant { content } => content
                .iter()
                .filter_map(|block| match block {
                    AssistantContent::ToolUse(tool_use) => Some(tool_use),
                    AssistantContent::Text { .. } => None,
                })
                .collect(),
            Self::User { .. } => Vec::new(),
        }
    }

    /// Concatenated text blocks of the message.
    #[must_use]
    pub fn text(&self) -> String {
        let parts: Vec<&str> = match self {
            Self::Assistant { content } => content
                .iter()
                .filter_map(|block| match block {
                    AssistantContent::Text { text } => Some(text.as_str()),
                    AssistantContent::ToolUse(_) => None,
                })
                .collect(),
            Self::User { content } => content
                .iter()
                .filter_map(|block| match block {
                    UserContent::Text { text } => Some(text.as_str()),
                    UserContent::ToolResult { .. } => None,
                })
                .collect(),
        };
        parts.join("\n")
    }

    /// Returns `true` for assistant messages.
    #[must_use]
    pub const fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant { .. })
    }
}

/// Creates a user message with a single text block.
#[must_use]
pub fn user_message(text: &str) -> Message {
    Message::User {
        content: vec![UserContent::Text {
            text: text.to_string(),
        }],
    }
}

/// Creates an assistant message with a single text block.
#[must_use]
pub fn assistant_message(text: &str) -> Message {
    Message::Assistant {
        content: vec![AssistantContent::Text {
            text: text.to_string(),
        }],
    }
}

/// Creates an assistant message containing only tool uses.
#[must_use]
pub fn assistant_tool_uses(tool_uses: Vec<ToolUse>) -> Message {
    Message::Assistant {
        content: tool_uses.into_iter().map(AssistantContent::ToolUse).collect(),
    }
}

/// Creates a tool-result block.
#[must_use]
pub fn tool_result(tool_use_id: &str, content: &str, is_error: bool) -> UserContent {
    UserContent::ToolResult {
        tool_use_id: tool_use_id.to_string(),
        content: content.to_string(),
        is_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tool_use(id: &str) -> ToolUse {
        ToolUse {
            id: id.to_string(),
            name: "webSearch".to_string(),
            input: json!({"query": "rust"}),
        }
    }

    #[test]
    fn test_user_message() {
        let msg = user_message("Hello");
        assert!(!msg.is_assistant());
        assert_eq!(msg.text(), "Hello");
        assert!(msg.tool_uses().is_empty());
    }

    #[test]
    fn test_assistant_tool_uses() {
        let msg = assistant_tool_uses(vec![sample_tool_use("a"), sample_tool_use("b")]);
        assert!(msg.is_assistant());
        let uses = msg.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[1].id, "b");
        assert!(msg.text().is_empty());
    }

    #[test]
    fn test_mixed_assistant_text() {
        let msg = Message::Assistant {
            content: vec![
                AssistantContent::Text {
                    text: "thinking".to_string(),
                },
                AssistantContent::ToolUse(sample_tool_use("x")),
                AssistantContent::Text {
                    text: "done".to_string(),
                },
            ],
        };
        assert_eq!(msg.text(), "thinking\ndone");
        assert_eq!(msg.tool_uses().len(), 1);
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::User {
            content: vec![tool_result("call_1", "ok", false)],
        };
        let json = serde_json::to_value(&msg).unwrap_or_default();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["tool_use_id"], "call_1");

        let back: Message = serde_json::from_value(json).unwrap_or_else(|_| unreachable!());
        assert_eq!(back, msg);
    }

    #[test]
    fn test_tool_use_block_serialization() {
        let msg = assistant_tool_uses(vec![sample_tool_use("t1")]);
        let json = serde_json::to_value(&msg).unwrap_or_default();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"][0]["type"], "tool_use");
        assert_eq!(json["content"][0]["name"], "webSearch");
    }
}
