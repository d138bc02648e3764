//! Provider communication types.
//!
//! These are wire-facing, not domain types: they mirror what chat-completion
//! APIs exchange and what the context manager persists per message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A tool call the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Content blocks that can appear in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { text: String },

    ToolUse { id: String, name: String, input: Value },

    ToolResult {
        tool_use_id: String,
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Unified message format for provider communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: Vec<Content>,
}

impl ModelMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    /// Concatenated text blocks.
    pub fn text_content(&self) -> String {
        let mut combined = String::new();
        for block in &self.content {
            if let Content::Text { text } = block {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(text);
            }
        }
        combined
    }

    /// Tool calls carried by an assistant message.
    pub fn tool_calls(&self) -> Vec<AiToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                Content::ToolUse { id, name, input } => Some(AiToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl Usage {
    pub fn total(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Stop,
    ToolCalls,
    Length,
    Error,
}

/// Streaming parts produced by a provider.
#[derive(Debug, Clone)]
pub enum StreamPart {
    TextDelta { delta: String },
    ToolCallStart { id: String, name: String },
    ToolCallComplete { tool_call: AiToolCall },
    Usage { usage: Usage },
    Done { reason: DoneReason },
    Error { error: String, transient: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_calls_extracted_from_assistant_content() {
        let msg = ModelMessage {
            role: Role::Assistant,
            content: vec![
                Content::Text {
                    text: "running".to_string(),
                },
                Content::ToolUse {
                    id: "call_1".to_string(),
                    name: "read".to_string(),
                    input: json!({"path": "a.txt"}),
                },
            ],
        };
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read");
    }

    #[test]
    fn content_round_trips_through_json() {
        let block = Content::ToolResult {
            tool_use_id: "call_1".to_string(),
            output: "ok".to_string(),
            is_error: None,
        };
        let json = serde_json::to_string(&block).unwrap();
        let back: Content = serde_json::from_str(&json).unwrap();
        assert_eq!(block, back);
    }
}
