//! Chat history and message types.
//!
//! A [`ChatHistory`] is the canonical conversational value: an ordered list
//! of messages plus the model that produced the latest assistant turn and
//! cumulative token counts. The chat-completion handler appends to it; the
//! compose strategies merge it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A tool invocation attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_tool_type() -> String {
    "function".to_string()
}

/// The function half of a tool call: a name plus JSON-encoded arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub call_tools: Vec<ToolCall>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh id and the current timestamp.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: role.into(),
            content: content.into(),
            tool_call_id: None,
            call_tools: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// A conversation with bookkeeping for model routing and token budgets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatHistory {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

impl ChatHistory {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// The most recent message, if any.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Whether the history already opens with an identical system message.
    pub fn has_system_instruction(&self, instruction: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.role == "system" && m.content == instruction)
    }

    /// Decode a `chat_history`-tagged JSON value.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Encode back to a JSON value for the variable environment.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let m = Message::user("hi");
        assert_eq!(m.role, "user");
        assert_eq!(m.content, "hi");
        assert!(!m.id.is_empty());
        assert!(m.call_tools.is_empty());
    }

    #[test]
    fn test_has_system_instruction() {
        let history = ChatHistory::new(vec![Message::system("be brief"), Message::user("hi")]);
        assert!(history.has_system_instruction("be brief"));
        assert!(!history.has_system_instruction("be verbose"));
    }

    #[test]
    fn test_chat_history_value_round_trip() {
        let history = ChatHistory {
            messages: vec![Message::user("q")],
            model: "m1".to_string(),
            input_tokens: 3,
            output_tokens: 0,
        };
        let value = history.to_value();
        let back = ChatHistory::from_value(&value).unwrap();
        assert_eq!(back, history);
    }

    #[test]
    fn test_tool_call_default_type() {
        let raw = serde_json::json!({
            "id": "call_1",
            "function": {"name": "lookup", "arguments": "{}"}
        });
        let call: ToolCall = serde_json::from_value(raw).unwrap();
        assert_eq!(call.call_type, "function");
    }
}
