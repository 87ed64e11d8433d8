//! OpenAI-compatible wire shapes.
//!
//! These mirror the `/chat/completions` and `/embeddings` request and
//! response bodies. They double as the `openai_chat` /
//! `openai_chat_response` data types inside chains, so conversions to and
//! from [`ChatHistory`] live here as well.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::chat::{ChatHistory, Message, ToolCall};

/// One message in an OpenAI chat request or response choice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// An OpenAI-compatible chat completion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// Token usage block of a chat completion response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// One choice of a chat completion response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// An OpenAI-compatible chat completion response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    #[serde(default = "default_object")]
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    pub usage: Usage,
}

fn default_object() -> String {
    "chat.completion".to_string()
}

impl ChatCompletionRequest {
    /// Convert an incoming OpenAI request into the internal history form.
    ///
    /// Request-level ids and timestamps are synthesised; the request's model
    /// rides along so routing can honour it.
    pub fn to_chat_history(&self) -> ChatHistory {
        let messages = self
            .messages
            .iter()
            .map(|m| Message {
                id: Uuid::new_v4().to_string(),
                role: m.role.clone(),
                content: m.content.clone(),
                tool_call_id: m.tool_call_id.clone(),
                call_tools: m.tool_calls.clone().unwrap_or_default(),
                timestamp: Utc::now(),
            })
            .collect();
        ChatHistory {
            messages,
            model: self.model.clone(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

impl ChatCompletionResponse {
    /// Wrap a finished [`ChatHistory`] into a response with a single choice
    /// built from the last message, tool calls included.
    pub fn from_chat_history(history: &ChatHistory) -> Self {
        let last = history.last_message();
        let message = match last {
            Some(m) => ChatMessage {
                role: m.role.clone(),
                content: m.content.clone(),
                tool_call_id: m.tool_call_id.clone(),
                tool_calls: if m.call_tools.is_empty() {
                    None
                } else {
                    Some(m.call_tools.clone())
                },
            },
            None => ChatMessage {
                role: "assistant".to_string(),
                ..Default::default()
            },
        };
        let finish_reason = if message.tool_calls.is_some() {
            "tool_calls"
        } else {
            "stop"
        };
        Self {
            id: generate_completion_id(),
            object: default_object(),
            created: Utc::now().timestamp(),
            model: history.model.clone(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                message,
                finish_reason: Some(finish_reason.to_string()),
            }],
            usage: Usage {
                prompt_tokens: history.input_tokens,
                completion_tokens: history.output_tokens,
                total_tokens: history.input_tokens + history.output_tokens,
            },
        }
    }
}

/// Completion ids follow the `chatcmpl-<ns>-<rand>` convention.
pub fn generate_completion_id() -> String {
    let rand_part = Uuid::new_v4().simple().to_string();
    format!("chatcmpl-tc-{}", &rand_part[..12])
}
