//! Core data types flowing between tasks.
//!
//! Every value travelling through a chain carries both a JSON payload and a
//! [`DataType`] tag. The tag set is closed: handlers and transitions switch
//! on it, and the HTTP surface serialises it by lowercase snake name.

pub mod chat;
pub mod openai;
pub mod streaming;

use serde::{Deserialize, Serialize};

pub use chat::{ChatHistory, FunctionCall, Message, ToolCall};
pub use openai::{
    ChatCompletionChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Usage,
};
pub use streaming::StreamParcel;

/// The closed set of data types a task input or output may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Untyped passthrough; only `noop` and hooks accept it.
    Any,
    String,
    Bool,
    Int,
    Float,
    /// A sequence of floats, as produced by embedding models.
    Vector,
    SearchResults,
    Json,
    ChatHistory,
    OpenaiChat,
    OpenaiChatResponse,
}

impl DataType {
    /// The lowercase snake name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Any => "any",
            DataType::String => "string",
            DataType::Bool => "bool",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Vector => "vector",
            DataType::SearchResults => "search_results",
            DataType::Json => "json",
            DataType::ChatHistory => "chat_history",
            DataType::OpenaiChat => "openai_chat",
            DataType::OpenaiChatResponse => "openai_chat_response",
        }
    }

    /// Parse a wire name back into a tag.
    pub fn parse(s: &str) -> Option<DataType> {
        match s {
            "any" => Some(DataType::Any),
            "string" => Some(DataType::String),
            "bool" => Some(DataType::Bool),
            "int" => Some(DataType::Int),
            "float" => Some(DataType::Float),
            "vector" => Some(DataType::Vector),
            "search_results" => Some(DataType::SearchResults),
            "json" => Some(DataType::Json),
            "chat_history" => Some(DataType::ChatHistory),
            "openai_chat" => Some(DataType::OpenaiChat),
            "openai_chat_response" => Some(DataType::OpenaiChatResponse),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
