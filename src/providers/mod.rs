//! Provider capability model and per-vendor adapters.
//!
//! A [`Provider`] is a bound `(vendor, model, backend set)` able to serve
//! some subset of chat/prompt/embed/stream. Vendor adapters are
//! self-contained: each implements the client traits against its own HTTP
//! dialect and shares nothing beyond the capability surface. Clients are
//! short-lived and stateless beyond their HTTP configuration.

pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod wire;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::Backend;
use crate::types::chat::Message;
use crate::types::openai::Usage;
use crate::types::streaming::ParcelStream;

/// Maximum number of response-body bytes surfaced in error messages.
pub const ERROR_BODY_EXCERPT: usize = 512;

/// The vendors the runtime can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Ollama,
    Openai,
    Vllm,
    Gemini,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Ollama => "ollama",
            ProviderType::Openai => "openai",
            ProviderType::Vllm => "vllm",
            ProviderType::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<ProviderType> {
        match s {
            "ollama" => Some(ProviderType::Ollama),
            "openai" => Some(ProviderType::Openai),
            "vllm" => Some(ProviderType::Vllm),
            "gemini" => Some(ProviderType::Gemini),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a provider can do. `can_think` is carried through the catalog but
/// not consulted by the resolver predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_chat: bool,
    pub can_embed: bool,
    pub can_stream: bool,
    pub can_prompt: bool,
    #[serde(default)]
    pub can_think: bool,
}

/// A routable `(vendor, model, backends)` binding. Constructed on demand
/// from runtime state; no mutable fields after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub provider_type: ProviderType,
    pub model_name: String,
    pub backend_ids: Vec<String>,
    pub context_length: i64,
    pub capabilities: Capabilities,
}

impl Provider {
    pub fn new(
        provider_type: ProviderType,
        model_name: impl Into<String>,
        backend_ids: Vec<String>,
        context_length: i64,
        capabilities: Capabilities,
    ) -> Self {
        let model_name = model_name.into();
        Self {
            id: format!("{}:{}", provider_type, model_name),
            provider_type,
            model_name,
            backend_ids,
            context_length,
            capabilities,
        }
    }

    /// Model name before the tag separator (`"llama3:8b"` → `"llama3"`).
    pub fn base_name(&self) -> &str {
        self.model_name
            .split_once(':')
            .map(|(base, _)| base)
            .unwrap_or(&self.model_name)
    }

    /// Does the requested model name match this provider, by full or base
    /// name?
    pub fn matches_name(&self, requested: &str) -> bool {
        self.model_name == requested || self.base_name() == requested
    }

    /// A chat client bound to one of this provider's backends.
    pub fn chat_client(
        &self,
        backend: &Backend,
        http: reqwest::Client,
    ) -> Result<Box<dyn ChatClient>, ProviderError> {
        if !self.capabilities.can_chat {
            return Err(ProviderError::Unsupported(format!(
                "{} cannot chat",
                self.id
            )));
        }
        Ok(match self.provider_type {
            ProviderType::Ollama => Box::new(ollama::OllamaClient::new(
                http,
                &backend.base_url,
                &self.model_name,
            )),
            ProviderType::Openai | ProviderType::Vllm => Box::new(
                openai::OpenAiCompatClient::new(http, &backend.base_url, &self.model_name),
            ),
            ProviderType::Gemini => Box::new(gemini::GeminiClient::new(
                http,
                &backend.base_url,
                &self.model_name,
            )),
        })
    }

    /// A prompt (plain completion) client bound to one backend.
    pub fn prompt_client(
        &self,
        backend: &Backend,
        http: reqwest::Client,
    ) -> Result<Box<dyn PromptClient>, ProviderError> {
        if !self.capabilities.can_prompt {
            return Err(ProviderError::Unsupported(format!(
                "{} cannot prompt",
                self.id
            )));
        }
        Ok(match self.provider_type {
            ProviderType::Ollama => Box::new(ollama::OllamaClient::new(
                http,
                &backend.base_url,
                &self.model_name,
            )),
            ProviderType::Openai | ProviderType::Vllm => Box::new(
                openai::OpenAiCompatClient::new(http, &backend.base_url, &self.model_name),
            ),
            ProviderType::Gemini => Box::new(gemini::GeminiClient::new(
                http,
                &backend.base_url,
                &self.model_name,
            )),
        })
    }

    /// An embedding client bound to one backend.
    pub fn embed_client(
        &self,
        backend: &Backend,
        http: reqwest::Client,
    ) -> Result<Box<dyn EmbedClient>, ProviderError> {
        if !self.capabilities.can_embed {
            return Err(ProviderError::Unsupported(format!(
                "{} cannot embed",
                self.id
            )));
        }
        Ok(match self.provider_type {
            ProviderType::Ollama => Box::new(ollama::OllamaClient::new(
                http,
                &backend.base_url,
                &self.model_name,
            )),
            ProviderType::Openai | ProviderType::Vllm => Box::new(
                openai::OpenAiCompatClient::new(http, &backend.base_url, &self.model_name),
            ),
            ProviderType::Gemini => Box::new(gemini::GeminiClient::new(
                http,
                &backend.base_url,
                &self.model_name,
            )),
        })
    }

    /// A streaming chat client bound to one backend.
    pub fn stream_client(
        &self,
        backend: &Backend,
        http: reqwest::Client,
    ) -> Result<Box<dyn StreamClient>, ProviderError> {
        if !self.capabilities.can_stream {
            return Err(ProviderError::Unsupported(format!(
                "{} cannot stream",
                self.id
            )));
        }
        Ok(match self.provider_type {
            ProviderType::Ollama => Box::new(ollama::OllamaClient::new(
                http,
                &backend.base_url,
                &self.model_name,
            )),
            ProviderType::Openai | ProviderType::Vllm => Box::new(
                openai::OpenAiCompatClient::new(http, &backend.base_url, &self.model_name),
            ),
            ProviderType::Gemini => Box::new(gemini::GeminiClient::new(
                http,
                &backend.base_url,
                &self.model_name,
            )),
        })
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backend answered with a non-2xx status.
    #[error("backend returned {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never completed (connect, timeout, body read).
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered 2xx but the body did not have the expected
    /// shape.
    #[error("undecodable response: {0}")]
    Decode(String),

    /// The provider lacks the requested capability.
    #[error("capability not supported: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transport(e.to_string())
    }
}

/// Trim a response body for inclusion in an error message.
pub fn excerpt(body: &str) -> String {
    if body.len() <= ERROR_BODY_EXCERPT {
        body.to_string()
    } else {
        let mut cut = ERROR_BODY_EXCERPT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &body[..cut])
    }
}

// ---------------------------------------------------------------------------
// Client traits
// ---------------------------------------------------------------------------

/// Generation options shared by chat and stream calls.
#[derive(Debug, Clone, Default)]
pub struct ChatCallOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub tools: Option<Vec<Value>>,
}

/// One completed assistant turn plus whatever usage the backend reported.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub message: Message,
    pub usage: Option<Usage>,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    fn model(&self) -> &str;
    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatCallOptions,
    ) -> Result<ChatTurn, ProviderError>;
}

#[async_trait]
pub trait PromptClient: Send + Sync {
    fn model(&self) -> &str;
    async fn prompt(
        &self,
        prompt: &str,
        temperature: Option<f64>,
    ) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait EmbedClient: Send + Sync {
    fn model(&self) -> &str;
    async fn embed(&self, input: &str) -> Result<Vec<f64>, ProviderError>;
}

#[async_trait]
pub trait StreamClient: Send + Sync {
    fn model(&self) -> &str;
    async fn stream_chat(
        &self,
        messages: &[Message],
        options: &ChatCallOptions,
    ) -> Result<ParcelStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(model: &str) -> Provider {
        Provider::new(
            ProviderType::Ollama,
            model,
            vec!["b1".to_string()],
            4096,
            Capabilities {
                can_chat: true,
                can_prompt: true,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_provider_id_and_base_name() {
        let p = provider("llama3:8b");
        assert_eq!(p.id, "ollama:llama3:8b");
        assert_eq!(p.base_name(), "llama3");
        assert!(p.matches_name("llama3:8b"));
        assert!(p.matches_name("llama3"));
        assert!(!p.matches_name("llama2"));
    }

    #[test]
    fn test_capability_gate() {
        let p = provider("llama3");
        let backend = Backend {
            id: "b1".to_string(),
            name: "local".to_string(),
            base_url: "http://localhost:11434".to_string(),
            backend_type: ProviderType::Ollama,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let http = reqwest::Client::new();
        assert!(p.chat_client(&backend, http.clone()).is_ok());
        assert!(matches!(
            p.embed_client(&backend, http),
            Err(ProviderError::Unsupported(_))
        ));
    }

    #[test]
    fn test_excerpt_bounds_body() {
        let long = "x".repeat(2000);
        let e = excerpt(&long);
        assert!(e.len() < 600);
        assert!(e.ends_with('…'));
        assert_eq!(excerpt("short"), "short");
    }

    #[test]
    fn test_provider_type_parse() {
        assert_eq!(ProviderType::parse("vllm"), Some(ProviderType::Vllm));
        assert_eq!(ProviderType::parse("azure"), None);
    }
}
