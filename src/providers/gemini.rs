//! Gemini adapter.
//!
//! Dialect: `/v1beta/models/{name}:generateContent`,
//! `:streamGenerateContent?alt=sse`, `:embedContent`, authenticated via the
//! `X-Goog-Api-Key` header. Roles map `assistant` → `model`; system
//! messages travel in `systemInstruction`.

use futures::StreamExt;
use serde_json::{json, Value};

use super::wire::{sse_data, LineBuffer};
use super::{excerpt, ChatCallOptions, ChatClient, ChatTurn, EmbedClient, PromptClient,
    ProviderError, StreamClient};
use crate::types::chat::Message;
use crate::types::openai::Usage;
use crate::types::streaming::{ParcelStream, StreamParcel};

const API_KEY_HEADER: &str = "X-Goog-Api-Key";

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: std::env::var("GEMINI_API_KEY").unwrap_or_default(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/v1beta/models/{}:{}", self.base_url, self.model, action)
    }

    /// Split messages into Gemini `contents` plus an optional
    /// `systemInstruction` built from system messages.
    fn build_body(&self, messages: &[Message], options: &ChatCallOptions) -> Value {
        let mut contents = Vec::new();
        let mut system_parts = Vec::new();
        for m in messages {
            if m.role == "system" {
                system_parts.push(json!({"text": m.content}));
                continue;
            }
            let role = if m.role == "assistant" { "model" } else { "user" };
            contents.push(json!({"role": role, "parts": [{"text": m.content}]}));
        }
        let mut body = json!({"contents": contents});
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({"parts": system_parts});
        }
        if let Some(t) = options.temperature {
            body["generationConfig"] = json!({"temperature": t});
        }
        body
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Value, ProviderError> {
        let resp = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: excerpt(&text),
            });
        }
        serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))
    }

    /// List model names under this endpoint; the reconciler's health probe.
    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let resp = self
            .http
            .get(format!("{}/v1beta/models", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: excerpt(&text),
            });
        }
        let value: Value =
            serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let names = value
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str))
                    .map(|name| name.trim_start_matches("models/").to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }
}

fn first_candidate_text(value: &Value) -> Result<String, ProviderError> {
    value
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .ok_or_else(|| ProviderError::Decode("response carried no candidates".to_string()))
}

fn usage_from(value: &Value) -> Option<Usage> {
    let meta = value.get("usageMetadata")?;
    let prompt = meta.get("promptTokenCount").and_then(Value::as_i64)?;
    let completion = meta
        .get("candidatesTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    })
}

#[async_trait::async_trait]
impl ChatClient for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatCallOptions,
    ) -> Result<ChatTurn, ProviderError> {
        let body = self.build_body(messages, options);
        let value = self.post(&self.action_url("generateContent"), &body).await?;
        let text = first_candidate_text(&value)?;
        Ok(ChatTurn {
            message: Message::assistant(text),
            usage: usage_from(&value),
        })
    }
}

#[async_trait::async_trait]
impl PromptClient for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn prompt(
        &self,
        prompt: &str,
        temperature: Option<f64>,
    ) -> Result<String, ProviderError> {
        let messages = vec![Message::user(prompt)];
        let options = ChatCallOptions {
            temperature,
            ..Default::default()
        };
        let turn = self.chat(&messages, &options).await?;
        Ok(turn.message.content)
    }
}

#[async_trait::async_trait]
impl EmbedClient for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, input: &str) -> Result<Vec<f64>, ProviderError> {
        let body = json!({"content": {"parts": [{"text": input}]}});
        let value = self.post(&self.action_url("embedContent"), &body).await?;
        value
            .get("embedding")
            .and_then(|e| e.get("values"))
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(Value::as_f64).collect())
            .ok_or_else(|| ProviderError::Decode("embedContent carried no values".to_string()))
    }
}

#[async_trait::async_trait]
impl StreamClient for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        options: &ChatCallOptions,
    ) -> Result<ParcelStream, ProviderError> {
        let body = self.build_body(messages, options);
        let url = format!("{}?alt=sse", self.action_url("streamGenerateContent"));
        let resp = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: excerpt(&text),
            });
        }

        let parcels = resp
            .bytes_stream()
            .scan(LineBuffer::new(), |buf, chunk| {
                let out: Vec<StreamParcel> = match chunk {
                    Ok(bytes) => buf
                        .push(&bytes)
                        .iter()
                        .filter_map(|line| decode_stream_line(line))
                        .collect(),
                    Err(e) => vec![StreamParcel::error(e.to_string())],
                };
                futures::future::ready(Some(out))
            })
            .map(futures::stream::iter)
            .flatten();
        Ok(parcels.boxed())
    }
}

fn decode_stream_line(line: &str) -> Option<StreamParcel> {
    let data = sse_data(line)?;
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(StreamParcel::error(format!("bad SSE payload: {}", e))),
    };
    match first_candidate_text(&value) {
        Ok(text) if text.is_empty() => None,
        Ok(text) => Some(StreamParcel::data(text)),
        Err(_) => None,
    }
}
