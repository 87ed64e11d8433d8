//! Ollama adapter.
//!
//! Dialect: `/api/chat`, `/api/generate`, `/api/embeddings`, `/api/tags`,
//! `/api/pull`. Streaming is newline-delimited JSON rather than SSE. The
//! reconciler uses [`OllamaClient::list_models`] as the combined health
//! probe and pulled-model listing, and [`OllamaClient::pull`] to converge
//! missing models.

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::wire::LineBuffer;
use super::{excerpt, ChatCallOptions, ChatClient, ChatTurn, EmbedClient, PromptClient,
    ProviderError, StreamClient};
use crate::types::chat::Message;
use crate::types::openai::Usage;
use crate::types::streaming::{ParcelStream, StreamParcel};

#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: i64,
    #[serde(default)]
    eval_count: i64,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingsResponse {
    #[serde(default)]
    embedding: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaTag {
    name: String,
}

/// One line of the `/api/pull` progress stream.
#[derive(Debug, Clone, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub completed: Option<i64>,
    #[serde(default)]
    pub total: Option<i64>,
}

impl OllamaClient {
    pub fn new(http: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, ProviderError> {
        let resp = self.http.post(self.url(path)).json(&body).send().await?;
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

    /// List the models pulled on this backend. Doubles as the health probe.
    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let resp = self.http.get(self.url("/api/tags")).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: excerpt(&text),
            });
        }
        let tags: OllamaTagsResponse =
            serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Pull a model, invoking `on_progress` for each NDJSON progress line.
    pub async fn pull(
        &self,
        name: &str,
        mut on_progress: impl FnMut(PullProgress) + Send,
    ) -> Result<(), ProviderError> {
        let resp = self
            .http
            .post(self.url("/api/pull"))
            .json(&json!({"name": name, "stream": true}))
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

        let mut body = resp.bytes_stream();
        let mut buf = LineBuffer::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ProviderError::Transport(e.to_string()))?;
            for line in buf.push(&chunk) {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<PullProgress>(&line) {
                    Ok(progress) => on_progress(progress),
                    Err(e) => log::debug!("skipping unparseable pull line: {}", e),
                }
            }
        }
        Ok(())
    }
}

fn wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect()
}

#[async_trait::async_trait]
impl ChatClient for OllamaClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatCallOptions,
    ) -> Result<ChatTurn, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "messages": wire_messages(messages),
            "stream": false,
        });
        if let Some(t) = options.temperature {
            body["options"] = json!({"temperature": t});
        }
        let value = self.post_json("/api/chat", body).await?;
        let parsed: OllamaChatResponse =
            serde_json::from_value(value).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let role = if parsed.message.role.is_empty() {
            "assistant".to_string()
        } else {
            parsed.message.role
        };
        Ok(ChatTurn {
            message: Message::new(role, parsed.message.content),
            usage: Some(Usage {
                prompt_tokens: parsed.prompt_eval_count,
                completion_tokens: parsed.eval_count,
                total_tokens: parsed.prompt_eval_count + parsed.eval_count,
            }),
        })
    }
}

#[async_trait::async_trait]
impl PromptClient for OllamaClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn prompt(
        &self,
        prompt: &str,
        temperature: Option<f64>,
    ) -> Result<String, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(t) = temperature {
            body["options"] = json!({"temperature": t});
        }
        let value = self.post_json("/api/generate", body).await?;
        let parsed: OllamaGenerateResponse =
            serde_json::from_value(value).map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(parsed.response)
    }
}

#[async_trait::async_trait]
impl EmbedClient for OllamaClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, input: &str) -> Result<Vec<f64>, ProviderError> {
        let value = self
            .post_json(
                "/api/embeddings",
                json!({"model": self.model, "prompt": input}),
            )
            .await?;
        let parsed: OllamaEmbeddingsResponse =
            serde_json::from_value(value).map_err(|e| ProviderError::Decode(e.to_string()))?;
        if parsed.embedding.is_empty() {
            return Err(ProviderError::Decode(
                "embeddings response carried no vector".to_string(),
            ));
        }
        Ok(parsed.embedding)
    }
}

#[async_trait::async_trait]
impl StreamClient for OllamaClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        options: &ChatCallOptions,
    ) -> Result<ParcelStream, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "messages": wire_messages(messages),
            "stream": true,
        });
        if let Some(t) = options.temperature {
            body["options"] = json!({"temperature": t});
        }
        let resp = self
            .http
            .post(self.url("/api/chat"))
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
                        .into_iter()
                        .filter(|l| !l.is_empty())
                        .filter_map(|line| decode_stream_line(&line))
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

/// Decode one NDJSON stream line into a parcel; terminal lines with empty
/// content produce nothing.
fn decode_stream_line(line: &str) -> Option<StreamParcel> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Some(StreamParcel::error(format!("bad stream line: {}", e))),
    };
    if let Some(err) = value.get("error").and_then(Value::as_str) {
        return Some(StreamParcel::error(err.to_string()));
    }
    let content = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if content.is_empty() {
        None
    } else {
        Some(StreamParcel::data(content))
    }
}
