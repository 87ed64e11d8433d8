//! OpenAI-compatible adapter, shared by the `openai` and `vllm` provider
//! types.
//!
//! Dialect: `/chat/completions`, `/embeddings`, `/models`; streaming is SSE
//! with `data: ...` framing terminated by `data: [DONE]`. An API key is
//! taken from `OPENAI_API_KEY` when present; vLLM deployments usually run
//! without one.

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::wire::{sse_data, LineBuffer, SSE_DONE};
use super::{excerpt, ChatCallOptions, ChatClient, ChatTurn, EmbedClient, PromptClient,
    ProviderError, StreamClient};
use crate::types::chat::{FunctionCall, Message, ToolCall};
use crate::types::openai::Usage;
use crate::types::streaming::{ParcelStream, StreamParcel};

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default)]
    call_type: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddings {
    #[serde(default)]
    data: Vec<WireEmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingRow {
    embedding: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct WireModels {
    #[serde(default)]
    data: Vec<WireModelRow>,
}

#[derive(Debug, Deserialize)]
struct WireModelRow {
    id: String,
}

impl OpenAiCompatClient {
    pub fn new(http: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    fn chat_body(&self, messages: &[Message], options: &ChatCallOptions, stream: bool) -> Value {
        let wire: Vec<Value> = messages
            .iter()
            .map(|m| {
                let mut msg = json!({"role": m.role, "content": m.content});
                if let Some(ref id) = m.tool_call_id {
                    msg["tool_call_id"] = json!(id);
                }
                if !m.call_tools.is_empty() {
                    msg["tool_calls"] = json!(m
                        .call_tools
                        .iter()
                        .map(|t| json!({
                            "id": t.id,
                            "type": t.call_type,
                            "function": {"name": t.function.name, "arguments": t.function.arguments},
                        }))
                        .collect::<Vec<_>>());
                }
                msg
            })
            .collect();
        let mut body = json!({"model": self.model, "messages": wire});
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = options.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if let Some(ref tools) = options.tools {
            body["tools"] = json!(tools);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    /// List served model ids. Doubles as the health probe.
    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let mut builder = self.http.get(format!("{}/models", self.base_url));
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: excerpt(&text),
            });
        }
        let models: WireModels =
            serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait::async_trait]
impl ChatClient for OpenAiCompatClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatCallOptions,
    ) -> Result<ChatTurn, ProviderError> {
        let resp = self
            .request("/chat/completions")
            .json(&self.chat_body(messages, options, false))
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
        let parsed: WireResponse =
            serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Decode("response carried no choices".to_string()))?;

        let mut message = Message::new(
            if choice.message.role.is_empty() {
                "assistant".to_string()
            } else {
                choice.message.role
            },
            choice.message.content.unwrap_or_default(),
        );
        if let Some(calls) = choice.message.tool_calls {
            message.call_tools = calls
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    call_type: if c.call_type.is_empty() {
                        "function".to_string()
                    } else {
                        c.call_type
                    },
                    function: FunctionCall {
                        name: c.function.name,
                        arguments: c.function.arguments,
                    },
                })
                .collect();
        }
        Ok(ChatTurn {
            message,
            usage: parsed.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.prompt_tokens + u.completion_tokens,
            }),
        })
    }
}

#[async_trait::async_trait]
impl PromptClient for OpenAiCompatClient {
    fn model(&self) -> &str {
        &self.model
    }

    /// Plain prompting rides the chat endpoint as a single user message.
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
impl EmbedClient for OpenAiCompatClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, input: &str) -> Result<Vec<f64>, ProviderError> {
        let resp = self
            .request("/embeddings")
            .json(&json!({"model": self.model, "input": input}))
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
        let parsed: WireEmbeddings =
            serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| ProviderError::Decode("embeddings response carried no rows".to_string()))
    }
}

#[async_trait::async_trait]
impl StreamClient for OpenAiCompatClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        options: &ChatCallOptions,
    ) -> Result<ParcelStream, ProviderError> {
        let resp = self
            .request("/chat/completions")
            .json(&self.chat_body(messages, options, true))
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
                        .filter_map(|line| decode_sse_line(line))
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

/// Decode one SSE line into a parcel. `[DONE]`, empty deltas and non-data
/// lines produce nothing.
fn decode_sse_line(line: &str) -> Option<StreamParcel> {
    let data = sse_data(line)?;
    if data == SSE_DONE {
        return None;
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(StreamParcel::error(format!("bad SSE payload: {}", e))),
    };
    let delta = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if delta.is_empty() {
        None
    } else {
        Some(StreamParcel::data(delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_sse_line_delta() {
        let parcel =
            decode_sse_line(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#).unwrap();
        assert_eq!(parcel, StreamParcel::data("hi"));
    }

    #[test]
    fn test_decode_sse_line_done_and_noise() {
        assert!(decode_sse_line("data: [DONE]").is_none());
        assert!(decode_sse_line(": ping").is_none());
        assert!(decode_sse_line("").is_none());
    }

    #[test]
    fn test_chat_body_merges_options() {
        let client = OpenAiCompatClient::new(reqwest::Client::new(), "http://h/v1", "m");
        let body = client.chat_body(
            &[Message::user("q")],
            &ChatCallOptions {
                temperature: Some(0.2),
                max_tokens: Some(64),
                tools: None,
            },
            true,
        );
        assert_eq!(body["model"], "m");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["content"], "q");
    }

    #[test]
    fn test_chat_body_includes_tool_calls() {
        let client = OpenAiCompatClient::new(reqwest::Client::new(), "http://h/v1", "m");
        let mut msg = Message::assistant("");
        msg.call_tools.push(ToolCall {
            id: "call_9".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: "f".to_string(),
                arguments: "{}".to_string(),
            },
        });
        let body = client.chat_body(&[msg], &ChatCallOptions::default(), false);
        assert_eq!(body["messages"][0]["tool_calls"][0]["id"], "call_9");
    }
}
