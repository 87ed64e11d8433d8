//! Persisted remote hooks and their wire protocols.
//!
//! A remote hook is an HTTP endpoint registered in the store under a
//! unique name. Execution builds the request body per the declared
//! protocol, sends it with the declared method, headers and timeout, and
//! extracts the protocol's result field from the response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::local::HookRegistry;
use super::openapi;
use super::{merge_hook_args, HookDispatcher, HookError, HookOutcome, HookProtocol};
use crate::chain::definition::HookCall;
use crate::providers::excerpt;
use crate::store::{RemoteHookStore, StoreError};
use crate::types::DataType;

/// A remote hook as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteHookDef {
    pub id: String,
    /// Unique across the store; the dispatcher resolves by this.
    pub name: String,
    /// Absolute http/https URL.
    pub endpoint_url: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub protocol_type: HookProtocol,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl RemoteHookDef {
    pub fn new(name: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            endpoint_url: endpoint_url.into(),
            method: default_method(),
            timeout_ms: 5_000,
            headers: HashMap::new(),
            protocol_type: HookProtocol::Openai,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reject unusable definitions before any I/O happens.
    pub fn validate(&self) -> Result<(), HookError> {
        let invalid = |reason: &str| HookError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        let url = reqwest::Url::parse(&self.endpoint_url)
            .map_err(|_| invalid("endpoint URL is not absolute"))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid("endpoint URL must be http or https"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout must be positive"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Protocol request/response shaping (pure)
// ---------------------------------------------------------------------------

/// The function name sent on the wire: the call's tool name when present,
/// else the hook name.
fn wire_name(call: &HookCall) -> &str {
    if call.tool_name.is_empty() {
        &call.name
    } else {
        &call.tool_name
    }
}

/// Build the request body for every protocol except `openapi` (which
/// derives its whole request from the fetched document).
pub fn build_request_body(
    protocol: HookProtocol,
    name: &str,
    merged_args: &Value,
) -> Result<Value, HookError> {
    match protocol {
        HookProtocol::Openai | HookProtocol::LangserveOpenai => {
            let encoded = serde_json::to_string(merged_args)
                .map_err(|e| HookError::Protocol(format!("unencodable arguments: {}", e)))?;
            Ok(json!({"name": name, "arguments": encoded}))
        }
        HookProtocol::Ollama | HookProtocol::OpenaiObject => {
            Ok(json!({"name": name, "arguments": merged_args}))
        }
        HookProtocol::LangserveDirect => Ok(merged_args.clone()),
        HookProtocol::Openapi => Err(HookError::Protocol(
            "openapi requests are built from the operation document".to_string(),
        )),
    }
}

/// Extract the protocol's result from a 2xx response body.
pub fn parse_response_body(protocol: HookProtocol, body: &str) -> Result<Value, HookError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| HookError::Protocol(format!("response is not JSON: {}", e)))?;
    match protocol {
        HookProtocol::Openai
        | HookProtocol::OpenaiObject
        | HookProtocol::LangserveDirect
        | HookProtocol::Openapi => Ok(value),
        HookProtocol::LangserveOpenai => value
            .get("output")
            .cloned()
            .ok_or_else(|| HookError::Protocol("response has no top-level `output`".to_string())),
        HookProtocol::Ollama => value
            .get("message")
            .and_then(|m| m.get("content"))
            .cloned()
            .ok_or_else(|| HookError::Protocol("response has no `message.content`".to_string())),
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Local registry first, persisted remote hooks on miss.
pub struct PersistedHookDispatcher {
    local: Arc<HookRegistry>,
    store: Arc<dyn RemoteHookStore>,
    http: reqwest::Client,
}

impl PersistedHookDispatcher {
    pub fn new(local: Arc<HookRegistry>, store: Arc<dyn RemoteHookStore>) -> Self {
        Self {
            local,
            store,
            http: reqwest::Client::new(),
        }
    }

    async fn exec_remote(
        &self,
        def: &RemoteHookDef,
        call: &HookCall,
        merged_args: &Value,
    ) -> Result<Value, HookError> {
        def.validate()?;
        let timeout = Duration::from_millis(def.timeout_ms);

        if def.protocol_type == HookProtocol::Openapi {
            return openapi::exec_operation(&self.http, def, wire_name(call), merged_args, timeout)
                .await;
        }

        let body = build_request_body(def.protocol_type, wire_name(call), merged_args)?;
        let method = reqwest::Method::from_bytes(def.method.as_bytes()).map_err(|_| {
            HookError::Invalid {
                name: def.name.clone(),
                reason: format!("bad method {:?}", def.method),
            }
        })?;

        let mut request = self
            .http
            .request(method, &def.endpoint_url)
            .header("Content-Type", "application/json")
            .json(&body);
        for (key, value) in &def.headers {
            request = request.header(key, value);
        }

        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| HookError::Timeout(def.timeout_ms))?
            .map_err(|e| HookError::Transport(e.to_string()))?;

        let status = response.status();
        let text = tokio::time::timeout(timeout, response.text())
            .await
            .map_err(|_| HookError::Timeout(def.timeout_ms))?
            .map_err(|e| HookError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(HookError::Http {
                status: status.as_u16(),
                body: excerpt(&text),
            });
        }

        parse_response_body(def.protocol_type, &text)
    }
}

#[async_trait]
impl HookDispatcher for PersistedHookDispatcher {
    async fn exec(
        &self,
        start_time: DateTime<Utc>,
        input: &Value,
        _input_type: DataType,
        transition_eval: &str,
        call: &HookCall,
    ) -> Result<HookOutcome, HookError> {
        if let Some(local) = self.local.get(&call.name) {
            let value = local.exec(start_time, input, &call.args).await?;
            return Ok(HookOutcome {
                value,
                data_type: DataType::Json,
                transition_eval: transition_eval.to_string(),
            });
        }

        let def = match self.store.get_remote_hook_by_name(&call.name).await {
            Ok(def) => def,
            Err(StoreError::NotFound { .. }) => {
                return Err(HookError::NotFound(call.name.clone()))
            }
            Err(e) => return Err(HookError::Store(e)),
        };

        let merged_args = merge_hook_args(input, &call.args);
        let value = self.exec_remote(&def, call, &merged_args).await?;
        Ok(HookOutcome {
            value,
            data_type: DataType::Json,
            transition_eval: transition_eval.to_string(),
        })
    }

    async fn supported_hooks(&self) -> Vec<String> {
        let mut names = self.local.names();
        if let Ok(remote) = self.store.list_remote_hooks(None, 512).await {
            names.extend(remote.into_iter().map(|h| h.name));
        }
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::local::EchoHook;
    use crate::store::memory::MemStore;
    use axum::routing::post;
    use axum::{Json, Router};

    fn call(name: &str, args: &[(&str, &str)]) -> HookCall {
        HookCall {
            name: name.to_string(),
            tool_name: String::new(),
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_build_request_body_openai_encodes_arguments() {
        let merged = json!({"input": "hello", "channel": "#x"});
        let body = build_request_body(HookProtocol::Openai, "notify", &merged).unwrap();
        assert_eq!(body["name"], "notify");
        let arguments: Value =
            serde_json::from_str(body["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(arguments["input"], "hello");
        assert_eq!(arguments["channel"], "#x");
    }

    #[test]
    fn test_build_request_body_object_protocols() {
        let merged = json!({"input": 1});
        let body = build_request_body(HookProtocol::Ollama, "n", &merged).unwrap();
        assert!(body["arguments"].is_object());
        let body = build_request_body(HookProtocol::LangserveDirect, "n", &merged).unwrap();
        assert_eq!(body, merged);
    }

    #[test]
    fn test_parse_response_body_per_protocol() {
        let raw = r#"{"ack": true}"#;
        assert_eq!(
            parse_response_body(HookProtocol::Openai, raw).unwrap()["ack"],
            true
        );
        assert_eq!(
            parse_response_body(
                HookProtocol::LangserveOpenai,
                r#"{"output": {"done": 1}}"#
            )
            .unwrap()["done"],
            1
        );
        assert!(matches!(
            parse_response_body(HookProtocol::LangserveOpenai, raw),
            Err(HookError::Protocol(_))
        ));
        assert_eq!(
            parse_response_body(
                HookProtocol::Ollama,
                r#"{"message": {"content": "done"}}"#
            )
            .unwrap(),
            json!("done")
        );
        assert!(matches!(
            parse_response_body(HookProtocol::Ollama, raw),
            Err(HookError::Protocol(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_definitions() {
        let mut def = RemoteHookDef::new("h", "not a url");
        assert!(matches!(def.validate(), Err(HookError::Invalid { .. })));

        def.endpoint_url = "ftp://h/x".to_string();
        assert!(def.validate().is_err());

        def.endpoint_url = "http://h/x".to_string();
        def.timeout_ms = 0;
        assert!(def.validate().is_err());

        def.timeout_ms = 100;
        assert!(def.validate().is_ok());
    }

    #[tokio::test]
    async fn test_local_hook_takes_precedence() {
        let registry = Arc::new(HookRegistry::new());
        registry.register(Arc::new(EchoHook));
        let dispatcher = PersistedHookDispatcher::new(registry, Arc::new(MemStore::new()));

        let outcome = dispatcher
            .exec(
                Utc::now(),
                &json!("x"),
                DataType::String,
                "pass",
                &call("echo", &[]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.data_type, DataType::Json);
        assert_eq!(outcome.value["input"], "x");
        assert_eq!(outcome.transition_eval, "pass");
    }

    #[tokio::test]
    async fn test_unknown_hook_not_found() {
        let dispatcher = PersistedHookDispatcher::new(
            Arc::new(HookRegistry::new()),
            Arc::new(MemStore::new()),
        );
        let err = dispatcher
            .exec(
                Utc::now(),
                &Value::Null,
                DataType::Any,
                "",
                &call("ghost", &[]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remote_openai_protocol_round_trip() {
        // Serve one endpoint that records nothing and answers {"ack": true}.
        let app = Router::new().route(
            "/notify",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["name"], "notify");
                let args: Value =
                    serde_json::from_str(body["arguments"].as_str().unwrap()).unwrap();
                assert_eq!(args["input"], "hello");
                assert_eq!(args["channel"], "#x");
                Json(json!({"ack": true}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let store = MemStore::new();
        let mut def = RemoteHookDef::new("notify", format!("http://{}/notify", addr));
        def.timeout_ms = 500;
        store.create_remote_hook(def).await.unwrap();

        let dispatcher =
            PersistedHookDispatcher::new(Arc::new(HookRegistry::new()), Arc::new(store));
        let outcome = dispatcher
            .exec(
                Utc::now(),
                &json!("hello"),
                DataType::String,
                "",
                &call("notify", &[("channel", "#x")]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.value, json!({"ack": true}));
        assert_eq!(outcome.data_type, DataType::Json);
    }

    #[tokio::test]
    async fn test_remote_hook_timeout_is_retryable() {
        let app = Router::new().route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Json(json!({}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let store = MemStore::new();
        let mut def = RemoteHookDef::new("slow", format!("http://{}/slow", addr));
        def.timeout_ms = 50;
        store.create_remote_hook(def).await.unwrap();

        let dispatcher =
            PersistedHookDispatcher::new(Arc::new(HookRegistry::new()), Arc::new(store));
        let err = dispatcher
            .exec(
                Utc::now(),
                &Value::Null,
                DataType::Any,
                "",
                &call("slow", &[]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::Timeout(50)));
        assert!(err.is_retryable());
    }
}
