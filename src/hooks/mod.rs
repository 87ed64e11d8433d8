//! Hook dispatch: side-effecting external calls invoked by tasks.
//!
//! Two layers compose: an in-process registry of local hooks, and a
//! store-backed layer that resolves remote hooks by name and executes them
//! over HTTP per their declared wire protocol.

pub mod local;
pub mod openapi;
pub mod remote;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::chain::definition::HookCall;
use crate::store::StoreError;
use crate::types::DataType;

pub use local::{HookRegistry, LocalHook};
pub use remote::RemoteHookDef;

/// Wire protocol of a remote hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookProtocol {
    #[serde(rename = "openai")]
    Openai,
    #[serde(rename = "langserve-openai")]
    LangserveOpenai,
    #[serde(rename = "langserve-direct")]
    LangserveDirect,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "openai-object")]
    OpenaiObject,
    #[serde(rename = "openapi")]
    Openapi,
}

impl HookProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookProtocol::Openai => "openai",
            HookProtocol::LangserveOpenai => "langserve-openai",
            HookProtocol::LangserveDirect => "langserve-direct",
            HookProtocol::Ollama => "ollama",
            HookProtocol::OpenaiObject => "openai-object",
            HookProtocol::Openapi => "openapi",
        }
    }
}

#[derive(Debug, Error)]
pub enum HookError {
    /// The hook definition itself is unusable (bad URL, non-positive
    /// timeout).
    #[error("invalid hook {name:?}: {reason}")]
    Invalid { name: String, reason: String },

    /// No local or persisted hook answers to the name.
    #[error("hook {0:?} not found")]
    NotFound(String),

    /// The response was well-formed HTTP but missing the field the
    /// protocol promises.
    #[error("hook protocol error: {0}")]
    Protocol(String),

    /// Non-2xx from the remote endpoint, body excerpt included.
    #[error("hook endpoint returned {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never completed.
    #[error("hook transport error: {0}")]
    Transport(String),

    /// The declared timeout elapsed.
    #[error("hook timed out after {0}ms")]
    Timeout(u64),

    /// The hook's own logic failed.
    #[error("hook execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HookError {
    /// Everything except a broken definition is worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HookError::Invalid { .. } | HookError::NotFound(_))
    }
}

/// What a hook produced: a JSON value by default; the task's output
/// template may later turn it into a string.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub value: Value,
    pub data_type: DataType,
    pub transition_eval: String,
}

/// The surface the task executor calls.
#[async_trait]
pub trait HookDispatcher: Send + Sync {
    async fn exec(
        &self,
        start_time: DateTime<Utc>,
        input: &Value,
        input_type: DataType,
        transition_eval: &str,
        call: &HookCall,
    ) -> Result<HookOutcome, HookError>;

    /// Names this dispatcher can serve, local and persisted.
    async fn supported_hooks(&self) -> Vec<String>;
}

/// Build the argument object sent to a hook: the task input under the
/// reserved key `input`, overlaid with the call's static args.
pub fn merge_hook_args(input: &Value, args: &HashMap<String, String>) -> Value {
    let mut merged = Map::new();
    merged.insert("input".to_string(), input.clone());
    let mut keys: Vec<&String> = args.keys().collect();
    keys.sort();
    for key in keys {
        merged.insert(key.clone(), Value::String(args[key].clone()));
    }
    Value::Object(merged)
}
