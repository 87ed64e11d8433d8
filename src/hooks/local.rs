//! In-process hooks.
//!
//! Local hooks are plain async functions registered by name. They run in
//! the server process and see the same argument merge as remote hooks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use super::HookError;

/// An in-process function identified by name.
#[async_trait]
pub trait LocalHook: Send + Sync {
    fn name(&self) -> &str;

    async fn exec(
        &self,
        start_time: DateTime<Utc>,
        input: &Value,
        args: &HashMap<String, String>,
    ) -> Result<Value, HookError>;
}

/// Name-keyed registry of local hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: DashMap<String, Arc<dyn LocalHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Arc<dyn LocalHook>) {
        self.hooks.insert(hook.name().to_string(), hook);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LocalHook>> {
        self.hooks.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hooks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Built-in hooks
// ---------------------------------------------------------------------------

/// Returns its merged arguments verbatim. Useful for wiring checks.
pub struct EchoHook;

#[async_trait]
impl LocalHook for EchoHook {
    fn name(&self) -> &str {
        "echo"
    }

    async fn exec(
        &self,
        _start_time: DateTime<Utc>,
        input: &Value,
        args: &HashMap<String, String>,
    ) -> Result<Value, HookError> {
        Ok(super::merge_hook_args(input, args))
    }
}

/// Reports wall-clock time elapsed since the chain started.
pub struct ElapsedHook;

#[async_trait]
impl LocalHook for ElapsedHook {
    fn name(&self) -> &str {
        "elapsed"
    }

    async fn exec(
        &self,
        start_time: DateTime<Utc>,
        _input: &Value,
        _args: &HashMap<String, String>,
    ) -> Result<Value, HookError> {
        let elapsed = Utc::now() - start_time;
        Ok(serde_json::json!({
            "elapsed_ms": elapsed.num_milliseconds(),
        }))
    }
}
