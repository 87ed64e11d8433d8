//! In-memory projection of backend runtime state.
//!
//! One entry per declared backend: the backend record, the models actually
//! pulled on it, and the last probe outcome. The reconciler is the sole
//! writer; resolvers read concurrently. Writes happen under a short
//! `parking_lot::RwLock` critical section.

pub mod loops;
pub mod reconciler;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::providers::Capabilities;
use crate::store::Backend;

/// A pulled model with the capability flags the catalog declares for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapsule {
    pub name: String,
    pub context_length: i64,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    /// Never probed yet.
    Unknown,
    Healthy,
    Unreachable,
}

/// Everything the runtime knows about one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRuntime {
    pub backend: Backend,
    pub pulled_models: Vec<ModelCapsule>,
    pub status: BackendStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BackendRuntime {
    /// Compact form published on the bus when an entry changes.
    pub fn summary(&self) -> Value {
        let mut names: Vec<&str> = self
            .pulled_models
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        names.sort();
        json!({
            "status": self.status,
            "models": names,
            "error": self.last_error,
        })
    }
}

/// The process-wide `{backend_id → BackendRuntime}` map.
#[derive(Default)]
pub struct RuntimeState {
    entries: RwLock<HashMap<String, BackendRuntime>>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, backend_id: &str) -> Option<BackendRuntime> {
        self.entries.read().get(backend_id).cloned()
    }

    /// All entries, in no particular order.
    pub fn snapshot(&self) -> Vec<BackendRuntime> {
        self.entries.read().values().cloned().collect()
    }

    /// Replace an entry, returning what it replaced.
    pub fn upsert(&self, entry: BackendRuntime) -> Option<BackendRuntime> {
        self.entries
            .write()
            .insert(entry.backend.id.clone(), entry)
    }

    /// Drop entries whose backend is no longer declared.
    pub fn retain_backends(&self, declared_ids: &[String]) -> Vec<BackendRuntime> {
        let mut removed = Vec::new();
        self.entries.write().retain(|id, entry| {
            if declared_ids.iter().any(|d| d == id) {
                true
            } else {
                removed.push(entry.clone());
                false
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderType;

    fn entry(id: &str) -> BackendRuntime {
        let mut backend = Backend::new(id, "http://h", ProviderType::Ollama);
        backend.id = id.to_string();
        BackendRuntime {
            backend,
            pulled_models: Vec::new(),
            status: BackendStatus::Unknown,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let state = RuntimeState::new();
        assert!(state.upsert(entry("b1")).is_none());
        let mut updated = entry("b1");
        updated.status = BackendStatus::Healthy;
        let old = state.upsert(updated).unwrap();
        assert_eq!(old.status, BackendStatus::Unknown);
        assert_eq!(state.get("b1").unwrap().status, BackendStatus::Healthy);
    }

    #[test]
    fn test_retain_backends_removes_undeclared() {
        let state = RuntimeState::new();
        state.upsert(entry("b1"));
        state.upsert(entry("b2"));
        let removed = state.retain_backends(&["b1".to_string()]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].backend.id, "b2");
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_summary_sorts_model_names() {
        let mut e = entry("b1");
        for name in ["zeta", "alpha"] {
            e.pulled_models.push(ModelCapsule {
                name: name.to_string(),
                context_length: 4096,
                capabilities: Capabilities::default(),
            });
        }
        let summary = e.summary();
        assert_eq!(summary["models"][0], "alpha");
        assert_eq!(summary["models"][1], "zeta");
    }
}
