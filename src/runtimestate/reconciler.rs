//! Reconciliation of declared state against live backends.
//!
//! Two idempotent cycles: the backend cycle probes every declared backend
//! and refreshes the runtime projection, publishing changes on the bus;
//! the download cycle diffs model assignments against what each Ollama
//! backend has actually pulled and converges the difference. One
//! unreachable backend never stalls the others.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;

use super::{BackendRuntime, BackendStatus, ModelCapsule, RuntimeState};
use crate::bus::{EventBus, TOPIC_BACKEND_STATE, TOPIC_MODEL_DOWNLOAD};
use crate::providers::{gemini::GeminiClient, ollama::OllamaClient, openai::OpenAiCompatClient,
    Capabilities, ProviderError, ProviderType};
use crate::store::{Backend, BackendStore, ModelEntry, ModelStore, PoolStore, Store};

/// Page size used when walking store listings.
const LIST_PAGE: usize = 512;

pub struct Reconciler {
    store: Arc<dyn Store>,
    state: Arc<RuntimeState>,
    bus: Arc<dyn EventBus>,
    http: reqwest::Client,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, state: Arc<RuntimeState>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            store,
            state,
            bus,
            http: reqwest::Client::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Backend cycle
    // -----------------------------------------------------------------------

    /// Probe every declared backend and converge the projection.
    pub async fn backend_cycle(&self) -> Result<(), anyhow::Error> {
        let backends = self.store.list_backends(None, LIST_PAGE).await?;
        let declared: Vec<ModelEntry> = self.store.list_models(None, LIST_PAGE).await?;

        let declared_ids: Vec<String> = backends.iter().map(|b| b.id.clone()).collect();
        for removed in self.state.retain_backends(&declared_ids) {
            self.publish_change(&removed.backend, Some(removed.summary()), None)
                .await;
        }

        let probes = backends.into_iter().map(|backend| {
            let declared = declared.clone();
            async move {
                let result = self.probe(&backend).await;
                (backend, result, declared)
            }
        });

        for (backend, result, declared) in join_all(probes).await {
            let entry = match result {
                Ok(model_names) => BackendRuntime {
                    pulled_models: model_names
                        .into_iter()
                        .map(|name| capsule_for(&name, &declared))
                        .collect(),
                    status: BackendStatus::Healthy,
                    last_error: None,
                    updated_at: Utc::now(),
                    backend: backend.clone(),
                },
                Err(e) => {
                    log::warn!("backend {} probe failed: {}", backend.id, e);
                    BackendRuntime {
                        pulled_models: Vec::new(),
                        status: BackendStatus::Unreachable,
                        last_error: Some(e.to_string()),
                        updated_at: Utc::now(),
                        backend: backend.clone(),
                    }
                }
            };

            let new_summary = entry.summary();
            let old = self.state.upsert(entry);
            let old_summary = old.map(|o| o.summary());
            if old_summary.as_ref() != Some(&new_summary) {
                self.publish_change(&backend, old_summary, Some(new_summary))
                    .await;
            }
        }
        Ok(())
    }

    /// Health probe doubling as the pulled-model listing.
    async fn probe(&self, backend: &Backend) -> Result<Vec<String>, ProviderError> {
        match backend.backend_type {
            ProviderType::Ollama => {
                OllamaClient::new(self.http.clone(), &backend.base_url, "")
                    .list_models()
                    .await
            }
            ProviderType::Openai | ProviderType::Vllm => {
                OpenAiCompatClient::new(self.http.clone(), &backend.base_url, "")
                    .list_models()
                    .await
            }
            ProviderType::Gemini => {
                GeminiClient::new(self.http.clone(), &backend.base_url, "")
                    .list_models()
                    .await
            }
        }
    }

    async fn publish_change(
        &self,
        backend: &Backend,
        old: Option<serde_json::Value>,
        new: Option<serde_json::Value>,
    ) {
        let payload = json!({
            "backend": {"id": backend.id, "name": backend.name, "type": backend.backend_type},
            "old": old,
            "new": new,
        });
        if let Err(e) = self.bus.publish(TOPIC_BACKEND_STATE, payload).await {
            log::warn!("publishing backend change failed: {}", e);
        }
    }

    // -----------------------------------------------------------------------
    // Download cycle
    // -----------------------------------------------------------------------

    /// Queue downloads for assigned models missing from their backends.
    /// Pulls run one at a time per backend; backends proceed independently.
    pub async fn download_cycle(&self) -> Result<(), anyhow::Error> {
        let entries = self.state.snapshot();
        let work = entries.into_iter().filter(|entry| {
            entry.backend.backend_type == ProviderType::Ollama
                && entry.status == BackendStatus::Healthy
        });

        let downloads = work.map(|entry| async move {
            let assigned = match self.assigned_models(&entry.backend.id).await {
                Ok(assigned) => assigned,
                Err(e) => {
                    log::warn!(
                        "listing assignments for backend {} failed: {}",
                        entry.backend.id,
                        e
                    );
                    return;
                }
            };
            let pulled: Vec<&str> = entry
                .pulled_models
                .iter()
                .map(|m| m.name.as_str())
                .collect();

            for model in assigned {
                if pulled.contains(&model.as_str()) {
                    continue;
                }
                self.pull_model(&entry.backend, &model).await;
            }
        });
        join_all(downloads).await;
        Ok(())
    }

    /// Models assigned to a backend: the union over pools containing it,
    /// or every declared model when no pool mentions it.
    async fn assigned_models(&self, backend_id: &str) -> Result<Vec<String>, anyhow::Error> {
        let pools = self.store.list_pools(None, LIST_PAGE).await?;
        let mut assigned: Vec<String> = Vec::new();
        let mut pooled = false;
        for pool in &pools {
            if pool.backend_ids.iter().any(|id| id == backend_id) {
                pooled = true;
                for name in &pool.model_names {
                    if !assigned.contains(name) {
                        assigned.push(name.clone());
                    }
                }
            }
        }
        if !pooled {
            assigned = self
                .store
                .list_models(None, LIST_PAGE)
                .await?
                .into_iter()
                .map(|m| m.name)
                .collect();
        }
        Ok(assigned)
    }

    async fn pull_model(&self, backend: &Backend, model: &str) {
        log::info!("pulling {} onto backend {}", model, backend.id);
        let client = OllamaClient::new(self.http.clone(), &backend.base_url, model);
        let bus = Arc::clone(&self.bus);
        let backend_id = backend.id.clone();
        let model_name = model.to_string();

        // Progress lines are forwarded through a channel so the blocking
        // pull callback stays synchronous.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let forward = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                let progress: crate::providers::ollama::PullProgress = progress;
                let _ = bus
                    .publish(
                        TOPIC_MODEL_DOWNLOAD,
                        json!({
                            "backend_id": backend_id,
                            "model": model_name,
                            "status": progress.status,
                            "completed": progress.completed,
                            "total": progress.total,
                        }),
                    )
                    .await;
            }
        });

        let result = client
            .pull(model, move |progress| {
                let _ = tx.send(progress);
            })
            .await;
        let _ = forward.await;

        if let Err(e) = result {
            log::warn!("pull of {} on backend {} failed: {}", model, backend.id, e);
        }
    }
}

/// Capability flags for a pulled model: the declared catalog entry when it
/// exists, a conservative guess otherwise.
fn capsule_for(name: &str, declared: &[ModelEntry]) -> ModelCapsule {
    if let Some(entry) = declared.iter().find(|m| m.name == name) {
        return ModelCapsule {
            name: entry.name.clone(),
            context_length: entry.context_length,
            capabilities: Capabilities {
                can_chat: entry.can_chat,
                can_embed: entry.can_embed,
                can_prompt: entry.can_prompt,
                can_stream: entry.can_stream,
                can_think: entry.can_think,
            },
        };
    }
    let looks_like_embedder = name.contains("embed");
    ModelCapsule {
        name: name.to_string(),
        context_length: 4096,
        capabilities: Capabilities {
            can_chat: !looks_like_embedder,
            can_embed: looks_like_embedder,
            can_prompt: !looks_like_embedder,
            can_stream: !looks_like_embedder,
            can_think: false,
        },
    }
}
