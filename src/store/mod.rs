//! Narrow interfaces over the relational store.
//!
//! The runtime only consumes declarative state: backends, model catalog
//! entries, pools, remote hooks and chain definitions. Every entity carries
//! `id`, `created_at`, `updated_at`; listings paginate by a
//! `(created_at DESC, id DESC)` cursor. The engine behind these traits is
//! an external collaborator; [`memory::MemStore`] keeps the runtime
//! self-contained for the server binary and tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::chain::ChainDefinition;
use crate::hooks::remote::RemoteHookDef;
use crate::providers::ProviderType;

/// Namespace for deterministic model catalog ids.
pub static TENANT_NAMESPACE: Lazy<Uuid> =
    Lazy::new(|| Uuid::new_v5(&Uuid::NAMESPACE_OID, b"taskchain.models"));

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id:?} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} {id:?} already exists")]
    AlreadyExists { entity: &'static str, id: String },
    #[error("store operation failed: {0}")]
    Operation(String),
}

/// Pagination cursor: the sort key of the last row already seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A concrete HTTP endpoint of a given vendor type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    pub name: String,
    pub base_url: String,
    #[serde(rename = "type")]
    pub backend_type: ProviderType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Backend {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, backend_type: ProviderType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            base_url: base_url.into(),
            backend_type,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A declared model with its capability flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Deterministic: UUIDv5 of the tenant namespace and the model name.
    pub id: Uuid,
    pub name: String,
    pub context_length: i64,
    pub can_chat: bool,
    pub can_embed: bool,
    pub can_prompt: bool,
    pub can_stream: bool,
    #[serde(default)]
    pub can_think: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelEntry {
    pub fn new(name: impl Into<String>, context_length: i64) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: model_id(&name),
            name,
            context_length,
            can_chat: true,
            can_embed: false,
            can_prompt: true,
            can_stream: true,
            can_think: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Deterministic catalog id for a model name.
pub fn model_id(name: &str) -> Uuid {
    Uuid::new_v5(&TENANT_NAMESPACE, name.as_bytes())
}

/// A routing-affinity set linking backends to models. An entity may belong
/// to several pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub name: String,
    pub backend_ids: Vec<String>,
    pub model_names: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            backend_ids: Vec::new(),
            model_names: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A stored chain definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChain {
    pub id: String,
    pub definition: ChainDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredChain {
    pub fn new(definition: ChainDefinition) -> Self {
        let now = Utc::now();
        let id = if definition.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            definition.id.clone()
        };
        Self {
            id,
            definition,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// CRUD interfaces
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BackendStore: Send + Sync {
    async fn create_backend(&self, backend: Backend) -> Result<(), StoreError>;
    async fn get_backend(&self, id: &str) -> Result<Backend, StoreError>;
    async fn update_backend(&self, backend: Backend) -> Result<(), StoreError>;
    async fn delete_backend(&self, id: &str) -> Result<(), StoreError>;
    async fn list_backends(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Backend>, StoreError>;
}

#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn create_model(&self, model: ModelEntry) -> Result<(), StoreError>;
    async fn get_model_by_name(&self, name: &str) -> Result<ModelEntry, StoreError>;
    async fn update_model(&self, model: ModelEntry) -> Result<(), StoreError>;
    async fn delete_model(&self, name: &str) -> Result<(), StoreError>;
    async fn list_models(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<ModelEntry>, StoreError>;
}

#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn create_pool(&self, pool: Pool) -> Result<(), StoreError>;
    async fn get_pool(&self, id: &str) -> Result<Pool, StoreError>;
    async fn update_pool(&self, pool: Pool) -> Result<(), StoreError>;
    async fn delete_pool(&self, id: &str) -> Result<(), StoreError>;
    async fn list_pools(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Pool>, StoreError>;
}

#[async_trait]
pub trait RemoteHookStore: Send + Sync {
    async fn create_remote_hook(&self, hook: RemoteHookDef) -> Result<(), StoreError>;
    /// Lookup used by the hook dispatcher on a local-registry miss.
    async fn get_remote_hook_by_name(&self, name: &str) -> Result<RemoteHookDef, StoreError>;
    async fn update_remote_hook(&self, hook: RemoteHookDef) -> Result<(), StoreError>;
    async fn delete_remote_hook(&self, id: &str) -> Result<(), StoreError>;
    async fn list_remote_hooks(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<RemoteHookDef>, StoreError>;
}

#[async_trait]
pub trait ChainStore: Send + Sync {
    async fn create_chain(&self, chain: StoredChain) -> Result<(), StoreError>;
    async fn get_chain(&self, id: &str) -> Result<StoredChain, StoreError>;
    async fn update_chain(&self, chain: StoredChain) -> Result<(), StoreError>;
    async fn delete_chain(&self, id: &str) -> Result<(), StoreError>;
    async fn list_chains(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<StoredChain>, StoreError>;
}

/// The full declarative surface the runtime consumes.
pub trait Store:
    BackendStore + ModelStore + PoolStore + RemoteHookStore + ChainStore
{
}

impl<T> Store for T where
    T: BackendStore + ModelStore + PoolStore + RemoteHookStore + ChainStore
{
}
