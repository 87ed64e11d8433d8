//! In-memory store implementation.
//!
//! Backs the server binary when no relational engine is configured, and
//! every test that needs declarative state. Read-mostly maps behind
//! `parking_lot::RwLock`; listings sort by `(created_at DESC, id DESC)`
//! and honour the cursor contract.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{
    Backend, BackendStore, ChainStore, Cursor, ModelEntry, ModelStore, Pool, PoolStore,
    RemoteHookStore, StoreError, StoredChain,
};
use crate::hooks::remote::RemoteHookDef;

/// Sort key shared by all listings.
fn page<T: Clone>(
    rows: &HashMap<String, T>,
    key: impl Fn(&T) -> (DateTime<Utc>, String),
    cursor: Option<&Cursor>,
    limit: usize,
) -> Vec<T> {
    let mut all: Vec<&T> = rows.values().collect();
    all.sort_by(|a, b| {
        let (at, aid) = key(a);
        let (bt, bid) = key(b);
        bt.cmp(&at).then(bid.cmp(&aid))
    });
    all.into_iter()
        .filter(|row| match cursor {
            None => true,
            Some(c) => {
                let (t, id) = key(row);
                t < c.created_at || (t == c.created_at && id < c.id)
            }
        })
        .take(limit)
        .cloned()
        .collect()
}

/// In-memory implementation of every store interface.
#[derive(Default)]
pub struct MemStore {
    backends: RwLock<HashMap<String, Backend>>,
    models: RwLock<HashMap<String, ModelEntry>>,
    pools: RwLock<HashMap<String, Pool>>,
    hooks: RwLock<HashMap<String, RemoteHookDef>>,
    chains: RwLock<HashMap<String, StoredChain>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackendStore for MemStore {
    async fn create_backend(&self, backend: Backend) -> Result<(), StoreError> {
        let mut rows = self.backends.write();
        if rows.contains_key(&backend.id) {
            return Err(StoreError::AlreadyExists {
                entity: "backend",
                id: backend.id,
            });
        }
        rows.insert(backend.id.clone(), backend);
        Ok(())
    }

    async fn get_backend(&self, id: &str) -> Result<Backend, StoreError> {
        self.backends
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "backend",
                id: id.to_string(),
            })
    }

    async fn update_backend(&self, mut backend: Backend) -> Result<(), StoreError> {
        let mut rows = self.backends.write();
        if !rows.contains_key(&backend.id) {
            return Err(StoreError::NotFound {
                entity: "backend",
                id: backend.id,
            });
        }
        backend.updated_at = Utc::now();
        rows.insert(backend.id.clone(), backend);
        Ok(())
    }

    async fn delete_backend(&self, id: &str) -> Result<(), StoreError> {
        self.backends
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                entity: "backend",
                id: id.to_string(),
            })
    }

    async fn list_backends(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Backend>, StoreError> {
        Ok(page(
            &self.backends.read(),
            |b| (b.created_at, b.id.clone()),
            cursor.as_ref(),
            limit,
        ))
    }
}

#[async_trait]
impl ModelStore for MemStore {
    async fn create_model(&self, model: ModelEntry) -> Result<(), StoreError> {
        let mut rows = self.models.write();
        if rows.contains_key(&model.name) {
            return Err(StoreError::AlreadyExists {
                entity: "model",
                id: model.name,
            });
        }
        rows.insert(model.name.clone(), model);
        Ok(())
    }

    async fn get_model_by_name(&self, name: &str) -> Result<ModelEntry, StoreError> {
        self.models
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "model",
                id: name.to_string(),
            })
    }

    async fn update_model(&self, mut model: ModelEntry) -> Result<(), StoreError> {
        let mut rows = self.models.write();
        if !rows.contains_key(&model.name) {
            return Err(StoreError::NotFound {
                entity: "model",
                id: model.name,
            });
        }
        model.updated_at = Utc::now();
        rows.insert(model.name.clone(), model);
        Ok(())
    }

    async fn delete_model(&self, name: &str) -> Result<(), StoreError> {
        self.models
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                entity: "model",
                id: name.to_string(),
            })
    }

    async fn list_models(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<ModelEntry>, StoreError> {
        Ok(page(
            &self.models.read(),
            |m| (m.created_at, m.id.to_string()),
            cursor.as_ref(),
            limit,
        ))
    }
}

#[async_trait]
impl PoolStore for MemStore {
    async fn create_pool(&self, pool: Pool) -> Result<(), StoreError> {
        let mut rows = self.pools.write();
        if rows.contains_key(&pool.id) {
            return Err(StoreError::AlreadyExists {
                entity: "pool",
                id: pool.id,
            });
        }
        rows.insert(pool.id.clone(), pool);
        Ok(())
    }

    async fn get_pool(&self, id: &str) -> Result<Pool, StoreError> {
        self.pools
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "pool",
                id: id.to_string(),
            })
    }

    async fn update_pool(&self, mut pool: Pool) -> Result<(), StoreError> {
        let mut rows = self.pools.write();
        if !rows.contains_key(&pool.id) {
            return Err(StoreError::NotFound {
                entity: "pool",
                id: pool.id,
            });
        }
        pool.updated_at = Utc::now();
        rows.insert(pool.id.clone(), pool);
        Ok(())
    }

    async fn delete_pool(&self, id: &str) -> Result<(), StoreError> {
        self.pools
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                entity: "pool",
                id: id.to_string(),
            })
    }

    async fn list_pools(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Pool>, StoreError> {
        Ok(page(
            &self.pools.read(),
            |p| (p.created_at, p.id.clone()),
            cursor.as_ref(),
            limit,
        ))
    }
}

#[async_trait]
impl RemoteHookStore for MemStore {
    async fn create_remote_hook(&self, hook: RemoteHookDef) -> Result<(), StoreError> {
        let mut rows = self.hooks.write();
        if rows.contains_key(&hook.id) {
            return Err(StoreError::AlreadyExists {
                entity: "remote hook",
                id: hook.id,
            });
        }
        // Hook names are unique: the dispatcher looks up by name.
        if rows.values().any(|h| h.name == hook.name) {
            return Err(StoreError::AlreadyExists {
                entity: "remote hook",
                id: hook.name,
            });
        }
        rows.insert(hook.id.clone(), hook);
        Ok(())
    }

    async fn get_remote_hook_by_name(&self, name: &str) -> Result<RemoteHookDef, StoreError> {
        self.hooks
            .read()
            .values()
            .find(|h| h.name == name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "remote hook",
                id: name.to_string(),
            })
    }

    async fn update_remote_hook(&self, mut hook: RemoteHookDef) -> Result<(), StoreError> {
        let mut rows = self.hooks.write();
        if !rows.contains_key(&hook.id) {
            return Err(StoreError::NotFound {
                entity: "remote hook",
                id: hook.id,
            });
        }
        hook.updated_at = Utc::now();
        rows.insert(hook.id.clone(), hook);
        Ok(())
    }

    async fn delete_remote_hook(&self, id: &str) -> Result<(), StoreError> {
        self.hooks
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                entity: "remote hook",
                id: id.to_string(),
            })
    }

    async fn list_remote_hooks(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<RemoteHookDef>, StoreError> {
        Ok(page(
            &self.hooks.read(),
            |h| (h.created_at, h.id.clone()),
            cursor.as_ref(),
            limit,
        ))
    }
}

#[async_trait]
impl ChainStore for MemStore {
    async fn create_chain(&self, chain: StoredChain) -> Result<(), StoreError> {
        let mut rows = self.chains.write();
        if rows.contains_key(&chain.id) {
            return Err(StoreError::AlreadyExists {
                entity: "chain",
                id: chain.id,
            });
        }
        rows.insert(chain.id.clone(), chain);
        Ok(())
    }

    async fn get_chain(&self, id: &str) -> Result<StoredChain, StoreError> {
        self.chains
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "chain",
                id: id.to_string(),
            })
    }

    async fn update_chain(&self, mut chain: StoredChain) -> Result<(), StoreError> {
        let mut rows = self.chains.write();
        if !rows.contains_key(&chain.id) {
            return Err(StoreError::NotFound {
                entity: "chain",
                id: chain.id,
            });
        }
        chain.updated_at = Utc::now();
        rows.insert(chain.id.clone(), chain);
        Ok(())
    }

    async fn delete_chain(&self, id: &str) -> Result<(), StoreError> {
        self.chains
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                entity: "chain",
                id: id.to_string(),
            })
    }

    async fn list_chains(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<StoredChain>, StoreError> {
        Ok(page(
            &self.chains.read(),
            |c| (c.created_at, c.id.clone()),
            cursor.as_ref(),
            limit,
        ))
    }
}
