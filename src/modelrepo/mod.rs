//! Model repository: catalog, selection policy, routing.
//!
//! The repository is a view over runtime state. For each healthy backend
//! and pulled model it yields a [`Provider`]; a request narrows the set by
//! provider type, preferred model names, capability and context length,
//! and one `(provider, backend)` pair is drawn uniformly at random. The
//! RNG is seedable so routing is reproducible under test.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::providers::{
    Capabilities, ChatClient, EmbedClient, PromptClient, Provider, ProviderError, ProviderType,
    StreamClient,
};
use crate::runtimestate::{BackendStatus, RuntimeState};

/// Capability predicate of a resolution request. `think` is deliberately
/// not part of this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Chat,
    Prompt,
    Embed,
    Stream,
}

impl Capability {
    pub fn satisfied_by(&self, caps: &Capabilities) -> bool {
        match self {
            Capability::Chat => caps.can_chat,
            Capability::Prompt => caps.can_prompt,
            Capability::Embed => caps.can_embed,
            Capability::Stream => caps.can_stream,
        }
    }
}

/// What a caller asks for.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    /// Accepted provider types; empty falls back to per-purpose defaults.
    pub provider_types: Vec<String>,
    /// Preferred model names, most preferred first; empty accepts any.
    pub model_names: Vec<String>,
    /// Minimum context length; `0` accepts any.
    pub context_length: i64,
}

/// Per-purpose provider-type fallbacks used when a request names none.
#[derive(Debug, Clone)]
pub struct DefaultProviders {
    pub chat: Vec<String>,
    pub prompt: Vec<String>,
    pub embed: Vec<String>,
}

impl Default for DefaultProviders {
    fn default() -> Self {
        let usual = vec!["ollama".to_string(), "openai".to_string()];
        Self {
            chat: usual.clone(),
            prompt: usual.clone(),
            embed: usual,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolverError {
    /// No provider satisfies the request.
    #[error("no satisfactory model: {0}")]
    NoSatisfactoryModel(String),

    /// A selected backend id is missing from runtime state.
    #[error("backend {0:?} is not in runtime state")]
    BackendMissing(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Client factory used by the task executor. The production implementation
/// is [`ModelRepo`]; tests substitute scripted resolvers.
#[async_trait]
pub trait ModelResolver: Send + Sync {
    async fn chat_client(
        &self,
        request: &ResolveRequest,
    ) -> Result<Box<dyn ChatClient>, ResolverError>;
    async fn prompt_client(
        &self,
        request: &ResolveRequest,
    ) -> Result<Box<dyn PromptClient>, ResolverError>;
    async fn embed_client(
        &self,
        request: &ResolveRequest,
    ) -> Result<Box<dyn EmbedClient>, ResolverError>;
    async fn stream_client(
        &self,
        request: &ResolveRequest,
    ) -> Result<Box<dyn StreamClient>, ResolverError>;
}

/// Catalog + policy + routing over the runtime-state projection.
pub struct ModelRepo {
    state: Arc<RuntimeState>,
    defaults: DefaultProviders,
    http: reqwest::Client,
    rng: Mutex<StdRng>,
}

impl ModelRepo {
    pub fn new(state: Arc<RuntimeState>) -> Self {
        Self {
            state,
            defaults: DefaultProviders::default(),
            http: reqwest::Client::new(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Fixed seed: identical requests against identical state resolve to
    /// identical `(provider, backend)` pairs.
    pub fn with_seed(state: Arc<RuntimeState>, seed: u64) -> Self {
        Self {
            state,
            defaults: DefaultProviders::default(),
            http: reqwest::Client::new(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn with_defaults(mut self, defaults: DefaultProviders) -> Self {
        self.defaults = defaults;
        self
    }

    fn fallback_types(&self, capability: Capability) -> &[String] {
        match capability {
            Capability::Chat | Capability::Stream => &self.defaults.chat,
            Capability::Prompt => &self.defaults.prompt,
            Capability::Embed => &self.defaults.embed,
        }
    }

    /// Enumerate providers for the accepted provider types: one per
    /// `(type, model)` with the backend ids of every healthy backend that
    /// has the model pulled.
    fn enumerate(&self, accepted_types: &[String]) -> Vec<Provider> {
        let mut providers: Vec<Provider> = Vec::new();
        for entry in self.state.snapshot() {
            if entry.status != BackendStatus::Healthy {
                continue;
            }
            let type_name = entry.backend.backend_type.as_str();
            if !accepted_types.iter().any(|t| t == type_name) {
                continue;
            }
            for model in &entry.pulled_models {
                if let Some(existing) = providers.iter_mut().find(|p| {
                    p.provider_type == entry.backend.backend_type && p.model_name == model.name
                }) {
                    if !existing.backend_ids.contains(&entry.backend.id) {
                        existing.backend_ids.push(entry.backend.id.clone());
                    }
                } else {
                    providers.push(Provider::new(
                        entry.backend.backend_type,
                        model.name.clone(),
                        vec![entry.backend.id.clone()],
                        model.context_length,
                        model.capabilities,
                    ));
                }
            }
        }
        // Deterministic enumeration order regardless of map iteration.
        providers.sort_by(|a, b| a.id.cmp(&b.id).then(a.backend_ids.cmp(&b.backend_ids)));
        for provider in &mut providers {
            provider.backend_ids.sort();
        }
        providers
    }

    /// The candidate set for a request, preference order honoured.
    fn candidates(&self, request: &ResolveRequest, capability: Capability) -> Vec<Provider> {
        let accepted: Vec<String> = if request.provider_types.is_empty() {
            self.fallback_types(capability).to_vec()
        } else {
            request.provider_types.clone()
        };
        let pool = self.enumerate(&accepted);

        let fits = |p: &Provider| {
            capability.satisfied_by(&p.capabilities)
                && (request.context_length <= 0 || p.context_length >= request.context_length)
        };

        if request.model_names.is_empty() {
            return pool.into_iter().filter(|p| fits(p)).collect();
        }

        let mut selected: Vec<Provider> = Vec::new();
        for preferred in &request.model_names {
            for provider in pool.iter() {
                if provider.matches_name(preferred)
                    && fits(provider)
                    && !selected.iter().any(|s| s.id == provider.id)
                {
                    selected.push(provider.clone());
                }
            }
        }
        selected
    }

    /// Pick one `(provider, backend_id)` uniformly at random from the
    /// candidate set.
    pub fn resolve(
        &self,
        request: &ResolveRequest,
        capability: Capability,
    ) -> Result<(Provider, String), ResolverError> {
        let candidates = self.candidates(request, capability);
        if candidates.is_empty() {
            return Err(ResolverError::NoSatisfactoryModel(format!(
                "types={:?} models={:?} capability={:?}",
                request.provider_types, request.model_names, capability
            )));
        }
        let mut rng = self.rng.lock();
        let provider = candidates[rng.gen_range(0..candidates.len())].clone();
        let backend_id = provider.backend_ids[rng.gen_range(0..provider.backend_ids.len())].clone();
        Ok((provider, backend_id))
    }

    fn backend_for(&self, backend_id: &str) -> Result<crate::store::Backend, ResolverError> {
        self.state
            .get(backend_id)
            .map(|entry| entry.backend)
            .ok_or_else(|| ResolverError::BackendMissing(backend_id.to_string()))
    }
}

#[async_trait]
impl ModelResolver for ModelRepo {
    async fn chat_client(
        &self,
        request: &ResolveRequest,
    ) -> Result<Box<dyn ChatClient>, ResolverError> {
        let (provider, backend_id) = self.resolve(request, Capability::Chat)?;
        let backend = self.backend_for(&backend_id)?;
        Ok(provider.chat_client(&backend, self.http.clone())?)
    }

    async fn prompt_client(
        &self,
        request: &ResolveRequest,
    ) -> Result<Box<dyn PromptClient>, ResolverError> {
        let (provider, backend_id) = self.resolve(request, Capability::Prompt)?;
        let backend = self.backend_for(&backend_id)?;
        Ok(provider.prompt_client(&backend, self.http.clone())?)
    }

    async fn embed_client(
        &self,
        request: &ResolveRequest,
    ) -> Result<Box<dyn EmbedClient>, ResolverError> {
        let (provider, backend_id) = self.resolve(request, Capability::Embed)?;
        let backend = self.backend_for(&backend_id)?;
        Ok(provider.embed_client(&backend, self.http.clone())?)
    }

    async fn stream_client(
        &self,
        request: &ResolveRequest,
    ) -> Result<Box<dyn StreamClient>, ResolverError> {
        let (provider, backend_id) = self.resolve(request, Capability::Stream)?;
        let backend = self.backend_for(&backend_id)?;
        Ok(provider.stream_client(&backend, self.http.clone())?)
    }
}
