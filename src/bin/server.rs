//! taskchain HTTP server binary.
//!
//! Wires the in-memory store, runtime-state reconciler and model repository
//! together and serves the chain-execution HTTP surface.
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP port (default: 8080)
//! - `RUST_LOG` — tracing filter (default: "info")
//! - `TASKCHAIN_CHAT_PROVIDERS` / `TASKCHAIN_PROMPT_PROVIDERS` /
//!   `TASKCHAIN_EMBED_PROVIDERS` — provider-type fallbacks, comma
//!   separated (default: "ollama,openai")
//! - `TASKCHAIN_BACKEND_URL` / `TASKCHAIN_BACKEND_TYPE` — optional single
//!   backend registered at startup (e.g. an Ollama instance)
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin server
//! ```

use std::sync::Arc;
use std::time::Duration;

use taskchain::bus::BroadcastBus;
use taskchain::hooks::local::{EchoHook, ElapsedHook, HookRegistry};
use taskchain::hooks::remote::PersistedHookDispatcher;
use taskchain::modelrepo::{DefaultProviders, ModelRepo};
use taskchain::providers::ProviderType;
use taskchain::runtimestate::loops::{spawn_loop, LoopConfig};
use taskchain::runtimestate::reconciler::Reconciler;
use taskchain::runtimestate::RuntimeState;
use taskchain::server::{app_router, AppState};
use taskchain::store::memory::MemStore;
use taskchain::store::{Backend, BackendStore, Store};
use taskchain::tokenizer::HeuristicTokenizer;
use taskchain::tracker::LogTracker;

fn provider_list(var: &str) -> Vec<String> {
    std::env::var(var)
        .unwrap_or_else(|_| "ollama,openai".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taskchain=debug".into()),
        )
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("0.0.0.0:{}", port);

    let mem_store = Arc::new(MemStore::new());
    let store: Arc<dyn Store> = Arc::clone(&mem_store) as _;
    let state = Arc::new(RuntimeState::new());
    let bus = Arc::new(BroadcastBus::new());

    // Optional single backend from the environment.
    if let Ok(base_url) = std::env::var("TASKCHAIN_BACKEND_URL") {
        let backend_type = std::env::var("TASKCHAIN_BACKEND_TYPE")
            .ok()
            .and_then(|t| ProviderType::parse(&t))
            .unwrap_or(ProviderType::Ollama);
        let backend = Backend::new("default", base_url, backend_type);
        if let Err(e) = store.create_backend(backend).await {
            tracing::warn!("registering default backend failed: {}", e);
        }
    }

    // Reconciliation loops.
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&state),
        Arc::clone(&bus) as _,
    ));
    let backend_loop = {
        let reconciler = Arc::clone(&reconciler);
        spawn_loop(
            LoopConfig::new("backend-cycle", Duration::from_secs(30)),
            move || {
                let reconciler = Arc::clone(&reconciler);
                async move { reconciler.backend_cycle().await }
            },
        )
    };
    let download_loop = {
        let reconciler = Arc::clone(&reconciler);
        spawn_loop(
            LoopConfig::new("download-cycle", Duration::from_secs(60)),
            move || {
                let reconciler = Arc::clone(&reconciler);
                async move { reconciler.download_cycle().await }
            },
        )
    };

    // Model repository over the runtime projection.
    let defaults = DefaultProviders {
        chat: provider_list("TASKCHAIN_CHAT_PROVIDERS"),
        prompt: provider_list("TASKCHAIN_PROMPT_PROVIDERS"),
        embed: provider_list("TASKCHAIN_EMBED_PROVIDERS"),
    };
    let repo = Arc::new(ModelRepo::new(Arc::clone(&state)).with_defaults(defaults));

    // Hooks: built-in local hooks plus persisted remote hooks.
    let registry = Arc::new(HookRegistry::new());
    registry.register(Arc::new(EchoHook));
    registry.register(Arc::new(ElapsedHook));
    let dispatcher = Arc::new(PersistedHookDispatcher::new(
        registry,
        Arc::clone(&mem_store) as _,
    ));

    let app_state = AppState::new(
        repo,
        dispatcher,
        Arc::new(HeuristicTokenizer::new()),
        Arc::new(LogTracker),
    );
    let app = app_router(app_state);

    tracing::info!("taskchain server starting on {}", bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health              — liveness probe");
    tracing::info!("  POST /execute             — ad-hoc prompt");
    tracing::info!("  POST /tasks               — chain execution");
    tracing::info!("  POST /embed               — embeddings");
    tracing::info!("  POST /v1/chat/completions — OpenAI-compatible chat");
    tracing::info!("  GET  /supported           — hook names");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .expect("Server failed");

    backend_loop.shutdown().await;
    download_loop.shutdown().await;
}
