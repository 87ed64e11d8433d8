//! Axum route handlers for the task-chain runtime.
//!
//! # Routes
//!
//! - `GET  /health`              — liveness probe
//! - `POST /execute`             — ad-hoc prompt through the default prompt client
//! - `POST /tasks`               — execute a submitted chain, returns output + trace
//! - `POST /embed`               — embed a string
//! - `POST /v1/chat/completions` — OpenAI-compatible chat (non-stream)
//! - `GET  /supported`           — names of available hooks

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::chain::definition::{ChainTask, TaskHandler, Transition};
use crate::chain::{ChainDefinition, ChainError, ChainExecutor};
use crate::hooks::HookDispatcher;
use crate::inspector::{CapturedStateUnit, Inspector};
use crate::modelrepo::{ModelResolver, ResolveRequest, ResolverError};
use crate::tasks::{StandardTaskExecutor, TaskError, TaskInput, TaskRunner};
use crate::tokenizer::Tokenizer;
use crate::tracker::ActivityTracker;
use crate::types::chat::ChatHistory;
use crate::types::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::types::DataType;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<ChainExecutor>,
    pub runner: Arc<dyn TaskRunner>,
    pub resolver: Arc<dyn ModelResolver>,
    pub hooks: Arc<dyn HookDispatcher>,
    /// Token budget applied to ad-hoc chat completions; `0` disables.
    pub default_token_limit: i64,
}

impl AppState {
    pub fn new(
        resolver: Arc<dyn ModelResolver>,
        hooks: Arc<dyn HookDispatcher>,
        tokenizer: Arc<dyn Tokenizer>,
        tracker: Arc<dyn ActivityTracker>,
    ) -> Self {
        let runner: Arc<dyn TaskRunner> = Arc::new(StandardTaskExecutor::new(
            Arc::clone(&resolver),
            Arc::clone(&hooks),
            tokenizer,
            tracker,
        ));
        let executor = Arc::new(ChainExecutor::new(
            Arc::clone(&runner),
            Inspector::default(),
        ));
        Self {
            executor,
            runner,
            resolver,
            hooks,
            default_token_limit: 0,
        }
    }
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/execute", post(execute_handler))
        .route("/tasks", post(tasks_handler))
        .route("/embed", post(embed_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/supported", get(supported_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type HandlerError = (StatusCode, Json<Value>);

fn error_body(status: StatusCode, message: impl std::fmt::Display) -> HandlerError {
    (status, Json(serde_json::json!({"error": message.to_string()})))
}

fn map_chain_error(error: &ChainError) -> StatusCode {
    match error {
        ChainError::ChainEmpty(_) | ChainError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ChainError::UnknownVariable { .. } | ChainError::Template { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ChainError::TaskFailed { source, .. } => map_task_error(source),
        ChainError::Canceled { .. } => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn map_task_error(error: &TaskError) -> StatusCode {
    match error {
        TaskError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        TaskError::Resolver(ResolverError::NoSatisfactoryModel(_)) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        TaskError::TokenBudgetExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn map_resolver_error(error: &ResolverError) -> StatusCode {
    match error {
        ResolverError::NoSatisfactoryModel(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

async fn health_handler() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "taskchain",
    }))
}

// ---------------------------------------------------------------------------
// POST /execute
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    prompt: String,
}

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    response: String,
}

/// Ad-hoc prompt through the default prompt client.
async fn execute_handler(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, HandlerError> {
    if request.prompt.is_empty() {
        return Err(error_body(
            StatusCode::UNPROCESSABLE_ENTITY,
            "prompt must not be empty",
        ));
    }
    let client = state
        .resolver
        .prompt_client(&ResolveRequest::default())
        .await
        .map_err(|e| error_body(map_resolver_error(&e), e))?;
    let response = client
        .prompt(&request.prompt, None)
        .await
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(ExecuteResponse { response }))
}

// ---------------------------------------------------------------------------
// POST /tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TasksRequest {
    input: Value,
    #[serde(rename = "inputType")]
    input_type: DataType,
    chain: ChainDefinition,
}

#[derive(Debug, Serialize)]
struct TasksResponse {
    output: Value,
    #[serde(rename = "outputType")]
    output_type: DataType,
    state: Vec<CapturedStateUnit>,
}

/// Execute a submitted chain definition on the supplied input.
async fn tasks_handler(
    State(state): State<AppState>,
    Json(request): Json<TasksRequest>,
) -> Result<Json<TasksResponse>, HandlerError> {
    if request.input_type == DataType::OpenaiChatResponse {
        return Err(error_body(
            StatusCode::UNPROCESSABLE_ENTITY,
            "openai_chat_response is not accepted as chain input",
        ));
    }
    let cancel = CancellationToken::new();
    match state
        .executor
        .exec_env(&cancel, &request.chain, request.input, request.input_type)
        .await
    {
        Ok(result) => Ok(Json(TasksResponse {
            output: result.output,
            output_type: result.output_type,
            state: result.trace,
        })),
        Err(failure) => Err(error_body(map_chain_error(&failure.error), failure.error)),
    }
}

// ---------------------------------------------------------------------------
// POST /embed
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EmbedRequest {
    input: String,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbedResponse {
    embedding: Vec<f64>,
}

async fn embed_handler(
    State(state): State<AppState>,
    Json(request): Json<EmbedRequest>,
) -> Result<Json<EmbedResponse>, HandlerError> {
    let resolve = ResolveRequest {
        model_names: request.model.into_iter().collect(),
        ..Default::default()
    };
    let client = state
        .resolver
        .embed_client(&resolve)
        .await
        .map_err(|e| error_body(map_resolver_error(&e), e))?;
    let embedding = client
        .embed(&request.input)
        .await
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(EmbedResponse { embedding }))
}

// ---------------------------------------------------------------------------
// POST /v1/chat/completions
// ---------------------------------------------------------------------------

/// OpenAI-compatible chat completion, non-stream. The request runs through
/// the chat-completion task handler so routing and token accounting match
/// chain execution exactly.
async fn chat_completions_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Json<ChatCompletionResponse>, HandlerError> {
    if request.stream.unwrap_or(false) {
        return Err(error_body(
            StatusCode::UNPROCESSABLE_ENTITY,
            "streaming is not supported on this endpoint",
        ));
    }
    if request.messages.is_empty() {
        return Err(error_body(
            StatusCode::UNPROCESSABLE_ENTITY,
            "messages must not be empty",
        ));
    }

    let task = ChainTask {
        id: "chat".to_string(),
        handler: TaskHandler::ChatCompletion,
        system_instruction: String::new(),
        prompt_template: String::new(),
        print: String::new(),
        output_template: String::new(),
        valid_conditions: Default::default(),
        execute_config: None,
        hook: None,
        input_var: String::new(),
        compose: None,
        transition: Transition::default(),
        timeout: String::new(),
        retry_on_failure: 0,
    };

    let value = serde_json::to_value(&request)
        .map_err(|e| error_body(StatusCode::UNPROCESSABLE_ENTITY, e))?;
    let cancel = CancellationToken::new();
    let output = state
        .runner
        .run(
            &cancel,
            TaskInput {
                task: &task,
                value: &value,
                data_type: DataType::OpenaiChat,
                token_limit: state.default_token_limit,
                start_time: chrono::Utc::now(),
                transition_eval: "",
            },
        )
        .await
        .map_err(|e| error_body(map_task_error(&e), e))?;

    let history = ChatHistory::from_value(&output.value)
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(ChatCompletionResponse::from_chat_history(&history)))
}

// ---------------------------------------------------------------------------
// GET /supported
// ---------------------------------------------------------------------------

async fn supported_handler(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.hooks.supported_hooks().await)
}
