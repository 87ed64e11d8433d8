//! The task executor: a single dispatch table over handler kinds.
//!
//! Turns `(task, input, input_type)` into `(output, output_type,
//! transition_eval)`. Model-facing handlers go through the resolver for a
//! client; the hook handler delegates to the hook dispatcher; the rest are
//! pure. Adding a handler is a table-and-case change.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::errors::TaskError;
use super::parse;
use crate::chain::definition::{ChainTask, ExecuteConfig, TaskHandler};
use crate::chain::template;
use crate::hooks::HookDispatcher;
use crate::modelrepo::{ModelResolver, ResolveRequest};
use crate::providers::ChatCallOptions;
use crate::tokenizer::{count_history_tokens, Tokenizer};
use crate::tracker::ActivityTracker;
use crate::types::chat::{ChatHistory, Message};
use crate::types::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::types::DataType;

/// Everything a single attempt needs.
pub struct TaskInput<'a> {
    pub task: &'a ChainTask,
    pub value: &'a Value,
    pub data_type: DataType,
    /// The chain's token budget; `0` disables the gate.
    pub token_limit: i64,
    /// When the chain invocation started.
    pub start_time: DateTime<Utc>,
    /// The transition eval flowing into this task (hooks pass it through).
    pub transition_eval: &'a str,
}

/// What an attempt produced.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub value: Value,
    pub data_type: DataType,
    pub transition_eval: String,
}

impl TaskOutput {
    fn new(value: Value, data_type: DataType, transition_eval: impl Into<String>) -> Self {
        Self {
            value,
            data_type,
            transition_eval: transition_eval.into(),
        }
    }
}

/// The seam between chain executor and task execution.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        input: TaskInput<'_>,
    ) -> Result<TaskOutput, TaskError>;
}

/// Production task executor over resolver, hooks and tokenizer.
pub struct StandardTaskExecutor {
    resolver: Arc<dyn ModelResolver>,
    hooks: Arc<dyn HookDispatcher>,
    tokenizer: Arc<dyn Tokenizer>,
    tracker: Arc<dyn ActivityTracker>,
}

impl StandardTaskExecutor {
    pub fn new(
        resolver: Arc<dyn ModelResolver>,
        hooks: Arc<dyn HookDispatcher>,
        tokenizer: Arc<dyn Tokenizer>,
        tracker: Arc<dyn ActivityTracker>,
    ) -> Self {
        Self {
            resolver,
            hooks,
            tokenizer,
            tracker,
        }
    }

    fn resolve_request(config: &ExecuteConfig) -> ResolveRequest {
        ResolveRequest {
            provider_types: config.provider_types(),
            model_names: config.model_names(),
            context_length: 0,
        }
    }

    /// Send a prompt through a resolved prompt client, cooperating with
    /// cancellation.
    async fn prompt_model(
        &self,
        cancel: &CancellationToken,
        task_id: &str,
        config: &ExecuteConfig,
        prompt: &str,
    ) -> Result<String, TaskError> {
        let request = Self::resolve_request(config);
        let client = self.resolver.prompt_client(&request).await?;
        let span = self
            .tracker
            .start("model_prompt", &[("model", client.model()), ("task", task_id)]);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::Canceled),
            r = client.prompt(prompt, config.temperature) => r.map_err(TaskError::from),
        };
        match &result {
            Ok(_) => span.end_ok(),
            Err(e) => span.end_error(&e.to_string()),
        }
        result
    }

    /// The `model_execution` / `chat_completion` handler.
    async fn chat(
        &self,
        cancel: &CancellationToken,
        input: &TaskInput<'_>,
    ) -> Result<TaskOutput, TaskError> {
        let task = input.task;
        let mut config = task.execute_config.clone().unwrap_or_default();

        // openai_chat converts first; request-level settings merge with the
        // task config, task side winning.
        let mut history = match input.data_type {
            DataType::ChatHistory => ChatHistory::from_value(input.value)
                .map_err(|e| TaskError::Validation(format!("bad chat history: {}", e)))?,
            DataType::OpenaiChat => {
                let request: ChatCompletionRequest = serde_json::from_value(input.value.clone())
                    .map_err(|e| TaskError::Validation(format!("bad chat request: {}", e)))?;
                if config.temperature.is_none() {
                    config.temperature = request.temperature;
                }
                if config.model_names().is_empty() && !request.model.is_empty() {
                    config.model = request.model.clone();
                }
                request.to_chat_history()
            }
            other => {
                return Err(TaskError::Validation(format!(
                    "chat handler needs chat_history or openai_chat, got {}",
                    other
                )))
            }
        };

        if !task.system_instruction.is_empty()
            && !history.has_system_instruction(&task.system_instruction)
        {
            history
                .messages
                .insert(0, Message::system(&task.system_instruction));
        }

        // Budget gate before anything leaves the process.
        let count_model = if history.model.is_empty() {
            config.model_names().into_iter().next().unwrap_or_default()
        } else {
            history.model.clone()
        };
        if history.input_tokens == 0 {
            history.input_tokens =
                count_history_tokens(self.tokenizer.as_ref(), &count_model, &history).await?;
        }
        if input.token_limit > 0 && history.input_tokens > input.token_limit {
            return Err(TaskError::TokenBudgetExceeded {
                used: history.input_tokens,
                limit: input.token_limit,
            });
        }

        let request = Self::resolve_request(&config);
        let client = self.resolver.chat_client(&request).await?;
        let options = ChatCallOptions {
            temperature: config.temperature,
            ..Default::default()
        };

        let span = self
            .tracker
            .start("model_chat", &[("model", client.model()), ("task", &task.id)]);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::Canceled),
            r = client.chat(&history.messages, &options) => r.map_err(TaskError::from),
        };
        let turn = match result {
            Ok(turn) => {
                span.end_ok();
                turn
            }
            Err(e) => {
                span.end_error(&e.to_string());
                return Err(e);
            }
        };

        let output_tokens = match turn.usage {
            Some(usage) if usage.completion_tokens > 0 => {
                if usage.prompt_tokens > 0 {
                    history.input_tokens = usage.prompt_tokens;
                }
                usage.completion_tokens
            }
            _ => {
                self.tokenizer
                    .count_tokens(&count_model, &turn.message.content)
                    .await?
            }
        };
        history.output_tokens += output_tokens;
        history.model = client.model().to_string();
        history.messages.push(turn.message);

        Ok(TaskOutput::new(
            history.to_value(),
            DataType::ChatHistory,
            "executed",
        ))
    }

    /// The `hook` handler: dispatch, then optionally render the result
    /// through the task's output template.
    async fn hook(
        &self,
        cancel: &CancellationToken,
        input: &TaskInput<'_>,
    ) -> Result<TaskOutput, TaskError> {
        let task = input.task;
        let call = task
            .hook
            .as_ref()
            .ok_or_else(|| TaskError::Validation("hook task without hook call".to_string()))?;

        let span = self
            .tracker
            .start("hook", &[("hook", &call.name), ("task", &task.id)]);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::Canceled),
            r = self.hooks.exec(
                input.start_time,
                input.value,
                input.data_type,
                input.transition_eval,
                call,
            ) => r.map_err(TaskError::from),
        };
        let outcome = match result {
            Ok(outcome) => {
                span.end_ok();
                outcome
            }
            Err(e) => {
                span.end_error(&e.to_string());
                return Err(e);
            }
        };

        if task.output_template.is_empty() {
            return Ok(TaskOutput::new(
                outcome.value,
                outcome.data_type,
                outcome.transition_eval,
            ));
        }

        // The returned JSON object is the data context of the template.
        let vars: HashMap<String, Value> = match &outcome.value {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            other => HashMap::from([("output".to_string(), other.clone())]),
        };
        let rendered = template::render(&task.output_template, &vars)
            .map_err(|e| TaskError::Template(e.to_string()))?;
        Ok(TaskOutput::new(
            Value::String(rendered),
            DataType::String,
            outcome.transition_eval,
        ))
    }
}

#[async_trait]
impl TaskRunner for StandardTaskExecutor {
    async fn run(
        &self,
        cancel: &CancellationToken,
        input: TaskInput<'_>,
    ) -> Result<TaskOutput, TaskError> {
        let task = input.task;
        let config = task.execute_config.clone().unwrap_or_default();

        match task.handler {
            TaskHandler::Noop => Ok(TaskOutput::new(
                input.value.clone(),
                input.data_type,
                "noop",
            )),

            TaskHandler::RawString => {
                let prompt = parse::unify_prompt(input.value, input.data_type)
                    .map_err(TaskError::Validation)?;
                let text = self.prompt_model(cancel, &task.id, &config, &prompt).await?;
                Ok(TaskOutput::new(
                    Value::String(text.clone()),
                    DataType::String,
                    text,
                ))
            }

            TaskHandler::ConditionKey => {
                let prompt = parse::unify_prompt(input.value, input.data_type)
                    .map_err(TaskError::Validation)?;
                let response = self.prompt_model(cancel, &task.id, &config, &prompt).await?;
                let normalized = response.trim().to_lowercase();
                let hit = task
                    .valid_conditions
                    .iter()
                    .find(|(key, _)| key.trim().to_lowercase() == normalized);
                match hit {
                    Some((_, &value)) => Ok(TaskOutput::new(
                        Value::Bool(value),
                        DataType::Bool,
                        value.to_string(),
                    )),
                    None => Err(TaskError::Parse(format!(
                        "{:?} matches no valid condition",
                        response
                    ))),
                }
            }

            TaskHandler::ParseNumber => {
                let prompt = parse::unify_prompt(input.value, input.data_type)
                    .map_err(TaskError::Validation)?;
                let response = self.prompt_model(cancel, &task.id, &config, &prompt).await?;
                let n = parse::parse_integer(&response).map_err(TaskError::Parse)?;
                Ok(TaskOutput::new(json!(n), DataType::Int, n.to_string()))
            }

            TaskHandler::ParseScore => {
                let prompt = parse::unify_prompt(input.value, input.data_type)
                    .map_err(TaskError::Validation)?;
                let response = self.prompt_model(cancel, &task.id, &config, &prompt).await?;
                let score = parse::parse_score(&response).map_err(TaskError::Parse)?;
                Ok(TaskOutput::new(
                    json!(score),
                    DataType::Float,
                    score.to_string(),
                ))
            }

            TaskHandler::ParseRange => {
                let prompt = parse::unify_prompt(input.value, input.data_type)
                    .map_err(TaskError::Validation)?;
                let response = self.prompt_model(cancel, &task.id, &config, &prompt).await?;
                let range = parse::normalize_range(&response).map_err(TaskError::Parse)?;
                Ok(TaskOutput::new(
                    Value::String(range.clone()),
                    DataType::String,
                    range,
                ))
            }

            TaskHandler::Embedding => {
                let prompt = parse::unify_prompt(input.value, input.data_type)
                    .map_err(TaskError::Validation)?;
                let request = Self::resolve_request(&config);
                let client = self.resolver.embed_client(&request).await?;
                let span = self
                    .tracker
                    .start("model_embed", &[("model", client.model()), ("task", &task.id)]);
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TaskError::Canceled),
                    r = client.embed(&prompt) => r.map_err(TaskError::from),
                };
                let vector = match result {
                    Ok(v) => {
                        span.end_ok();
                        v
                    }
                    Err(e) => {
                        span.end_error(&e.to_string());
                        return Err(e);
                    }
                };
                Ok(TaskOutput::new(json!(vector), DataType::Vector, "executed"))
            }

            TaskHandler::RaiseError => {
                let message = parse::unify_prompt(input.value, input.data_type)
                    .unwrap_or_else(|_| "raise_error task fired".to_string());
                Err(TaskError::Raised(message))
            }

            TaskHandler::ParseTransition => {
                let prompt = parse::unify_prompt(input.value, input.data_type)
                    .map_err(TaskError::Validation)?;
                let eval = parse::parse_transition_command(&prompt)
                    .unwrap_or_else(|| "pass".to_string());
                Ok(TaskOutput::new(input.value.clone(), input.data_type, eval))
            }

            TaskHandler::ParseKeyValue => {
                if input.data_type == DataType::Json {
                    return Ok(TaskOutput::new(
                        input.value.clone(),
                        DataType::Json,
                        "executed",
                    ));
                }
                let text = parse::unify_prompt(input.value, input.data_type)
                    .map_err(TaskError::Validation)?;
                let parsed = parse::parse_key_value(&text).map_err(TaskError::Parse)?;
                Ok(TaskOutput::new(parsed, DataType::Json, "executed"))
            }

            TaskHandler::ConvertToOpenaiChatResponse => {
                if input.data_type != DataType::ChatHistory {
                    return Err(TaskError::Validation(format!(
                        "convert_to_openai_chat_response needs chat_history, got {}",
                        input.data_type
                    )));
                }
                let history = ChatHistory::from_value(input.value)
                    .map_err(|e| TaskError::Validation(format!("bad chat history: {}", e)))?;
                let response = ChatCompletionResponse::from_chat_history(&history);
                let value = serde_json::to_value(response)
                    .map_err(|e| TaskError::Internal(e.to_string()))?;
                Ok(TaskOutput::new(
                    value,
                    DataType::OpenaiChatResponse,
                    "executed",
                ))
            }

            TaskHandler::ModelExecution | TaskHandler::ChatCompletion => {
                self.chat(cancel, &input).await
            }

            TaskHandler::Hook => self.hook(cancel, &input).await,
        }
    }
}
