//! Declarative chain and task model.
//!
//! Chains arrive as JSON from the HTTP surface or the chain store. All
//! structural invariants are checked up front by [`ChainDefinition::validate`]
//! so the executor can assume a well-formed machine.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::ChainError;

/// Terminal task id. A branch pointing here ends the chain.
pub const TERMINAL_TASK_ID: &str = "end";

/// A complete task chain: an ordered sequence of tasks, entered at the first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// When set, trace entries capture task inputs and outputs verbatim.
    #[serde(default)]
    pub debug: bool,
    /// Upper bound on prompt tokens per model call; `0` disables the check.
    #[serde(default)]
    pub token_limit: i64,
    #[serde(default)]
    pub tasks: Vec<ChainTask>,
}

/// The kind of a task; decides how its prompt is interpreted and what
/// output type it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskHandler {
    RawString,
    ConditionKey,
    ParseNumber,
    ParseScore,
    ParseRange,
    Embedding,
    RaiseError,
    ParseTransition,
    ParseKeyValue,
    ConvertToOpenaiChatResponse,
    ModelExecution,
    ChatCompletion,
    Noop,
    Hook,
}

impl TaskHandler {
    /// Handlers that send the rendered prompt to a model and therefore
    /// require a non-empty prompt template.
    pub fn calls_model(&self) -> bool {
        matches!(
            self,
            TaskHandler::RawString
                | TaskHandler::ConditionKey
                | TaskHandler::ParseNumber
                | TaskHandler::ParseScore
                | TaskHandler::ParseRange
                | TaskHandler::Embedding
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskHandler::RawString => "raw_string",
            TaskHandler::ConditionKey => "condition_key",
            TaskHandler::ParseNumber => "parse_number",
            TaskHandler::ParseScore => "parse_score",
            TaskHandler::ParseRange => "parse_range",
            TaskHandler::Embedding => "embedding",
            TaskHandler::RaiseError => "raise_error",
            TaskHandler::ParseTransition => "parse_transition",
            TaskHandler::ParseKeyValue => "parse_key_value",
            TaskHandler::ConvertToOpenaiChatResponse => "convert_to_openai_chat_response",
            TaskHandler::ModelExecution => "model_execution",
            TaskHandler::ChatCompletion => "chat_completion",
            TaskHandler::Noop => "noop",
            TaskHandler::Hook => "hook",
        }
    }
}

impl std::fmt::Display for TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model routing and generation overrides for a single task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub hide_tools: Vec<String>,
    #[serde(default)]
    pub pass_clients_tools: bool,
}

impl ExecuteConfig {
    /// Preference-ordered model names: the singular field first.
    pub fn model_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if !self.model.is_empty() {
            names.push(self.model.clone());
        }
        for m in &self.models {
            if !names.contains(m) {
                names.push(m.clone());
            }
        }
        names
    }

    /// Requested provider types, singular field first.
    pub fn provider_types(&self) -> Vec<String> {
        let mut types = Vec::new();
        if !self.provider.is_empty() {
            types.push(self.provider.clone());
        }
        for p in &self.providers {
            if !types.contains(p) {
                types.push(p.clone());
            }
        }
        types
    }
}

/// Reference to a hook plus the static arguments the task contributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookCall {
    pub name: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

/// Merge of the current output with another variable, per named strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeSpec {
    pub with_var: String,
    /// Empty string selects a strategy from the operand types.
    #[serde(default)]
    pub strategy: String,
}

/// Comparison operator of a transition branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionOperator {
    #[serde(rename = "equals")]
    Equals,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "starts_with")]
    StartsWith,
    #[serde(rename = "ends_with")]
    EndsWith,
    #[serde(rename = ">", alias = "gt")]
    GreaterThan,
    #[serde(rename = "<", alias = "lt")]
    LessThan,
    #[serde(rename = "in_range")]
    InRange,
    #[serde(rename = "default")]
    Default,
}

/// One candidate edge out of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionBranch {
    pub operator: TransitionOperator,
    #[serde(default)]
    pub when: String,
    pub goto: String,
    /// Applied to the transitioning output when this branch is taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose: Option<ComposeSpec>,
}

/// All edges out of a task, plus the failure edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transition {
    /// Task to jump to when retries are exhausted; empty fails the chain.
    #[serde(default)]
    pub on_failure: String,
    #[serde(default)]
    pub branches: Vec<TransitionBranch>,
}

/// A single node of the chain state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTask {
    pub id: String,
    pub handler: TaskHandler,
    #[serde(default)]
    pub system_instruction: String,
    #[serde(default)]
    pub prompt_template: String,
    /// Rendered to stdout after the task completes; empty disables.
    #[serde(default)]
    pub print: String,
    /// Renders hook output into a string when set.
    #[serde(default)]
    pub output_template: String,
    #[serde(default)]
    pub valid_conditions: HashMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_config: Option<ExecuteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookCall>,
    /// Name of a prior task's output variable; default chains the previous
    /// task's output through.
    #[serde(default)]
    pub input_var: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose: Option<ComposeSpec>,
    #[serde(default)]
    pub transition: Transition,
    /// Duration string (`"500ms"`, `"30s"`, `"2m"`) bounding each attempt.
    #[serde(default)]
    pub timeout: String,
    #[serde(default)]
    pub retry_on_failure: u32,
}

impl ChainTask {
    /// Parsed per-attempt timeout, if declared.
    pub fn attempt_timeout(&self) -> Result<Option<Duration>, ChainError> {
        if self.timeout.is_empty() {
            return Ok(None);
        }
        parse_duration(&self.timeout)
            .map(Some)
            .ok_or_else(|| ChainError::Validation(format!(
                "task {}: unparseable timeout {:?}",
                self.id, self.timeout
            )))
    }
}

impl ChainDefinition {
    /// Check every structural invariant. Nothing executes on failure.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.tasks.is_empty() {
            return Err(ChainError::ChainEmpty("task list is empty".to_string()));
        }

        let mut ids = HashSet::new();
        for task in &self.tasks {
            if task.id.is_empty() || task.id == TERMINAL_TASK_ID {
                return Err(ChainError::ChainEmpty(format!(
                    "task id {:?} is reserved or empty",
                    task.id
                )));
            }
            if !ids.insert(task.id.as_str()) {
                return Err(ChainError::Validation(format!(
                    "duplicate task id {:?}",
                    task.id
                )));
            }
        }

        for task in &self.tasks {
            for branch in &task.transition.branches {
                if branch.goto != TERMINAL_TASK_ID && !ids.contains(branch.goto.as_str()) {
                    return Err(ChainError::Validation(format!(
                        "task {}: branch goto {:?} names no task in this chain",
                        task.id, branch.goto
                    )));
                }
            }
            if !task.transition.on_failure.is_empty()
                && task.transition.on_failure != TERMINAL_TASK_ID
                && !ids.contains(task.transition.on_failure.as_str())
            {
                return Err(ChainError::Validation(format!(
                    "task {}: on_failure {:?} names no task in this chain",
                    task.id, task.transition.on_failure
                )));
            }

            let is_condition = task.handler == TaskHandler::ConditionKey;
            if is_condition && task.valid_conditions.is_empty() {
                return Err(ChainError::Validation(format!(
                    "task {}: condition_key requires valid_conditions",
                    task.id
                )));
            }
            if !is_condition && !task.valid_conditions.is_empty() {
                return Err(ChainError::Validation(format!(
                    "task {}: valid_conditions is only meaningful for condition_key",
                    task.id
                )));
            }

            let is_hook = task.handler == TaskHandler::Hook;
            if is_hook && task.hook.is_none() {
                return Err(ChainError::Validation(format!(
                    "task {}: hook handler requires a hook call",
                    task.id
                )));
            }
            if !is_hook && task.hook.is_some() {
                return Err(ChainError::Validation(format!(
                    "task {}: hook call is only meaningful for the hook handler",
                    task.id
                )));
            }

            if task.handler.calls_model() && task.prompt_template.is_empty() {
                return Err(ChainError::Validation(format!(
                    "task {}: handler {} requires a prompt template",
                    task.id, task.handler
                )));
            }

            task.attempt_timeout()?;
        }

        Ok(())
    }

    /// Entry task: the first in declaration order.
    pub fn entry_task(&self) -> Option<&ChainTask> {
        self.tasks.first()
    }

    /// Look a task up by id.
    pub fn task(&self, id: &str) -> Option<&ChainTask> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Parse duration strings of the form `"750ms"`, `"30s"`, `"2m"`, `"1h"`.
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: f64 = digits.trim().parse().ok()?;
    if value < 0.0 {
        return None;
    }
    let millis = match unit.trim() {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };
    Some(Duration::from_millis(millis as u64))
}
