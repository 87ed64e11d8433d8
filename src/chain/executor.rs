//! The chain executor: walks the task state machine.
//!
//! One call to [`ChainExecutor::exec_env`] drives a whole chain: input
//! binding, template rendering, task dispatch with retries and per-attempt
//! timeouts, compose, transition evaluation and trace recording. Execution
//! is synchronous to the caller and strictly linear; nothing is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::compose;
use super::definition::{ChainDefinition, ChainTask, ComposeSpec, TERMINAL_TASK_ID};
use super::errors::ChainError;
use super::template::{self, TemplateError};
use super::transition::select_branch;
use crate::inspector::{CapturedStateUnit, ExecutionTrace, Inspector};
use crate::tasks::{TaskError, TaskInput, TaskOutput, TaskRunner};
use crate::types::DataType;

/// A finished chain: terminal output plus the full trace.
#[derive(Debug)]
pub struct ChainResult {
    pub output: Value,
    pub output_type: DataType,
    pub trace: Vec<CapturedStateUnit>,
}

/// A failed chain: the final error plus whatever trace accumulated.
#[derive(Debug)]
pub struct ChainFailure {
    pub error: ChainError,
    pub trace: Vec<CapturedStateUnit>,
}

impl std::fmt::Display for ChainFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for ChainFailure {}

/// One successful attempt: the raw handler output plus the value that
/// actually flows on (composed when the task declares a compose block).
struct AttemptSuccess {
    raw: TaskOutput,
    effective: (Value, DataType),
}

pub struct ChainExecutor {
    runner: Arc<dyn TaskRunner>,
    inspector: Inspector,
}

impl ChainExecutor {
    pub fn new(runner: Arc<dyn TaskRunner>, inspector: Inspector) -> Self {
        Self { runner, inspector }
    }

    /// Execute `chain` on `(input, input_type)` with a fresh trace.
    pub async fn exec_env(
        &self,
        cancel: &CancellationToken,
        chain: &ChainDefinition,
        input: Value,
        input_type: DataType,
    ) -> Result<ChainResult, ChainFailure> {
        let trace = self.inspector.start();
        self.exec_with_trace(cancel, chain, input, input_type, trace)
            .await
    }

    /// Execute against a caller-supplied trace (shared with a debugger).
    pub async fn exec_with_trace(
        &self,
        cancel: &CancellationToken,
        chain: &ChainDefinition,
        input: Value,
        input_type: DataType,
        trace: Arc<dyn ExecutionTrace>,
    ) -> Result<ChainResult, ChainFailure> {
        let fail = |error: ChainError, trace: &Arc<dyn ExecutionTrace>| ChainFailure {
            error,
            trace: trace.get_execution_history(),
        };

        if let Err(e) = chain.validate() {
            return Err(fail(e, &trace));
        }

        let mut vars: HashMap<String, Value> = HashMap::new();
        let mut var_types: HashMap<String, DataType> = HashMap::new();
        vars.insert("input".to_string(), input.clone());
        var_types.insert("input".to_string(), input_type);

        let mut flowing = input;
        let mut flowing_type = input_type;
        let mut transition_eval = String::new();
        let start_time = Utc::now();

        let mut current: &ChainTask = match chain.entry_task() {
            Some(task) => task,
            None => {
                return Err(fail(
                    ChainError::ChainEmpty("no entry task".to_string()),
                    &trace,
                ))
            }
        };

        loop {
            let task_id = current.id.clone();
            if cancel.is_cancelled() {
                return Err(fail(ChainError::Canceled { task_id }, &trace));
            }

            trace.set_current_state(&task_id);
            if trace.has_breakpoint(&task_id) {
                return Err(fail(ChainError::BreakpointHit { task_id }, &trace));
            }

            // 1. Resolve input.
            let (mut task_value, mut task_type) = if current.input_var.is_empty() {
                (flowing.clone(), flowing_type)
            } else {
                match (
                    vars.get(&current.input_var),
                    var_types.get(&current.input_var),
                ) {
                    (Some(v), Some(t)) => (v.clone(), *t),
                    _ => {
                        return Err(fail(
                            ChainError::UnknownVariable {
                                task_id,
                                name: current.input_var.clone(),
                            },
                            &trace,
                        ))
                    }
                }
            };

            // 2. Render the prompt; the rendered string becomes the input.
            if !current.prompt_template.is_empty() {
                match template::render(&current.prompt_template, &vars) {
                    Ok(rendered) => {
                        task_value = Value::String(rendered);
                        task_type = DataType::String;
                    }
                    Err(TemplateError::UnknownVariable(name)) => {
                        return Err(fail(
                            ChainError::UnknownVariable { task_id, name },
                            &trace,
                        ))
                    }
                    Err(e) => {
                        record_non_attempt_failure(&trace, current, task_type, &e.to_string());
                        match self.failure_edge(chain, current) {
                            Some(next) => {
                                if next == TERMINAL_TASK_ID {
                                    return Ok(ChainResult {
                                        output: flowing,
                                        output_type: flowing_type,
                                        trace: trace.get_execution_history(),
                                    });
                                }
                                current = chain.task(next).expect("validated goto");
                                transition_eval.clear();
                                continue;
                            }
                            None => {
                                return Err(fail(
                                    ChainError::Template {
                                        task_id,
                                        message: e.to_string(),
                                    },
                                    &trace,
                                ))
                            }
                        }
                    }
                }
            }

            // Compose operand resolves before any attempt runs.
            let compose_operand = match resolve_compose_operand(
                &task_id,
                current.compose.as_ref(),
                &vars,
                &var_types,
            ) {
                Ok(operand) => operand,
                Err(e) => return Err(fail(e, &trace)),
            };

            let timeout = match current.attempt_timeout() {
                Ok(t) => t,
                Err(e) => return Err(fail(e, &trace)),
            };

            // 3–6. Attempts, compose, trace.
            let attempts = current.retry_on_failure + 1;
            let mut outcome: Result<AttemptSuccess, TaskError> =
                Err(TaskError::Internal("no attempt ran".to_string()));

            for _attempt in 0..attempts {
                if cancel.is_cancelled() {
                    outcome = Err(TaskError::Canceled);
                    break;
                }

                let attempt_started = Instant::now();
                let child = cancel.child_token();
                let run = self.runner.run(
                    &child,
                    TaskInput {
                        task: current,
                        value: &task_value,
                        data_type: task_type,
                        token_limit: chain.token_limit,
                        start_time,
                        transition_eval: &transition_eval,
                    },
                );
                let raw = match timeout {
                    Some(bound) => match tokio::time::timeout(bound, run).await {
                        Ok(result) => result,
                        Err(_) => {
                            child.cancel();
                            Err(TaskError::Timeout)
                        }
                    },
                    None => run.await,
                };

                let attempt = raw.and_then(|output| match (&current.compose, &compose_operand) {
                    (Some(spec), Some((right, right_type))) => compose::compose(
                        &spec.strategy,
                        &output.value,
                        output.data_type,
                        right,
                        *right_type,
                    )
                    .map(|effective| AttemptSuccess {
                        raw: output,
                        effective,
                    })
                    .map_err(TaskError::from),
                    _ => Ok(AttemptSuccess {
                        effective: (output.value.clone(), output.data_type),
                        raw: output,
                    }),
                });

                trace.record_step(CapturedStateUnit {
                    task_id: task_id.clone(),
                    task_handler: current.handler.as_str().to_string(),
                    input_type: task_type,
                    output_type: attempt
                        .as_ref()
                        .map(|a| a.effective.1)
                        .unwrap_or(task_type),
                    transition: attempt
                        .as_ref()
                        .map(|a| a.raw.transition_eval.clone())
                        .unwrap_or_default(),
                    duration: attempt_started.elapsed().as_millis() as u64,
                    error: attempt.as_ref().err().map(|e| e.to_string()),
                    input: chain.debug.then(|| payload_string(&task_value)),
                    output: match (&attempt, chain.debug) {
                        (Ok(a), true) => Some(payload_string(&a.effective.0)),
                        _ => None,
                    },
                });

                match attempt {
                    Ok(success) => {
                        outcome = Ok(success);
                        break;
                    }
                    Err(e) => {
                        let retryable = e.is_retryable();
                        outcome = Err(e);
                        if !retryable {
                            break;
                        }
                    }
                }
            }

            let success = match outcome {
                Ok(success) => success,
                Err(TaskError::Canceled) => {
                    return Err(fail(ChainError::Canceled { task_id }, &trace))
                }
                Err(e) => match self.failure_edge(chain, current) {
                    // 9. Exhausted retries with a failure edge declared.
                    Some(next) => {
                        if next == TERMINAL_TASK_ID {
                            return Ok(ChainResult {
                                output: flowing,
                                output_type: flowing_type,
                                trace: trace.get_execution_history(),
                            });
                        }
                        current = chain.task(next).expect("validated goto");
                        transition_eval.clear();
                        continue;
                    }
                    None => {
                        return Err(fail(
                            ChainError::TaskFailed {
                                task_id,
                                attempts,
                                source: e,
                            },
                            &trace,
                        ))
                    }
                },
            };

            // 7. Publish variables.
            vars.insert(task_id.clone(), success.raw.value.clone());
            var_types.insert(task_id.clone(), success.raw.data_type);
            if current.compose.is_some() {
                vars.insert(
                    format!("{}_composed", task_id),
                    success.effective.0.clone(),
                );
                var_types.insert(format!("{}_composed", task_id), success.effective.1);
            }
            flowing = success.effective.0;
            flowing_type = success.effective.1;
            vars.insert("previous_output".to_string(), flowing.clone());
            var_types.insert("previous_output".to_string(), flowing_type);
            transition_eval = success.raw.transition_eval;

            if !current.print.is_empty() {
                match template::render(&current.print, &vars) {
                    Ok(line) => println!("{}", line),
                    Err(e) => log::warn!("task {}: print template failed: {}", task_id, e),
                }
            }

            // 7b. Evaluate the transition.
            let branch = match select_branch(&current.transition.branches, &transition_eval) {
                Some(branch) => branch,
                None => {
                    return Err(fail(
                        ChainError::TransitionUnresolved {
                            task_id,
                            response: transition_eval,
                        },
                        &trace,
                    ))
                }
            };

            // Per-branch compose applies on top of the transitioning output.
            if let Some(spec) = &branch.compose {
                let operand =
                    match resolve_compose_operand(&task_id, Some(spec), &vars, &var_types) {
                        Ok(operand) => operand,
                        Err(e) => return Err(fail(e, &trace)),
                    };
                let (right, right_type) = operand.expect("operand present for Some spec");
                match compose::compose(&spec.strategy, &flowing, flowing_type, &right, right_type)
                {
                    Ok((value, data_type)) => {
                        vars.insert(format!("{}_composed", task_id), value.clone());
                        var_types.insert(format!("{}_composed", task_id), data_type);
                        flowing = value;
                        flowing_type = data_type;
                        vars.insert("previous_output".to_string(), flowing.clone());
                        var_types.insert("previous_output".to_string(), flowing_type);
                    }
                    Err(e) => {
                        return Err(fail(
                            ChainError::TaskFailed {
                                task_id,
                                attempts,
                                source: TaskError::from(e),
                            },
                            &trace,
                        ))
                    }
                }
            }

            // 8. Advance.
            if branch.goto.is_empty() || branch.goto == TERMINAL_TASK_ID {
                return Ok(ChainResult {
                    output: flowing,
                    output_type: flowing_type,
                    trace: trace.get_execution_history(),
                });
            }
            current = chain.task(&branch.goto).expect("validated goto");
        }
    }

    fn failure_edge<'c>(&self, _chain: &'c ChainDefinition, task: &'c ChainTask) -> Option<&'c str> {
        if task.transition.on_failure.is_empty() {
            None
        } else {
            Some(task.transition.on_failure.as_str())
        }
    }
}

/// Resolve a compose block's `with_var` operand from the environment.
fn resolve_compose_operand(
    task_id: &str,
    spec: Option<&ComposeSpec>,
    vars: &HashMap<String, Value>,
    var_types: &HashMap<String, DataType>,
) -> Result<Option<(Value, DataType)>, ChainError> {
    let Some(spec) = spec else {
        return Ok(None);
    };
    match (vars.get(&spec.with_var), var_types.get(&spec.with_var)) {
        (Some(value), Some(data_type)) => Ok(Some((value.clone(), *data_type))),
        _ => Err(ChainError::UnknownVariable {
            task_id: task_id.to_string(),
            name: spec.with_var.clone(),
        }),
    }
}

/// Trace entry for failures that happen outside an attempt (e.g. prompt
/// template errors): the trace still explains why execution moved on.
fn record_non_attempt_failure(
    trace: &Arc<dyn ExecutionTrace>,
    task: &ChainTask,
    input_type: DataType,
    error: &str,
) {
    trace.record_step(CapturedStateUnit {
        task_id: task.id.clone(),
        task_handler: task.handler.as_str().to_string(),
        input_type,
        output_type: input_type,
        transition: String::new(),
        duration: 0,
        error: Some(error.to_string()),
        input: None,
        output: None,
    });
}

fn payload_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::definition::{
        ChainTask, ExecuteConfig, Transition, TransitionBranch, TransitionOperator,
    };
    use crate::chain::TaskHandler;
    use crate::types::chat::{ChatHistory, Message};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    // -----------------------------------------------------------------------
    // Scripted runner
    // -----------------------------------------------------------------------

    type Script = Vec<Result<TaskOutput, TaskError>>;

    /// Runner that replays a per-task script and records invocations.
    #[derive(Default)]
    struct ScriptedRunner {
        scripts: Mutex<StdHashMap<String, Script>>,
        calls: Mutex<Vec<(String, Value, DataType)>>,
    }

    impl ScriptedRunner {
        fn new() -> Self {
            Self::default()
        }

        fn script(self, task_id: &str, results: Script) -> Self {
            self.scripts
                .lock()
                .insert(task_id.to_string(), results.into_iter().rev().collect());
            self
        }

        fn calls(&self) -> Vec<(String, Value, DataType)> {
            self.calls.lock().clone()
        }
    }

    fn ok(value: Value, data_type: DataType, eval: &str) -> Result<TaskOutput, TaskError> {
        Ok(TaskOutput {
            value,
            data_type,
            transition_eval: eval.to_string(),
        })
    }

    #[async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run(
            &self,
            _cancel: &CancellationToken,
            input: TaskInput<'_>,
        ) -> Result<TaskOutput, TaskError> {
            self.calls.lock().push((
                input.task.id.clone(),
                input.value.clone(),
                input.data_type,
            ));
            self.scripts
                .lock()
                .get_mut(&input.task.id)
                .and_then(Vec::pop)
                .unwrap_or_else(|| {
                    Ok(TaskOutput {
                        value: input.value.clone(),
                        data_type: input.data_type,
                        transition_eval: "noop".to_string(),
                    })
                })
        }
    }

    // -----------------------------------------------------------------------
    // Chain builders
    // -----------------------------------------------------------------------

    fn branch(op: TransitionOperator, when: &str, goto: &str) -> TransitionBranch {
        TransitionBranch {
            operator: op,
            when: when.to_string(),
            goto: goto.to_string(),
            compose: None,
        }
    }

    fn default_to(goto: &str) -> Transition {
        Transition {
            on_failure: String::new(),
            branches: vec![branch(TransitionOperator::Default, "", goto)],
        }
    }

    fn task(id: &str, handler: TaskHandler) -> ChainTask {
        ChainTask {
            id: id.to_string(),
            handler,
            system_instruction: String::new(),
            prompt_template: String::new(),
            print: String::new(),
            output_template: String::new(),
            valid_conditions: StdHashMap::new(),
            execute_config: None,
            hook: None,
            input_var: String::new(),
            compose: None,
            transition: default_to("end"),
            timeout: String::new(),
            retry_on_failure: 0,
        }
    }

    fn chain(tasks: Vec<ChainTask>) -> ChainDefinition {
        ChainDefinition {
            id: "test-chain".to_string(),
            description: String::new(),
            debug: false,
            token_limit: 0,
            tasks,
        }
    }

    fn executor(runner: ScriptedRunner) -> (ChainExecutor, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        (
            ChainExecutor::new(Arc::clone(&runner) as Arc<dyn TaskRunner>, Inspector::default()),
            runner,
        )
    }

    async fn run(
        exec: &ChainExecutor,
        chain: &ChainDefinition,
        input: Value,
        input_type: DataType,
    ) -> Result<ChainResult, ChainFailure> {
        let cancel = CancellationToken::new();
        exec.exec_env(&cancel, chain, input, input_type).await
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_simple_prompt_chain() {
        // A single raw_string task with a rendered prompt and a default
        // branch to end.
        let mut get = task("get", TaskHandler::RawString);
        get.prompt_template = "Answer: {{.input}}".to_string();

        let runner =
            ScriptedRunner::new().script("get", vec![ok(json!("ok"), DataType::String, "ok")]);
        let (exec, runner) = executor(runner);

        let result = run(&exec, &chain(vec![get]), json!("hi"), DataType::String)
            .await
            .unwrap();

        assert_eq!(result.output, json!("ok"));
        assert_eq!(result.output_type, DataType::String);
        assert_eq!(result.trace.len(), 1);
        assert_eq!(result.trace[0].task_id, "get");
        assert!(result.trace[0].error.is_none());

        // The rendered prompt became the task input, typed string.
        let calls = runner.calls();
        assert_eq!(calls[0].1, json!("Answer: hi"));
        assert_eq!(calls[0].2, DataType::String);
    }

    #[tokio::test]
    async fn test_condition_branch_routing() {
        let mut check = task("check", TaskHandler::ConditionKey);
        check.prompt_template = "{{.input}}".to_string();
        check.valid_conditions.insert("yes".to_string(), true);
        check.transition = Transition {
            on_failure: String::new(),
            branches: vec![
                branch(TransitionOperator::Equals, "true", "a"),
                branch(TransitionOperator::Default, "", "b"),
            ],
        };
        let mut a = task("a", TaskHandler::Noop);
        a.transition = default_to("end");
        let b = task("b", TaskHandler::Noop);

        let runner = ScriptedRunner::new()
            .script("check", vec![ok(json!(true), DataType::Bool, "true")]);
        let (exec, runner) = executor(runner);

        let result = run(
            &exec,
            &chain(vec![check, a, b]),
            json!("q"),
            DataType::String,
        )
        .await
        .unwrap();

        // The equals branch matched: task `a` ran, `b` never did.
        let visited: Vec<String> = runner.calls().iter().map(|c| c.0.clone()).collect();
        assert_eq!(visited, vec!["check", "a"]);
        assert_eq!(result.output, json!(true));
        assert_eq!(result.output_type, DataType::Bool);
        assert_eq!(result.trace[0].transition, "true");
    }

    #[tokio::test]
    async fn test_in_range_routing() {
        let mut score = task("score", TaskHandler::ParseScore);
        score.prompt_template = "{{.input}}".to_string();
        score.transition = Transition {
            on_failure: String::new(),
            branches: vec![
                branch(TransitionOperator::InRange, "5-8", "pass"),
                branch(TransitionOperator::Default, "", "fail"),
            ],
        };
        let pass = task("pass", TaskHandler::Noop);
        let fail_task = task("fail", TaskHandler::Noop);

        let runner = ScriptedRunner::new()
            .script("score", vec![ok(json!(7.5), DataType::Float, "7.5")]);
        let (exec, runner) = executor(runner);

        run(
            &exec,
            &chain(vec![score, pass, fail_task]),
            json!("rate this"),
            DataType::String,
        )
        .await
        .unwrap();

        let visited: Vec<String> = runner.calls().iter().map(|c| c.0.clone()).collect();
        assert_eq!(visited, vec!["score", "pass"]);
    }

    #[tokio::test]
    async fn test_retry_then_on_failure_edge() {
        let mut flaky = task("flaky", TaskHandler::RawString);
        flaky.prompt_template = "{{.input}}".to_string();
        flaky.retry_on_failure = 2;
        flaky.transition.on_failure = "recover".to_string();
        let recover = task("recover", TaskHandler::Noop);

        let failure = || Err(TaskError::Parse("still bad".to_string()));
        let runner = ScriptedRunner::new().script("flaky", vec![failure(), failure(), failure()]);
        let (exec, runner) = executor(runner);

        let result = run(
            &exec,
            &chain(vec![flaky, recover]),
            json!("x"),
            DataType::String,
        )
        .await
        .unwrap();

        // Three attempts, each leaving an errored trace entry, then the
        // failure edge.
        let flaky_units: Vec<&CapturedStateUnit> = result
            .trace
            .iter()
            .filter(|u| u.task_id == "flaky")
            .collect();
        assert_eq!(flaky_units.len(), 3);
        assert!(flaky_units.iter().all(|u| u.error.is_some()));

        let visited: Vec<String> = runner.calls().iter().map(|c| c.0.clone()).collect();
        assert_eq!(visited, vec!["flaky", "flaky", "flaky", "recover"]);
    }

    #[tokio::test]
    async fn test_retries_stop_on_non_retryable() {
        let mut strict = task("strict", TaskHandler::ChatCompletion);
        strict.retry_on_failure = 5;

        let runner = ScriptedRunner::new().script(
            "strict",
            vec![Err(TaskError::TokenBudgetExceeded {
                used: 100,
                limit: 10,
            })],
        );
        let (exec, runner) = executor(runner);

        let failure = run(
            &exec,
            &chain(vec![strict]),
            ChatHistory::new(vec![Message::user("q")]).to_value(),
            DataType::ChatHistory,
        )
        .await
        .unwrap_err();

        assert!(matches!(failure.error, ChainError::TaskFailed { .. }));
        // Only one attempt despite five retries configured.
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(failure.trace.len(), 1);
    }

    #[tokio::test]
    async fn test_compose_append_string_to_chat_history() {
        let t1 = {
            let mut t = task("t1", TaskHandler::Noop);
            t.transition = default_to("t2");
            t
        };
        let mut t2 = task("t2", TaskHandler::Noop);
        t2.compose = Some(ComposeSpec {
            with_var: "t1".to_string(),
            strategy: "append_string_to_chat_history".to_string(),
        });

        let history = ChatHistory::new(vec![Message::user("hi")]);
        let runner = ScriptedRunner::new()
            .script("t1", vec![ok(json!("S"), DataType::String, "noop")])
            .script(
                "t2",
                vec![ok(history.to_value(), DataType::ChatHistory, "noop")],
            );
        let (exec, _) = executor(runner);

        let result = run(
            &exec,
            &chain(vec![t1, t2]),
            json!("ignored"),
            DataType::String,
        )
        .await
        .unwrap();

        assert_eq!(result.output_type, DataType::ChatHistory);
        let composed = ChatHistory::from_value(&result.output).unwrap();
        assert_eq!(composed.messages.len(), 2);
        assert_eq!(composed.messages[0].role, "system");
        assert_eq!(composed.messages[0].content, "S");
        assert_eq!(composed.messages[1].content, "hi");
        assert_eq!(composed.input_tokens, 0);
        assert_eq!(composed.output_tokens, 0);
    }

    #[tokio::test]
    async fn test_compose_unknown_variable_fails() {
        let mut t = task("t", TaskHandler::Noop);
        t.compose = Some(ComposeSpec {
            with_var: "ghost".to_string(),
            strategy: String::new(),
        });
        let (exec, runner) = executor(ScriptedRunner::new());

        let failure = run(&exec, &chain(vec![t]), json!({}), DataType::Json)
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            ChainError::UnknownVariable { ref name, .. } if name == "ghost"
        ));
        // The operand resolves before any attempt: nothing ran.
        assert!(runner.calls().is_empty());
    }

    // -----------------------------------------------------------------------
    // Variable environment
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_input_var_reads_prior_output() {
        let first = {
            let mut t = task("first", TaskHandler::Noop);
            t.transition = default_to("second");
            t
        };
        let second = {
            let mut t = task("second", TaskHandler::Noop);
            t.transition = default_to("third");
            t
        };
        let mut third = task("third", TaskHandler::Noop);
        third.input_var = "first".to_string();

        let runner = ScriptedRunner::new()
            .script("first", vec![ok(json!("from-first"), DataType::String, "noop")])
            .script("second", vec![ok(json!("from-second"), DataType::String, "noop")]);
        let (exec, runner) = executor(runner);

        run(
            &exec,
            &chain(vec![first, second, third]),
            json!("in"),
            DataType::String,
        )
        .await
        .unwrap();

        let calls = runner.calls();
        // third read `first`'s output, not the chained-through `second`.
        assert_eq!(calls[2].0, "third");
        assert_eq!(calls[2].1, json!("from-first"));
    }

    #[tokio::test]
    async fn test_unknown_input_var_fails() {
        let mut t = task("t", TaskHandler::Noop);
        t.input_var = "nope".to_string();
        let (exec, _) = executor(ScriptedRunner::new());

        let failure = run(&exec, &chain(vec![t]), json!("x"), DataType::String)
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            ChainError::UnknownVariable { ref name, .. } if name == "nope"
        ));
    }

    #[tokio::test]
    async fn test_previous_output_template_reference() {
        let first = {
            let mut t = task("first", TaskHandler::Noop);
            t.transition = default_to("second");
            t
        };
        let mut second = task("second", TaskHandler::Noop);
        second.prompt_template = "saw: {{ .previous_output }}".to_string();

        let runner = ScriptedRunner::new()
            .script("first", vec![ok(json!("alpha"), DataType::String, "noop")]);
        let (exec, runner) = executor(runner);

        run(
            &exec,
            &chain(vec![first, second]),
            json!("in"),
            DataType::String,
        )
        .await
        .unwrap();

        assert_eq!(runner.calls()[1].1, json!("saw: alpha"));
    }

    // -----------------------------------------------------------------------
    // Failure modes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_transition_unresolved() {
        let mut t = task("t", TaskHandler::Noop);
        t.transition = Transition {
            on_failure: String::new(),
            branches: vec![branch(TransitionOperator::Equals, "never", "end")],
        };
        let (exec, _) = executor(ScriptedRunner::new());

        let failure = run(&exec, &chain(vec![t]), json!("x"), DataType::String)
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            ChainError::TransitionUnresolved { .. }
        ));
        // The attempt itself succeeded and is in the trace.
        assert_eq!(failure.trace.len(), 1);
        assert!(failure.trace[0].error.is_none());
    }

    #[tokio::test]
    async fn test_task_failed_without_failure_edge() {
        let mut t = task("t", TaskHandler::RawString);
        t.prompt_template = "{{.input}}".to_string();
        let runner = ScriptedRunner::new()
            .script("t", vec![Err(TaskError::Parse("bad".to_string()))]);
        let (exec, _) = executor(runner);

        let failure = run(&exec, &chain(vec![t]), json!("x"), DataType::String)
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            ChainError::TaskFailed { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_cancellation_before_start() {
        let t = task("t", TaskHandler::Noop);
        let (exec, runner) = executor(ScriptedRunner::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = exec
            .exec_env(&cancel, &chain(vec![t]), json!("x"), DataType::String)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ChainError::Canceled { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_mid_chain_returns_partial_trace() {
        let first = {
            let mut t = task("first", TaskHandler::Noop);
            t.transition = default_to("second");
            t
        };
        let second = task("second", TaskHandler::Noop);

        // The runner cancels the chain token as a side effect of `first`.
        struct CancellingRunner {
            cancel: CancellationToken,
        }
        #[async_trait]
        impl TaskRunner for CancellingRunner {
            async fn run(
                &self,
                _cancel: &CancellationToken,
                input: TaskInput<'_>,
            ) -> Result<TaskOutput, TaskError> {
                if input.task.id == "first" {
                    self.cancel.cancel();
                }
                Ok(TaskOutput {
                    value: input.value.clone(),
                    data_type: input.data_type,
                    transition_eval: "noop".to_string(),
                })
            }
        }

        let cancel = CancellationToken::new();
        let exec = ChainExecutor::new(
            Arc::new(CancellingRunner {
                cancel: cancel.clone(),
            }),
            Inspector::default(),
        );

        let failure = exec
            .exec_env(
                &cancel,
                &chain(vec![first, second]),
                json!("x"),
                DataType::String,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            ChainError::Canceled { ref task_id } if task_id == "second"
        ));
        // Only `first` ran; its entry is the whole trace.
        assert_eq!(failure.trace.len(), 1);
        assert_eq!(failure.trace[0].task_id, "first");
    }

    #[tokio::test]
    async fn test_breakpoint_halts_with_partial_trace() {
        let first = {
            let mut t = task("first", TaskHandler::Noop);
            t.transition = default_to("second");
            t
        };
        let second = task("second", TaskHandler::Noop);

        let runner: Arc<dyn TaskRunner> = Arc::new(ScriptedRunner::new());
        let exec = ChainExecutor::new(runner, Inspector::default());
        let trace = Inspector::default().start();
        trace.set_breakpoint("second");

        let cancel = CancellationToken::new();
        let failure = exec
            .exec_with_trace(
                &cancel,
                &chain(vec![first, second]),
                json!("x"),
                DataType::String,
                trace,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            ChainError::BreakpointHit { ref task_id } if task_id == "second"
        ));
        assert_eq!(failure.trace.len(), 1);
    }

    #[tokio::test]
    async fn test_debug_chain_captures_payloads() {
        let mut t = task("t", TaskHandler::Noop);
        t.prompt_template = "p: {{.input}}".to_string();
        let mut c = chain(vec![t]);
        c.debug = true;

        let (exec, _) = executor(ScriptedRunner::new());
        let result = run(&exec, &c, json!("x"), DataType::String).await.unwrap();
        assert_eq!(result.trace[0].input.as_deref(), Some("p: x"));
        assert!(result.trace[0].output.is_some());

        // Without debug, payloads stay out of the trace.
        let mut t = task("t", TaskHandler::Noop);
        t.prompt_template = "p: {{.input}}".to_string();
        let c = chain(vec![t]);
        let (exec, _) = executor(ScriptedRunner::new());
        let result = run(&exec, &c, json!("x"), DataType::String).await.unwrap();
        assert!(result.trace[0].input.is_none());
        assert!(result.trace[0].output.is_none());
    }

    #[tokio::test]
    async fn test_noop_chain_is_identity() {
        let (exec, _) = executor(ScriptedRunner::new());
        for (value, dt) in [
            (json!("s"), DataType::String),
            (json!(3), DataType::Int),
            (json!({"k": [1, 2]}), DataType::Json),
        ] {
            let result = run(
                &exec,
                &chain(vec![task("only", TaskHandler::Noop)]),
                value.clone(),
                dt,
            )
            .await
            .unwrap();
            assert_eq!(result.output, value);
            assert_eq!(result.output_type, dt);
        }
    }

    #[tokio::test]
    async fn test_empty_chain_rejected() {
        let (exec, _) = executor(ScriptedRunner::new());
        let failure = run(&exec, &chain(vec![]), json!("x"), DataType::String)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ChainError::ChainEmpty(_)));
        assert!(failure.trace.is_empty());
    }

    #[tokio::test]
    async fn test_per_attempt_timeout() {
        struct SlowRunner;
        #[async_trait]
        impl TaskRunner for SlowRunner {
            async fn run(
                &self,
                cancel: &CancellationToken,
                _input: TaskInput<'_>,
            ) -> Result<TaskOutput, TaskError> {
                tokio::select! {
                    _ = cancel.cancelled() => Err(TaskError::Canceled),
                    _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {
                        Ok(TaskOutput {
                            value: Value::Null,
                            data_type: DataType::Any,
                            transition_eval: String::new(),
                        })
                    }
                }
            }
        }

        let mut t = task("slow", TaskHandler::Noop);
        t.timeout = "10ms".to_string();
        let exec = ChainExecutor::new(Arc::new(SlowRunner), Inspector::default());
        let cancel = CancellationToken::new();

        let failure = exec
            .exec_env(&cancel, &chain(vec![t]), json!("x"), DataType::String)
            .await
            .unwrap_err();
        match failure.error {
            ChainError::TaskFailed { source, .. } => {
                assert!(matches!(source, TaskError::Timeout))
            }
            other => panic!("expected TaskFailed, got {:?}", other),
        }
        assert_eq!(failure.trace.len(), 1);
        assert!(failure.trace[0].error.is_some());
    }

    #[tokio::test]
    async fn test_execute_config_survives_to_runner() {
        // The executor hands the task through untouched; the runner sees
        // its execute_config.
        let mut t = task("t", TaskHandler::RawString);
        t.prompt_template = "{{.input}}".to_string();
        t.execute_config = Some(ExecuteConfig {
            model: "m1".to_string(),
            ..Default::default()
        });

        struct AssertingRunner;
        #[async_trait]
        impl TaskRunner for AssertingRunner {
            async fn run(
                &self,
                _cancel: &CancellationToken,
                input: TaskInput<'_>,
            ) -> Result<TaskOutput, TaskError> {
                assert_eq!(
                    input.task.execute_config.as_ref().unwrap().model,
                    "m1"
                );
                Ok(TaskOutput {
                    value: json!("done"),
                    data_type: DataType::String,
                    transition_eval: "done".to_string(),
                })
            }
        }

        let exec = ChainExecutor::new(Arc::new(AssertingRunner), Inspector::default());
        let cancel = CancellationToken::new();
        exec.exec_env(&cancel, &chain(vec![t]), json!("x"), DataType::String)
            .await
            .unwrap();
    }
}
