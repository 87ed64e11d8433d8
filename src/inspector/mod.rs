//! Execution tracing and breakpoint gating.
//!
//! Every task attempt, successful or not, is recorded as a
//! [`CapturedStateUnit`]. The executor consults the same trace object for
//! breakpoints before entering a task. Traces may be buffered (the default
//! for the HTTP surface, which returns them) or disabled entirely.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::DataType;

/// One recorded task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedStateUnit {
    pub task_id: String,
    pub task_handler: String,
    pub input_type: DataType,
    pub output_type: DataType,
    /// The transition-eval string the attempt produced (empty on failure).
    #[serde(default)]
    pub transition: String,
    /// Attempt duration in milliseconds.
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Verbatim input payload; only populated for debug chains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Verbatim output payload; only populated for debug chains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Recording surface handed to the chain executor for one invocation.
pub trait ExecutionTrace: Send + Sync {
    fn record_step(&self, unit: CapturedStateUnit);
    fn get_execution_history(&self) -> Vec<CapturedStateUnit>;
    fn has_breakpoint(&self, task_id: &str) -> bool;
    fn set_breakpoint(&self, task_id: &str);
    fn clear_breakpoints(&self);
    /// The task currently executing, if any.
    fn get_current_state(&self) -> Option<String>;
    fn set_current_state(&self, task_id: &str);
}

/// Buffered trace: keeps the full history in memory.
#[derive(Default)]
pub struct BufferedTrace {
    steps: Mutex<Vec<CapturedStateUnit>>,
    breakpoints: Mutex<HashSet<String>>,
    current: Mutex<Option<String>>,
}

impl BufferedTrace {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionTrace for BufferedTrace {
    fn record_step(&self, unit: CapturedStateUnit) {
        self.steps.lock().push(unit);
    }

    fn get_execution_history(&self) -> Vec<CapturedStateUnit> {
        self.steps.lock().clone()
    }

    fn has_breakpoint(&self, task_id: &str) -> bool {
        self.breakpoints.lock().contains(task_id)
    }

    fn set_breakpoint(&self, task_id: &str) {
        self.breakpoints.lock().insert(task_id.to_string());
    }

    fn clear_breakpoints(&self) {
        self.breakpoints.lock().clear();
    }

    fn get_current_state(&self) -> Option<String> {
        self.current.lock().clone()
    }

    fn set_current_state(&self, task_id: &str) {
        *self.current.lock() = Some(task_id.to_string());
    }
}

/// Trace that records nothing and never gates.
#[derive(Default)]
pub struct NoopTrace;

impl ExecutionTrace for NoopTrace {
    fn record_step(&self, _unit: CapturedStateUnit) {}
    fn get_execution_history(&self) -> Vec<CapturedStateUnit> {
        Vec::new()
    }
    fn has_breakpoint(&self, _task_id: &str) -> bool {
        false
    }
    fn set_breakpoint(&self, _task_id: &str) {}
    fn clear_breakpoints(&self) {}
    fn get_current_state(&self) -> Option<String> {
        None
    }
    fn set_current_state(&self, _task_id: &str) {}
}

/// Factory for per-invocation traces.
#[derive(Debug, Clone)]
pub struct Inspector {
    recording: bool,
}

impl Default for Inspector {
    fn default() -> Self {
        Self { recording: true }
    }
}

impl Inspector {
    pub fn new(recording: bool) -> Self {
        Self { recording }
    }

    /// Start a fresh trace for one chain invocation.
    pub fn start(&self) -> Arc<dyn ExecutionTrace> {
        if self.recording {
            Arc::new(BufferedTrace::new())
        } else {
            Arc::new(NoopTrace)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(task_id: &str) -> CapturedStateUnit {
        CapturedStateUnit {
            task_id: task_id.to_string(),
            task_handler: "noop".to_string(),
            input_type: DataType::String,
            output_type: DataType::String,
            transition: "noop".to_string(),
            duration: 1,
            error: None,
            input: None,
            output: None,
        }
    }

    #[test]
    fn test_buffered_trace_records_in_order() {
        let trace = BufferedTrace::new();
        trace.record_step(unit("a"));
        trace.record_step(unit("b"));
        let history = trace.get_execution_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].task_id, "a");
        assert_eq!(history[1].task_id, "b");
    }

    #[test]
    fn test_breakpoints() {
        let trace = BufferedTrace::new();
        assert!(!trace.has_breakpoint("a"));
        trace.set_breakpoint("a");
        assert!(trace.has_breakpoint("a"));
        trace.clear_breakpoints();
        assert!(!trace.has_breakpoint("a"));
    }

    #[test]
    fn test_current_state() {
        let trace = BufferedTrace::new();
        assert_eq!(trace.get_current_state(), None);
        trace.set_current_state("score");
        assert_eq!(trace.get_current_state().as_deref(), Some("score"));
    }

    #[test]
    fn test_inspector_disabled_returns_noop() {
        let trace = Inspector::new(false).start();
        trace.record_step(unit("a"));
        trace.set_breakpoint("a");
        assert!(trace.get_execution_history().is_empty());
        assert!(!trace.has_breakpoint("a"));
    }
}
