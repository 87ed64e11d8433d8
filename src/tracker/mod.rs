//! Structured activity events around suspension points.
//!
//! Every outbound call (model, hook, store, bus) opens a span-like
//! activity and closes it with an outcome. Attributes are ordered
//! key-value pairs so a span can carry several pieces of context (model
//! name, task id, backend id). The default tracker logs; tests use the
//! recording tracker to assert what ran.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// Open/close surface for one activity.
pub trait ActivitySpan: Send {
    fn end_ok(self: Box<Self>);
    fn end_error(self: Box<Self>, message: &str);
}

/// Factory for activity spans.
pub trait ActivityTracker: Send + Sync {
    /// Start an activity of `kind` (e.g. `"model_call"`, `"hook"`) with
    /// the given attributes.
    fn start(&self, kind: &str, attrs: &[(&str, &str)]) -> Box<dyn ActivitySpan>;
}

fn format_attrs(attrs: &[(&str, &str)]) -> String {
    attrs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Logging tracker (default)
// ---------------------------------------------------------------------------

/// Emits one debug line on start and one on end with the elapsed time.
#[derive(Debug, Default, Clone)]
pub struct LogTracker;

struct LogSpan {
    kind: String,
    attrs: String,
    started: Instant,
}

impl ActivitySpan for LogSpan {
    fn end_ok(self: Box<Self>) {
        log::debug!(
            "activity {} [{}] finished in {:?}",
            self.kind,
            self.attrs,
            self.started.elapsed()
        );
    }

    fn end_error(self: Box<Self>, message: &str) {
        log::warn!(
            "activity {} [{}] failed after {:?}: {}",
            self.kind,
            self.attrs,
            self.started.elapsed(),
            message
        );
    }
}

impl ActivityTracker for LogTracker {
    fn start(&self, kind: &str, attrs: &[(&str, &str)]) -> Box<dyn ActivitySpan> {
        let attrs = format_attrs(attrs);
        log::debug!("activity {} [{}] started", kind, attrs);
        Box::new(LogSpan {
            kind: kind.to_string(),
            attrs,
            started: Instant::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Noop tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct NoopTracker;

struct NoopSpan;

impl ActivitySpan for NoopSpan {
    fn end_ok(self: Box<Self>) {}
    fn end_error(self: Box<Self>, _message: &str) {}
}

impl ActivityTracker for NoopTracker {
    fn start(&self, _kind: &str, _attrs: &[(&str, &str)]) -> Box<dyn ActivitySpan> {
        Box::new(NoopSpan)
    }
}

// ---------------------------------------------------------------------------
// Recording tracker (tests)
// ---------------------------------------------------------------------------

/// A finished activity as seen by the recording tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    pub kind: String,
    pub attrs: Vec<(String, String)>,
    pub outcome: ActivityOutcome,
}

impl ActivityRecord {
    /// Look an attribute up by key.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityOutcome {
    Ok,
    Error(String),
}

/// Collects finished activities for assertions.
#[derive(Debug, Default, Clone)]
pub struct RecordingTracker {
    records: Arc<Mutex<Vec<ActivityRecord>>>,
}

struct RecordingSpan {
    kind: String,
    attrs: Vec<(String, String)>,
    records: Arc<Mutex<Vec<ActivityRecord>>>,
}

impl ActivitySpan for RecordingSpan {
    fn end_ok(self: Box<Self>) {
        self.records.lock().push(ActivityRecord {
            kind: self.kind,
            attrs: self.attrs,
            outcome: ActivityOutcome::Ok,
        });
    }

    fn end_error(self: Box<Self>, message: &str) {
        self.records.lock().push(ActivityRecord {
            kind: self.kind,
            attrs: self.attrs,
            outcome: ActivityOutcome::Error(message.to_string()),
        });
    }
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ActivityRecord> {
        self.records.lock().clone()
    }
}

impl ActivityTracker for RecordingTracker {
    fn start(&self, kind: &str, attrs: &[(&str, &str)]) -> Box<dyn ActivitySpan> {
        Box::new(RecordingSpan {
            kind: kind.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            records: Arc::clone(&self.records),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_tracker_collects_outcomes() {
        let tracker = RecordingTracker::new();
        tracker
            .start("model_call", &[("model", "m1"), ("task", "t1")])
            .end_ok();
        tracker
            .start("hook", &[("hook", "notify")])
            .end_error("timeout");

        let records = tracker.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, ActivityOutcome::Ok);
        assert_eq!(records[0].attr("model"), Some("m1"));
        assert_eq!(records[0].attr("task"), Some("t1"));
        assert_eq!(
            records[1].outcome,
            ActivityOutcome::Error("timeout".to_string())
        );
        assert_eq!(records[1].attr("hook"), Some("notify"));
        assert_eq!(records[1].attr("missing"), None);
    }

    #[test]
    fn test_format_attrs() {
        assert_eq!(format_attrs(&[]), "");
        assert_eq!(
            format_attrs(&[("model", "m"), ("task", "t")]),
            "model=m task=t"
        );
    }
}
