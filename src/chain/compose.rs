//! Compose strategies: merging a task's output with another variable.
//!
//! The left operand is always the task's flowing output; the right operand
//! is the value named by `with_var`. Strategies are pure over their inputs
//! apart from the timestamp on a freshly minted system message.

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::types::chat::{ChatHistory, Message};
use crate::types::DataType;

pub const STRATEGY_OVERRIDE: &str = "override";
pub const STRATEGY_APPEND_STRING: &str = "append_string_to_chat_history";
pub const STRATEGY_MERGE_HISTORIES: &str = "merge_chat_histories";

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("unsupported compose strategy {0:?}")]
    UnsupportedStrategy(String),
    #[error("compose operands have unsuitable types: {0}")]
    TypeMismatch(String),
    #[error("compose operand is not decodable: {0}")]
    Decode(String),
}

/// Pick the effective strategy when the block names none: chat
/// histories merge, everything else overrides.
pub fn resolve_strategy(strategy: &str, left: DataType, right: DataType) -> String {
    if !strategy.is_empty() {
        return strategy.to_string();
    }
    if left == DataType::ChatHistory && right == DataType::ChatHistory {
        STRATEGY_MERGE_HISTORIES.to_string()
    } else {
        STRATEGY_OVERRIDE.to_string()
    }
}

/// Apply a compose strategy to `(left, right)` and return the composed
/// value with its type.
pub fn compose(
    strategy: &str,
    left: &Value,
    left_type: DataType,
    right: &Value,
    right_type: DataType,
) -> Result<(Value, DataType), ComposeError> {
    let strategy = resolve_strategy(strategy, left_type, right_type);
    match strategy.as_str() {
        STRATEGY_OVERRIDE => override_merge(left, right),
        STRATEGY_APPEND_STRING => append_string(left, left_type, right, right_type),
        STRATEGY_MERGE_HISTORIES => merge_histories(left, left_type, right, right_type),
        other => Err(ComposeError::UnsupportedStrategy(other.to_string())),
    }
}

/// Deep-merge two JSON objects, right side winning on conflicts.
fn override_merge(left: &Value, right: &Value) -> Result<(Value, DataType), ComposeError> {
    let (Value::Object(l), Value::Object(r)) = (left, right) else {
        return Err(ComposeError::TypeMismatch(
            "override requires JSON objects on both sides".to_string(),
        ));
    };
    let mut merged = l.clone();
    deep_merge(&mut merged, r);
    Ok((Value::Object(merged), DataType::Json))
}

fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(b)), Value::Object(o)) => deep_merge(b, o),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Prepend a string as a system message onto a chat history. The operands
/// may arrive in either order; token counters reset, the model rides along
/// from the history side.
fn append_string(
    left: &Value,
    left_type: DataType,
    right: &Value,
    right_type: DataType,
) -> Result<(Value, DataType), ComposeError> {
    let (text, history_value) = match (left_type, right_type) {
        (DataType::String, DataType::ChatHistory) => (left, right),
        (DataType::ChatHistory, DataType::String) => (right, left),
        _ => {
            return Err(ComposeError::TypeMismatch(format!(
                "append_string_to_chat_history needs a string and a chat_history, got {} and {}",
                left_type, right_type
            )))
        }
    };
    let text = text.as_str().ok_or_else(|| {
        ComposeError::Decode("string operand does not hold a string".to_string())
    })?;
    let history = ChatHistory::from_value(history_value)
        .map_err(|e| ComposeError::Decode(e.to_string()))?;

    let mut messages = Vec::with_capacity(history.messages.len() + 1);
    messages.push(Message {
        id: Uuid::new_v4().to_string(),
        role: "system".to_string(),
        content: text.to_string(),
        tool_call_id: None,
        call_tools: Vec::new(),
        timestamp: Utc::now(),
    });
    messages.extend(history.messages);

    let composed = ChatHistory {
        messages,
        model: history.model,
        input_tokens: 0,
        output_tokens: 0,
    };
    Ok((composed.to_value(), DataType::ChatHistory))
}

/// Concatenate two histories as `right ++ left`, summing token counters.
/// The model is retained only when both sides agree.
fn merge_histories(
    left: &Value,
    left_type: DataType,
    right: &Value,
    right_type: DataType,
) -> Result<(Value, DataType), ComposeError> {
    if left_type != DataType::ChatHistory || right_type != DataType::ChatHistory {
        return Err(ComposeError::TypeMismatch(format!(
            "merge_chat_histories needs chat_history on both sides, got {} and {}",
            left_type, right_type
        )));
    }
    let l = ChatHistory::from_value(left).map_err(|e| ComposeError::Decode(e.to_string()))?;
    let r = ChatHistory::from_value(right).map_err(|e| ComposeError::Decode(e.to_string()))?;

    let mut messages = Vec::with_capacity(l.messages.len() + r.messages.len());
    messages.extend(r.messages);
    messages.extend(l.messages);

    // Retained only when both sides agree; an empty side counts as a
    // disagreement with a named one.
    let model = if l.model == r.model {
        l.model
    } else {
        String::new()
    };

    let composed = ChatHistory {
        messages,
        model,
        input_tokens: l.input_tokens + r.input_tokens,
        output_tokens: l.output_tokens + r.output_tokens,
    };
    Ok((composed.to_value(), DataType::ChatHistory))
}
