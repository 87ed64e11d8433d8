//! Pure parsers for model output.
//!
//! Models answer in prose; these parsers pull the structured kernel out of
//! it. They are deliberately lenient about whitespace, quotes and
//! surrounding noise, and strict about the actual payload.

use serde_json::{Map, Number, Value};

use crate::chain::transition::parse_number;
use crate::types::chat::ChatHistory;
use crate::types::openai::ChatCompletionRequest;
use crate::types::DataType;

/// Unify an incoming value into a prompt string per the handler table.
pub fn unify_prompt(value: &Value, data_type: DataType) -> Result<String, String> {
    match data_type {
        DataType::String => value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "string value does not hold a string".to_string()),
        DataType::Int | DataType::Float => match value {
            Value::Number(n) => Ok(n.to_string()),
            other => Err(format!("numeric value holds {:?}", other)),
        },
        DataType::Bool => match value {
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(format!("bool value holds {:?}", other)),
        },
        DataType::ChatHistory => {
            let history =
                ChatHistory::from_value(value).map_err(|e| format!("bad chat history: {}", e))?;
            history
                .last_message()
                .map(|m| m.content.clone())
                .ok_or_else(|| "chat history has no messages".to_string())
        }
        DataType::OpenaiChat => {
            let request: ChatCompletionRequest = serde_json::from_value(value.clone())
                .map_err(|e| format!("bad chat request: {}", e))?;
            request
                .messages
                .last()
                .map(|m| m.content.clone())
                .ok_or_else(|| "chat request has no messages".to_string())
        }
        other => Err(format!("no prompt form for {}", other)),
    }
}

/// Parse an integral number. Fractional parts must be exactly zero.
pub fn parse_integer(s: &str) -> Result<i64, String> {
    let n = parse_number(s).ok_or_else(|| format!("no number in {:?}", s))?;
    if n.fract() != 0.0 {
        return Err(format!("{} is not integral", n));
    }
    Ok(n as i64)
}

/// Parse a floating-point score.
pub fn parse_score(s: &str) -> Result<f64, String> {
    parse_number(s).ok_or_else(|| format!("no number in {:?}", s))
}

/// Normalise a range answer: `N` becomes `N-N`, `lo-hi` keeps both bounds.
pub fn normalize_range(s: &str) -> Result<String, String> {
    static RANGE_NUMBER: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"\d*\.?\d+").expect("range regex"));
    let trimmed = s.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    let numbers: Vec<&str> = RANGE_NUMBER
        .find_iter(trimmed)
        .map(|m| m.as_str())
        .collect();
    match numbers.as_slice() {
        [single] => Ok(format!("{}-{}", single, single)),
        [lo, hi, ..] => Ok(format!("{}-{}", lo, hi)),
        [] => Err(format!("no range in {:?}", s)),
    }
}

/// Coerce a bare scalar token: booleans and numbers become typed, the rest
/// stays a string.
fn coerce_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
    if let Some(inner) = unquoted {
        return Value::String(inner.to_string());
    }
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(i));
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(trimmed.to_string())
}

/// Parse a delimited key-value blob into a JSON object. Pairs split on
/// commas, semicolons or newlines; keys and values split on the first `=`
/// or `:`.
pub fn parse_key_value(s: &str) -> Result<Value, String> {
    let mut out = Map::new();
    for pair in s.split(|c| c == ',' || c == ';' || c == '\n') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let split_at = pair
            .find(|c| c == '=' || c == ':')
            .ok_or_else(|| format!("no key-value separator in {:?}", pair))?;
        let key = pair[..split_at]
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .to_string();
        if key.is_empty() {
            return Err(format!("empty key in {:?}", pair));
        }
        let value = coerce_scalar(&pair[split_at + 1..]);
        out.insert(key, value);
    }
    if out.is_empty() {
        return Err(format!("no pairs in {:?}", s));
    }
    Ok(Value::Object(out))
}

/// Split a `/transition` prefix off a response: `"/approve rest"` →
/// `Some("approve")`.
pub fn parse_transition_command(s: &str) -> Option<String> {
    let stripped = s.trim_start().strip_prefix('/')?;
    let token = stripped.split_whitespace().next().unwrap_or_default();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::chat::Message;
    use serde_json::json;

    #[test]
    fn test_unify_prompt_scalars() {
        assert_eq!(unify_prompt(&json!("hi"), DataType::String).unwrap(), "hi");
        assert_eq!(unify_prompt(&json!(42), DataType::Int).unwrap(), "42");
        assert_eq!(unify_prompt(&json!(2.5), DataType::Float).unwrap(), "2.5");
        assert_eq!(unify_prompt(&json!(true), DataType::Bool).unwrap(), "true");
    }

    #[test]
    fn test_unify_prompt_chat_history_last_message() {
        let history = ChatHistory::new(vec![Message::user("first"), Message::assistant("last")]);
        assert_eq!(
            unify_prompt(&history.to_value(), DataType::ChatHistory).unwrap(),
            "last"
        );
    }

    #[test]
    fn test_unify_prompt_openai_chat() {
        let request = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "question"}]
        });
        assert_eq!(
            unify_prompt(&request, DataType::OpenaiChat).unwrap(),
            "question"
        );
    }

    #[test]
    fn test_unify_prompt_rejects_vector() {
        assert!(unify_prompt(&json!([1.0]), DataType::Vector).is_err());
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer("42").unwrap(), 42);
        assert_eq!(parse_integer(" \"7\" ").unwrap(), 7);
        assert_eq!(parse_integer("answer: 3").unwrap(), 3);
        assert!(parse_integer("2.5").is_err());
        assert!(parse_integer("none").is_err());
    }

    #[test]
    fn test_normalize_range() {
        assert_eq!(normalize_range("5").unwrap(), "5-5");
        assert_eq!(normalize_range("5-8").unwrap(), "5-8");
        assert_eq!(normalize_range(" 5 - 8 ").unwrap(), "5-8");
        assert_eq!(normalize_range("7.5").unwrap(), "7.5-7.5");
        assert!(normalize_range("wide open").is_err());
    }

    #[test]
    fn test_parse_key_value_delimiters_and_coercion() {
        let parsed = parse_key_value("a=1, b: true; c=\"quoted\"\nd: 2.5").unwrap();
        assert_eq!(parsed["a"], 1);
        assert_eq!(parsed["b"], true);
        assert_eq!(parsed["c"], "quoted");
        assert_eq!(parsed["d"], 2.5);
    }

    #[test]
    fn test_parse_key_value_rejects_garbage() {
        assert!(parse_key_value("no separator here").is_err());
        assert!(parse_key_value("").is_err());
    }

    #[test]
    fn test_parse_transition_command() {
        assert_eq!(
            parse_transition_command("/approve and continue").as_deref(),
            Some("approve")
        );
        assert_eq!(parse_transition_command("plain answer"), None);
        assert_eq!(parse_transition_command("/"), None);
    }
}
