//! Template rendering over the chain variable environment.
//!
//! Templates use the `{{ .name }}` / `{{ .name.field.sub }}` form: a leading
//! dot selects a variable, further dots descend into JSON object fields.
//! Rendering is pure; a fixed environment yields byte-identical output.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// Malformed template text (unclosed braces, bad field path).
    #[error("template parse error: {0}")]
    Parse(String),
    /// The root variable of a reference is absent from the environment.
    #[error("unknown variable {0:?}")]
    UnknownVariable(String),
    /// The path resolved into a value that has no such field.
    #[error("template execution error: {0}")]
    Execution(String),
}

/// Render `template` against `vars`, substituting every `{{ .path }}`.
pub fn render(template: &str, vars: &HashMap<String, Value>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or_else(|| TemplateError::Parse("unclosed {{".to_string()))?;
        let expr = after_open[..close].trim();
        out.push_str(&resolve(expr, vars)?);
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolve a single `.a.b.c` expression to its rendered form.
fn resolve(expr: &str, vars: &HashMap<String, Value>) -> Result<String, TemplateError> {
    let path = expr
        .strip_prefix('.')
        .ok_or_else(|| TemplateError::Parse(format!("reference {:?} must start with '.'", expr)))?;
    if path.is_empty() {
        return Err(TemplateError::Parse("empty variable reference".to_string()));
    }

    let mut segments = path.split('.');
    let root = segments.next().unwrap_or_default();
    if !is_valid_segment(root) {
        return Err(TemplateError::Parse(format!("bad variable name {:?}", root)));
    }

    let mut current = vars
        .get(root)
        .ok_or_else(|| TemplateError::UnknownVariable(root.to_string()))?;

    for segment in segments {
        if !is_valid_segment(segment) {
            return Err(TemplateError::Parse(format!("bad field name {:?}", segment)));
        }
        current = current.get(segment).ok_or_else(|| {
            TemplateError::Execution(format!("value at {:?} has no field {:?}", root, segment))
        })?;
    }

    Ok(render_value(current))
}

fn is_valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Strings render bare; scalars use their display form; structures render
/// as compact JSON.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_render_plain_text() {
        let vars = env(&[]);
        assert_eq!(render("no references", &vars).unwrap(), "no references");
    }

    #[test]
    fn test_render_simple_substitution() {
        let vars = env(&[("input", json!("hi"))]);
        assert_eq!(
            render("Answer: {{ .input }}", &vars).unwrap(),
            "Answer: hi"
        );
        assert_eq!(render("{{.input}}", &vars).unwrap(), "hi");
    }

    #[test]
    fn test_render_nested_fields() {
        let vars = env(&[("lookup", json!({"user": {"name": "ada"}}))]);
        assert_eq!(
            render("hello {{ .lookup.user.name }}", &vars).unwrap(),
            "hello ada"
        );
    }

    #[test]
    fn test_render_scalars_and_structures() {
        let vars = env(&[
            ("n", json!(7)),
            ("flag", json!(true)),
            ("obj", json!({"a": 1})),
        ]);
        assert_eq!(render("{{ .n }}/{{ .flag }}", &vars).unwrap(), "7/true");
        assert_eq!(render("{{ .obj }}", &vars).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_render_unknown_variable() {
        let vars = env(&[]);
        assert_eq!(
            render("{{ .missing }}", &vars),
            Err(TemplateError::UnknownVariable("missing".to_string()))
        );
    }

    #[test]
    fn test_render_missing_field_is_execution_error() {
        let vars = env(&[("obj", json!({"a": 1}))]);
        assert!(matches!(
            render("{{ .obj.b }}", &vars),
            Err(TemplateError::Execution(_))
        ));
    }

    #[test]
    fn test_render_unclosed_braces() {
        let vars = env(&[("input", json!("x"))]);
        assert!(matches!(
            render("{{ .input", &vars),
            Err(TemplateError::Parse(_))
        ));
    }

    #[test]
    fn test_render_requires_leading_dot() {
        let vars = env(&[("input", json!("x"))]);
        assert!(matches!(
            render("{{ input }}", &vars),
            Err(TemplateError::Parse(_))
        ));
    }

    #[test]
    fn test_render_deterministic() {
        let vars = env(&[("input", json!({"k": [1, 2, 3]}))]);
        let a = render("{{ .input }}", &vars).unwrap();
        let b = render("{{ .input }}", &vars).unwrap();
        assert_eq!(a, b);
    }
}
