//! OpenAPI-protocol hook execution.
//!
//! The hook's `endpoint_url` serves the OpenAPI 3.0 document. Execution
//! fetches the document, finds the operation whose `operationId`,
//! `x-tool-name` or derived name (`GET /users/{id}` → `get_users_id`)
//! matches the requested tool, places the merged arguments into path,
//! query, header or body positions per the operation's parameter
//! declarations, and sends the described request.
//!
//! This is intentionally minimal — enough to drive real-world specs, not
//! full OpenAPI compliance.

use std::time::Duration;

use serde_json::{Map, Value};

use super::{HookError, RemoteHookDef};
use crate::providers::excerpt;

const METHODS: [&str; 5] = ["get", "post", "put", "patch", "delete"];

/// A located operation: enough to build the HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub method: String,
    pub path: String,
    pub parameters: Vec<ParameterSpec>,
    pub has_request_body: bool,
}

/// Where one declared parameter travels.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub location: ParameterLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterLocation {
    Path,
    Query,
    Header,
}

impl ParameterLocation {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "path" => Some(ParameterLocation::Path),
            "query" => Some(ParameterLocation::Query),
            "header" => Some(ParameterLocation::Header),
            _ => None,
        }
    }
}

/// `GET /users/{id}` → `get_users_id`.
pub fn derive_operation_name(method: &str, path: &str) -> String {
    let cleaned: String = path
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let collapsed = cleaned
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    format!("{}_{}", method.to_ascii_lowercase(), collapsed)
}

/// Find the operation matching `tool_name` in a parsed document.
pub fn find_operation(doc: &Value, tool_name: &str) -> Option<Operation> {
    let paths = doc.get("paths")?.as_object()?;
    for (path, path_item) in paths {
        let path_obj = path_item.as_object()?;
        for method in METHODS {
            let Some(op) = path_obj.get(method) else {
                continue;
            };
            let operation_id = op.get("operationId").and_then(Value::as_str);
            let x_tool_name = op.get("x-tool-name").and_then(Value::as_str);
            let derived = derive_operation_name(method, path);
            let matches = operation_id == Some(tool_name)
                || x_tool_name == Some(tool_name)
                || derived == tool_name;
            if !matches {
                continue;
            }

            let mut parameters = Vec::new();
            // Path-level parameters apply to every operation under the path.
            for source in [path_obj.get("parameters"), op.get("parameters")] {
                let Some(params) = source.and_then(Value::as_array) else {
                    continue;
                };
                for param in params {
                    let Some(name) = param.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let Some(location) = param
                        .get("in")
                        .and_then(Value::as_str)
                        .and_then(ParameterLocation::parse)
                    else {
                        continue;
                    };
                    if parameters.iter().any(|p: &ParameterSpec| p.name == name) {
                        continue;
                    }
                    parameters.push(ParameterSpec {
                        name: name.to_string(),
                        location,
                    });
                }
            }

            return Some(Operation {
                method: method.to_string(),
                path: path.clone(),
                parameters,
                has_request_body: op.get("requestBody").is_some(),
            });
        }
    }
    None
}

/// Base URL for operations: the document's first server when absolute,
/// else the origin of the document URL itself.
pub fn resolve_base_url(doc: &Value, document_url: &str) -> Result<String, HookError> {
    if let Some(server) = doc
        .get("servers")
        .and_then(Value::as_array)
        .and_then(|s| s.first())
        .and_then(|s| s.get("url"))
        .and_then(Value::as_str)
    {
        if server.starts_with("http://") || server.starts_with("https://") {
            return Ok(server.trim_end_matches('/').to_string());
        }
        // Relative server: resolve against the document origin.
        let parsed = reqwest::Url::parse(document_url)
            .map_err(|e| HookError::Protocol(format!("bad document URL: {}", e)))?;
        let origin = format!(
            "{}://{}",
            parsed.scheme(),
            parsed
                .host_str()
                .map(|h| match parsed.port() {
                    Some(p) => format!("{}:{}", h, p),
                    None => h.to_string(),
                })
                .unwrap_or_default()
        );
        return Ok(format!("{}{}", origin, server.trim_end_matches('/')));
    }

    let parsed = reqwest::Url::parse(document_url)
        .map_err(|e| HookError::Protocol(format!("bad document URL: {}", e)))?;
    let origin = format!(
        "{}://{}",
        parsed.scheme(),
        parsed
            .host_str()
            .map(|h| match parsed.port() {
                Some(p) => format!("{}:{}", h, p),
                None => h.to_string(),
            })
            .unwrap_or_default()
    );
    Ok(origin)
}

/// Render an argument value for a path/query/header position.
fn render_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Split merged arguments across the operation's positions. Returns
/// `(url, headers, body)`.
pub fn place_arguments(
    base_url: &str,
    operation: &Operation,
    args: &Value,
) -> Result<(String, Vec<(String, String)>, Option<Value>), HookError> {
    let empty = Map::new();
    let args_obj = args.as_object().unwrap_or(&empty);

    let mut path = operation.path.clone();
    let mut query: Vec<(String, String)> = Vec::new();
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut consumed: Vec<&str> = Vec::new();

    for param in &operation.parameters {
        let Some(value) = args_obj.get(&param.name) else {
            continue;
        };
        let rendered = render_arg(value);
        consumed.push(param.name.as_str());
        match param.location {
            ParameterLocation::Path => {
                path = path.replace(&format!("{{{}}}", param.name), &rendered);
            }
            ParameterLocation::Query => query.push((param.name.clone(), rendered)),
            ParameterLocation::Header => headers.push((param.name.clone(), rendered)),
        }
    }

    if path.contains('{') {
        return Err(HookError::Protocol(format!(
            "unfilled path parameter in {:?}",
            path
        )));
    }

    let mut url = format!("{}{}", base_url, path);
    if !query.is_empty() {
        let qs: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect();
        url = format!("{}?{}", url, qs.join("&"));
    }

    // Everything not consumed by a declared parameter travels in the body.
    let body = if operation.has_request_body {
        let remaining: Map<String, Value> = args_obj
            .iter()
            .filter(|(k, _)| !consumed.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(Value::Object(remaining))
    } else {
        None
    };

    Ok((url, headers, body))
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Execute an `openapi`-protocol hook end to end.
pub async fn exec_operation(
    http: &reqwest::Client,
    def: &RemoteHookDef,
    tool_name: &str,
    merged_args: &Value,
    timeout: Duration,
) -> Result<Value, HookError> {
    // Fetch the document.
    let doc_resp = tokio::time::timeout(timeout, http.get(&def.endpoint_url).send())
        .await
        .map_err(|_| HookError::Timeout(def.timeout_ms))?
        .map_err(|e| HookError::Transport(e.to_string()))?;
    let doc_status = doc_resp.status();
    let doc_text = doc_resp
        .text()
        .await
        .map_err(|e| HookError::Transport(e.to_string()))?;
    if !doc_status.is_success() {
        return Err(HookError::Http {
            status: doc_status.as_u16(),
            body: excerpt(&doc_text),
        });
    }
    let doc: Value = serde_json::from_str(&doc_text)
        .map_err(|e| HookError::Protocol(format!("document is not JSON: {}", e)))?;

    let operation = find_operation(&doc, tool_name)
        .ok_or_else(|| HookError::Protocol(format!("no operation matches {:?}", tool_name)))?;
    let base_url = resolve_base_url(&doc, &def.endpoint_url)?;
    let (url, headers, body) = place_arguments(&base_url, &operation, merged_args)?;

    let method = reqwest::Method::from_bytes(operation.method.to_uppercase().as_bytes())
        .map_err(|_| HookError::Protocol(format!("bad method {:?}", operation.method)))?;

    let mut request = http.request(method, &url);
    for (key, value) in &def.headers {
        request = request.header(key, value);
    }
    for (key, value) in headers {
        request = request.header(key, value);
    }
    if let Some(body) = body {
        request = request
            .header("Content-Type", "application/json")
            .json(&body);
    }

    let response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| HookError::Timeout(def.timeout_ms))?
        .map_err(|e| HookError::Transport(e.to_string()))?;
    let status = response.status();
    let is_json = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("json"))
        .unwrap_or(false);
    let text = response
        .text()
        .await
        .map_err(|e| HookError::Transport(e.to_string()))?;

    if !status.is_success() {
        return Err(HookError::Http {
            status: status.as_u16(),
            body: excerpt(&text),
        });
    }

    if is_json {
        serde_json::from_str(&text)
            .map_err(|e| HookError::Protocol(format!("response is not JSON: {}", e)))
    } else {
        Ok(Value::String(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_doc() -> Value {
        json!({
            "openapi": "3.0.0",
            "servers": [{"url": "http://api.example/v2"}],
            "paths": {
                "/users/{id}": {
                    "get": {
                        "operationId": "getUser",
                        "parameters": [
                            {"name": "id", "in": "path", "required": true},
                            {"name": "verbose", "in": "query"},
                            {"name": "X-Trace", "in": "header"}
                        ]
                    }
                },
                "/notify": {
                    "post": {
                        "x-tool-name": "notify",
                        "requestBody": {"content": {"application/json": {}}}
                    }
                }
            }
        })
    }

    #[test]
    fn test_derive_operation_name() {
        assert_eq!(derive_operation_name("GET", "/users/{id}"), "get_users_id");
        assert_eq!(derive_operation_name("post", "/notify"), "post_notify");
    }

    #[test]
    fn test_find_operation_by_id_tool_name_and_derived() {
        let doc = sample_doc();
        assert_eq!(find_operation(&doc, "getUser").unwrap().method, "get");
        assert_eq!(find_operation(&doc, "notify").unwrap().path, "/notify");
        assert_eq!(
            find_operation(&doc, "get_users_id").unwrap().path,
            "/users/{id}"
        );
        assert!(find_operation(&doc, "ghost").is_none());
    }

    #[test]
    fn test_place_arguments_across_positions() {
        let doc = sample_doc();
        let op = find_operation(&doc, "getUser").unwrap();
        let args = json!({"id": "42", "verbose": true, "X-Trace": "t1", "extra": "x"});
        let (url, headers, body) =
            place_arguments("http://api.example/v2", &op, &args).unwrap();
        assert_eq!(url, "http://api.example/v2/users/42?verbose=true");
        assert_eq!(headers, vec![("X-Trace".to_string(), "t1".to_string())]);
        // No requestBody declared: extras are dropped rather than guessed at.
        assert!(body.is_none());
    }

    #[test]
    fn test_place_arguments_body_gets_leftovers() {
        let doc = sample_doc();
        let op = find_operation(&doc, "notify").unwrap();
        let args = json!({"input": "hello", "channel": "#x"});
        let (url, _, body) = place_arguments("http://h", &op, &args).unwrap();
        assert_eq!(url, "http://h/notify");
        let body = body.unwrap();
        assert_eq!(body["input"], "hello");
        assert_eq!(body["channel"], "#x");
    }

    #[test]
    fn test_place_arguments_unfilled_path_fails() {
        let doc = sample_doc();
        let op = find_operation(&doc, "getUser").unwrap();
        let err = place_arguments("http://h", &op, &json!({"verbose": 1}));
        assert!(matches!(err, Err(HookError::Protocol(_))));
    }

    #[test]
    fn test_resolve_base_url() {
        let doc = sample_doc();
        assert_eq!(
            resolve_base_url(&doc, "http://h:8080/spec.json").unwrap(),
            "http://api.example/v2"
        );
        let no_servers = json!({"paths": {}});
        assert_eq!(
            resolve_base_url(&no_servers, "http://h:8080/spec.json").unwrap(),
            "http://h:8080"
        );
        let relative = json!({"servers": [{"url": "/v3"}], "paths": {}});
        assert_eq!(
            resolve_base_url(&relative, "https://h/spec.json").unwrap(),
            "https://h/v3"
        );
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("a b&c"), "a%20b%26c");
        assert_eq!(urlencode("safe-chars_1.2~"), "safe-chars_1.2~");
    }
}
