//! Turning model text into plan structures.
//!
//! Model output is loosely shaped: JSON may be fenced, wrapped in prose,
//! use camelCase or snake_case keys, or leave fields out. Everything here is
//! lenient about shape and fills defaults rather than failing.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use taskpilot_core::{Step, StepKind, TaskAnalysis};

use crate::config::PlannerConfig;

fn fenced_block() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"```(?:json|JSON)?\s*\n?([\s\S]*?)```").expect("Invalid fence regex pattern")
    })
}

/// Find and parse the JSON payload in a model response.
///
/// Tries, in order: the whole text, the first fenced code block, and the
/// span from the first `{`/`[` to the last `}`/`]`.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(inner) = fenced_block().captures(trimmed).and_then(|c| c.get(1)) {
        if let Ok(value) = serde_json::from_str(inner.as_str().trim()) {
            return Some(value);
        }
    }

    let start = trimmed.find(|c: char| c == '{' || c == '[')?;
    let end = trimmed.rfind(|c: char| c == '}' || c == ']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

pub fn parse_analysis(text: &str) -> Option<TaskAnalysis> {
    extract_json(text)
        .filter(Value::is_object)
        .and_then(|value| serde_json::from_value(value).ok())
}

/// Parse a candidate step list out of a model response.
///
/// Accepts a bare array or an object with a `steps` array.
pub fn parse_steps(text: &str, defaults: &PlannerConfig) -> Result<Vec<Step>, String> {
    let value = extract_json(text).ok_or_else(|| "response contains no JSON".to_string())?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("steps") {
            Some(Value::Array(items)) => items,
            _ => return Err("expected a JSON array of steps".to_string()),
        },
        _ => return Err("expected a JSON array of steps".to_string()),
    };

    Ok(normalize_steps(&items, defaults, None))
}

/// Normalize raw step objects. Non-object entries are dropped.
pub fn normalize_steps(items: &[Value], defaults: &PlannerConfig, parent: Option<&str>) -> Vec<Step> {
    items
        .iter()
        .filter_map(Value::as_object)
        .enumerate()
        .map(|(i, raw)| normalize_step(raw, i + 1, defaults, parent))
        .collect()
}

fn normalize_step(
    raw: &Map<String, Value>,
    position: usize,
    defaults: &PlannerConfig,
    parent: Option<&str>,
) -> Step {
    let id = field(raw, &["id"])
        .and_then(scalar_string)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| match parent {
            Some(parent) => format!("{}_step_{}", parent, position),
            None => format!("step_{}", position),
        });

    let name = field(raw, &["name", "title"])
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| id.clone());
    let description = field(raw, &["description"])
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = field(raw, &["params", "parameters", "args"])
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let kind = normalize_kind(raw, &id, &params, defaults);

    let depends_on = field(raw, &["dependsOn", "depends_on", "dependencies"])
        .and_then(Value::as_array)
        .map(|deps| deps.iter().filter_map(scalar_string).collect())
        .unwrap_or_default();

    Step {
        id,
        name,
        description,
        kind,
        params,
        depends_on,
        retryable: field(raw, &["retryable"])
            .and_then(Value::as_bool)
            .unwrap_or(defaults.default_retryable),
        max_retries: field(raw, &["maxRetries", "max_retries"])
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(defaults.default_max_retries),
        timeout_ms: field(raw, &["timeout", "timeoutMs", "timeout_ms"])
            .and_then(Value::as_u64)
            .filter(|&ms| ms > 0)
            .unwrap_or(defaults.default_step_timeout_ms),
        requires_confirmation: field(raw, &["requiresConfirmation", "requires_confirmation"])
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

fn normalize_kind(
    raw: &Map<String, Value>,
    id: &str,
    params: &Map<String, Value>,
    defaults: &PlannerConfig,
) -> StepKind {
    let tool = field(raw, &["tool", "toolName", "tool_name"])
        .and_then(Value::as_str)
        .map(str::to_string);
    let declared = field(raw, &["type", "kind"])
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase());

    let children = || {
        field(raw, &["steps", "children"])
            .and_then(Value::as_array)
            .map(|items| normalize_steps(items, defaults, Some(id)))
            .unwrap_or_default()
    };

    match declared.as_deref() {
        Some("tool") | Some("tool_call") => StepKind::Tool {
            tool: tool.unwrap_or_default(),
        },
        Some("condition") | Some("conditional") | Some("branch") => StepKind::Condition {
            expression: field(raw, &["expression", "condition"])
                .or_else(|| params.get("expression"))
                .or_else(|| params.get("condition"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        Some("loop") => StepKind::Loop { steps: children() },
        Some("parallel") => StepKind::Parallel { steps: children() },
        Some("model") | Some("llm") => StepKind::Model,
        // Undeclared type with a tool name is a tool step; anything else
        // falls back to a model call.
        None if tool.is_some() => StepKind::Tool {
            tool: tool.unwrap_or_default(),
        },
        _ => StepKind::Model,
    }
}

fn field<'a>(raw: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| raw.get(*name)).filter(|v| !v.is_null())
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_plain_json() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(json!({"a": 1})));
    }

    #[test]
    fn test_extract_fenced_json() {
        let text = "Here you go:\n```json\n[1, 2, 3]\n```\nDone.";
        assert_eq!(extract_json(text), Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_extract_json_wrapped_in_prose() {
        let text = r#"Sure! The answer is {"city": "Oslo", "temp": 4} as requested."#;
        assert_eq!(extract_json(text), Some(json!({"city": "Oslo", "temp": 4})));
    }

    #[test]
    fn test_extract_fails_on_plain_text() {
        assert_eq!(extract_json("no structure here"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }

    #[test]
    fn test_parse_analysis_rejects_non_objects() {
        assert!(parse_analysis("[1, 2]").is_none());
        let analysis = parse_analysis(r#"{"task_type": "data", "risks": ["rate limits"]}"#).unwrap();
        assert_eq!(analysis.task_type, "data");
        assert_eq!(analysis.risks, vec!["rate limits"]);
    }

    #[test]
    fn test_normalize_fills_defaults() {
        let defaults = PlannerConfig::default();
        let steps = parse_steps(r#"[{"description": "think"}, {"type": "teleport"}]"#, &defaults)
            .unwrap();

        assert_eq!(steps[0].id, "step_1");
        assert_eq!(steps[0].name, "step_1");
        assert_eq!(steps[0].kind, StepKind::Model);
        assert_eq!(steps[0].timeout_ms, defaults.default_step_timeout_ms);
        assert_eq!(steps[0].max_retries, defaults.default_max_retries);
        assert!(steps[0].retryable);
        assert_eq!(steps[1].id, "step_2");
        assert_eq!(steps[1].kind, StepKind::Model);
    }

    #[test]
    fn test_normalize_reads_both_key_styles() {
        let defaults = PlannerConfig::default();
        let steps = parse_steps(
            r#"{"steps": [
                {"id": "a", "type": "tool", "tool": "echo", "params": {"value": 1}},
                {"id": 7, "depends_on": ["a"], "timeoutMs": 500, "retryable": false,
                 "requiresConfirmation": true}
            ]}"#,
            &defaults,
        )
        .unwrap();

        assert_eq!(steps[0].tool_name(), Some("echo"));
        assert_eq!(steps[0].params["value"], 1);
        assert_eq!(steps[1].id, "7");
        assert_eq!(steps[1].depends_on, vec!["a"]);
        assert_eq!(steps[1].timeout_ms, 500);
        assert!(!steps[1].retryable);
        assert!(steps[1].requires_confirmation);
    }

    #[test]
    fn test_tool_inferred_without_type() {
        let steps = parse_steps(r#"[{"tool": "wait"}]"#, &PlannerConfig::default()).unwrap();
        assert_eq!(steps[0].tool_name(), Some("wait"));
    }

    #[test]
    fn test_nested_children_get_prefixed_ids() {
        let steps = parse_steps(
            r#"[{"id": "each", "type": "loop", "params": {"items": [1]},
                 "steps": [{"type": "tool", "tool": "echo"}]}]"#,
            &PlannerConfig::default(),
        )
        .unwrap();
        assert_eq!(steps[0].children()[0].id, "each_step_1");
    }

    #[test]
    fn test_condition_expression_from_params() {
        let steps = parse_steps(
            r#"[{"type": "condition", "params": {"expression": "x > 1"}}]"#,
            &PlannerConfig::default(),
        )
        .unwrap();
        assert_eq!(
            steps[0].kind,
            StepKind::Condition {
                expression: "x > 1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_steps_rejects_scalars() {
        assert!(parse_steps("42", &PlannerConfig::default()).is_err());
        assert!(parse_steps("I cannot help", &PlannerConfig::default()).is_err());
    }
}
