//! `{{path}}` references in step parameters.
//!
//! A string that is exactly one reference is replaced by the referenced
//! value, keeping its JSON type. A string that merely contains references
//! is interpolated to text. Unresolvable references are left as written.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::debug;

fn reference() -> &'static Regex {
    static REFERENCE: OnceLock<Regex> = OnceLock::new();
    REFERENCE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("Invalid template regex pattern"))
}

fn whole_reference() -> &'static Regex {
    static WHOLE: OnceLock<Regex> = OnceLock::new();
    WHOLE.get_or_init(|| {
        Regex::new(r"^\s*\{\{\s*([^{}]+?)\s*\}\}\s*$").expect("Invalid template regex pattern")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Split `a.b[0]["c d"]` into segments. `None` for malformed paths.
pub fn parse_path(path: &str) -> Option<Vec<PathSegment>> {
    let mut segments = Vec::new();
    let mut chars = path.trim().chars().peekable();
    let mut current = String::new();
    // Set right after `]`, where only `.` or `[` may follow
    let mut closed = false;

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if current.is_empty() && !closed {
                    return None;
                }
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                closed = false;
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(ch) => inner.push(ch),
                        None => return None,
                    }
                }
                let inner = inner.trim();
                let quoted = inner.len() >= 2
                    && ((inner.starts_with('"') && inner.ends_with('"'))
                        || (inner.starts_with('\'') && inner.ends_with('\'')));
                if quoted {
                    segments.push(PathSegment::Key(inner[1..inner.len() - 1].to_string()));
                } else {
                    segments.push(PathSegment::Index(inner.parse().ok()?));
                }
                closed = true;
            }
            c if c.is_whitespace() || closed => return None,
            c => current.push(c),
        }
    }

    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    }
    if segments.is_empty() || !matches!(segments[0], PathSegment::Key(_)) {
        return None;
    }
    Some(segments)
}

/// Follow parsed segments from the variable map.
pub fn lookup_segments<'a>(variables: &'a Map<String, Value>, segments: &[PathSegment]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let PathSegment::Key(root) = first else {
        return None;
    };

    rest.iter()
        .try_fold(variables.get(root)?, |value, segment| match (segment, value) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key),
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
            (PathSegment::Key(key), Value::Array(items)) => {
                key.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            _ => None,
        })
}

pub fn lookup<'a>(variables: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    parse_path(path).and_then(|segments| lookup_segments(variables, &segments))
}

/// Text form used when interpolating: strings unquoted, everything else as JSON.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn resolve_value(value: &Value, variables: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => resolve_string(s, variables),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, variables)).collect()),
        Value::Object(map) => Value::Object(resolve_params(map, variables)),
        other => other.clone(),
    }
}

pub fn resolve_params(params: &Map<String, Value>, variables: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, variables)))
        .collect()
}

fn resolve_string(s: &str, variables: &Map<String, Value>) -> Value {
    if !s.contains("{{") {
        return Value::String(s.to_string());
    }

    if let Some(path) = whole_reference().captures(s).and_then(|c| c.get(1)) {
        return match lookup(variables, path.as_str()) {
            Some(value) => value.clone(),
            None => {
                debug!(reference = path.as_str(), "Unresolved template reference");
                Value::String(s.to_string())
            }
        };
    }

    let text = reference().replace_all(s, |caps: &regex::Captures<'_>| {
        match lookup(variables, &caps[1]) {
            Some(value) => to_text(value),
            None => {
                debug!(reference = &caps[1], "Unresolved template reference");
                caps[0].to_string()
            }
        }
    });
    Value::String(text.into_owned())
}
