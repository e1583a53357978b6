//! Step definitions.
//!
//! A step is one unit of work inside a plan. Its [`StepKind`] selects the
//! execution function; control-flow kinds (loop, parallel group) carry
//! their nested child steps.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Type-specific part of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a registered tool by name
    Tool { tool: String },
    /// Ask the model-completion backend
    Model,
    /// Evaluate a boolean expression against the context variables
    Condition { expression: String },
    /// Run `steps` once per item of the `items` parameter
    Loop { steps: Vec<Step> },
    /// Run `steps` concurrently, bounded by the executor's concurrency limit
    Parallel { steps: Vec<Step> },
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool { .. } => "tool",
            Self::Model => "model",
            Self::Condition { .. } => "condition",
            Self::Loop { .. } => "loop",
            Self::Parallel { .. } => "parallel",
        }
    }

    pub fn children(&self) -> &[Step] {
        match self {
            Self::Loop { steps } | Self::Parallel { steps } => steps,
            _ => &[],
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Step>> {
        match self {
            Self::Loop { steps } | Self::Parallel { steps } => Some(steps),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: StepKind,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub requires_confirmation: bool,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_STEP_TIMEOUT_MS
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            kind,
            params: Map::new(),
            depends_on: Vec::new(),
            retryable: false,
            max_retries: 0,
            timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            requires_confirmation: false,
        }
    }

    pub fn tool(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::new(id, StepKind::Tool { tool: tool.into() })
    }

    pub fn model(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Model)
    }

    pub fn condition(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Condition {
                expression: expression.into(),
            },
        )
    }

    pub fn looped(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::new(id, StepKind::Loop { steps })
    }

    pub fn parallel(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::new(id, StepKind::Parallel { steps })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set a single parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Replace the parameter bag; non-object values are ignored.
    pub fn with_params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.params = map;
        }
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retryable = true;
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Retries the executor may spend on this step.
    pub fn effective_max_retries(&self) -> u32 {
        if self.retryable {
            self.max_retries
        } else {
            0
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Tool { tool } => Some(tool),
            _ => None,
        }
    }

    pub fn children(&self) -> &[Step] {
        self.kind.children()
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_defaults() {
        let step = Step::tool("fetch", "http_get");
        assert_eq!(step.name, "fetch");
        assert_eq!(step.tool_name(), Some("http_get"));
        assert_eq!(step.timeout(), Duration::from_millis(DEFAULT_STEP_TIMEOUT_MS));
        assert_eq!(step.effective_max_retries(), 0);
    }

    #[test]
    fn test_effective_retries_require_retryable() {
        let mut step = Step::model("m").with_retries(2);
        assert_eq!(step.effective_max_retries(), 2);

        step.retryable = false;
        assert_eq!(step.effective_max_retries(), 0);
    }

    #[test]
    fn test_kind_serialization_is_tagged() {
        let step = Step::tool("a", "echo").with_params(json!({"text": "hi"}));
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["kind"]["type"], "tool");
        assert_eq!(value["kind"]["tool"], "echo");

        let parsed: Step = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, step);
    }

    #[test]
    fn test_nested_children() {
        let group = Step::parallel("g", vec![Step::model("x"), Step::model("y")]);
        assert_eq!(group.children().len(), 2);
        assert_eq!(group.kind.as_str(), "parallel");
        assert!(Step::model("z").children().is_empty());
    }
}
