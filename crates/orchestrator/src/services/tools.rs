//! Tool-execution collaborator: the [`Tool`] trait and the registry the
//! planner validates against and the executor dispatches through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Execution(String),

    #[error("Tool call cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl ParamType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
}

impl ToolParam {
    pub fn required(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
            description: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// What the planner's tool catalogue shows the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub category: String,
    pub params: Vec<ToolParam>,
}

impl ToolDescriptor {
    /// Check required parameters and types, then fill declared defaults.
    pub fn prepare(&self, mut params: Map<String, Value>) -> Result<Map<String, Value>, ToolError> {
        for param in &self.params {
            match params.get(&param.name) {
                Some(value) if !value.is_null() => {
                    if !param.kind.matches(value) {
                        return Err(ToolError::InvalidParams(format!(
                            "parameter '{}' of tool '{}' must be {:?}",
                            param.name, self.name, param.kind
                        )));
                    }
                }
                _ => {
                    if let Some(default) = &param.default {
                        params.insert(param.name.clone(), default.clone());
                    } else if param.required {
                        return Err(ToolError::InvalidParams(format!(
                            "missing required parameter '{}' for tool '{}'",
                            param.name, self.name
                        )));
                    }
                }
            }
        }
        Ok(params)
    }
}

/// Per-call context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    pub cancellation: CancellationToken,
    pub timeout: Duration,
    /// Read-only snapshot of the run's variables
    pub variables: Map<String, Value>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn execute(&self, params: Map<String, Value>, ctx: ToolCallContext) -> Result<Value, ToolError>;
}

/// Named tools available to a run. Cheap to clone.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the builtin tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin_tools::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name;
        debug!(tool = %name, "Registering tool");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Look up `name`, validate `params` against its descriptor and run it.
    pub async fn invoke(
        &self,
        name: &str,
        params: Map<String, Value>,
        ctx: ToolCallContext,
    ) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let params = tool.descriptor().prepare(params)?;
        tool.execute(params, ctx).await
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Greet;

    #[async_trait]
    impl Tool for Greet {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "greet".to_string(),
                description: "Greets someone".to_string(),
                category: "test".to_string(),
                params: vec![
                    ToolParam::required("name", ParamType::String),
                    ToolParam::optional("punctuation", ParamType::String).with_default(json!("!")),
                ],
            }
        }

        async fn execute(
            &self,
            params: Map<String, Value>,
            _ctx: ToolCallContext,
        ) -> Result<Value, ToolError> {
            Ok(json!(format!(
                "Hello, {}{}",
                params["name"].as_str().unwrap_or_default(),
                params["punctuation"].as_str().unwrap_or_default()
            )))
        }
    }

    fn ctx() -> ToolCallContext {
        ToolCallContext {
            cancellation: CancellationToken::new(),
            timeout: Duration::from_secs(1),
            variables: Map::new(),
        }
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_invoke_applies_defaults() {
        let mut registry = ToolRegistry::new();
        registry.register(Greet);

        let out = registry
            .invoke("greet", params(json!({"name": "Ada"})), ctx())
            .await
            .unwrap();
        assert_eq!(out, json!("Hello, Ada!"));
    }

    #[tokio::test]
    async fn test_missing_required_param() {
        let mut registry = ToolRegistry::new();
        registry.register(Greet);

        let err = registry.invoke("greet", Map::new(), ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams(msg) if msg.contains("'name'")));
    }

    #[tokio::test]
    async fn test_type_mismatch_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Greet);

        let err = registry
            .invoke("greet", params(json!({"name": 7})), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("nope", Map::new(), ctx()).await.unwrap_err();
        assert_eq!(err, ToolError::NotFound("nope".to_string()));
    }

    #[test]
    fn test_catalogue_sorted() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["echo", "wait"]);
        assert_eq!(registry.descriptors()[0].name, "echo");
    }
}
