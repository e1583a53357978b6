//! Tools every registry can start with.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::tools::{ParamType, Tool, ToolCallContext, ToolDescriptor, ToolError, ToolParam, ToolRegistry};

pub fn register_builtins(registry: &mut ToolRegistry) {
    registry.register(EchoTool);
    registry.register(WaitTool);
}

/// Returns its `value` parameter unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "echo".to_string(),
            description: "Return the given value unchanged".to_string(),
            category: "utility".to_string(),
            params: vec![ToolParam::required("value", ParamType::Any)
                .with_description("Value to return")],
        }
    }

    async fn execute(&self, mut params: Map<String, Value>, _ctx: ToolCallContext) -> Result<Value, ToolError> {
        Ok(params.remove("value").unwrap_or(Value::Null))
    }
}

/// Sleeps for `ms` milliseconds, returning early with an error if cancelled.
pub struct WaitTool;

#[async_trait]
impl Tool for WaitTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "wait".to_string(),
            description: "Pause for a number of milliseconds".to_string(),
            category: "utility".to_string(),
            params: vec![ToolParam::optional("ms", ParamType::Integer)
                .with_default(json!(1000))
                .with_description("Milliseconds to wait")],
        }
    }

    async fn execute(&self, params: Map<String, Value>, ctx: ToolCallContext) -> Result<Value, ToolError> {
        let ms = params
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| ToolError::InvalidParams("'ms' must be a non-negative integer".to_string()))?;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "waited_ms": ms })),
            _ = ctx.cancellation.cancelled() => Err(ToolError::Cancelled),
        }
    }
}
