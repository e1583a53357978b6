use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::{Checkpoint, StepResult};

/// Mutable state of one execution pass.
///
/// Owned by the agent for a single run; the executor only reads it, except
/// for loop iterations which work on their own copy.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub task_id: Uuid,
    pub variables: Map<String, Value>,
    pub results: HashMap<String, StepResult>,
}

impl ExecutionContext {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            variables: Map::new(),
            results: HashMap::new(),
        }
    }

    /// Seed variables from the task input. Objects are merged key by key,
    /// anything else is stored under `input`.
    pub fn with_input(mut self, input: &Value) -> Self {
        match input {
            Value::Object(map) => {
                for (key, value) in map {
                    self.variables.insert(key.clone(), value.clone());
                }
            }
            Value::Null => {}
            other => {
                self.variables.insert("input".to_string(), other.clone());
            }
        }
        self
    }

    /// Rebuild a context from a checkpoint: captured variables plus the
    /// outputs of every successful result, keyed by step id.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        let mut ctx = Self::new(checkpoint.task_id);
        ctx.variables = checkpoint.variables.clone();
        for result in &checkpoint.results {
            ctx.record(result.clone());
        }
        ctx
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Store a result; successful outputs also become a variable named
    /// after the step.
    pub fn record(&mut self, result: StepResult) {
        if let Some(output) = result.output.as_ref().filter(|_| result.is_success()) {
            self.variables.insert(result.step_id.clone(), output.clone());
        }
        self.results.insert(result.step_id.clone(), result);
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    pub fn successful_output(&self, step_id: &str) -> Option<&Value> {
        self.results
            .get(step_id)
            .filter(|r| r.is_success())
            .and_then(|r| r.output.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_with_input_merges_objects() {
        let ctx = ExecutionContext::new(Uuid::new_v4()).with_input(&json!({"city": "Oslo"}));
        assert_eq!(ctx.variable("city"), Some(&json!("Oslo")));

        let ctx = ExecutionContext::new(Uuid::new_v4()).with_input(&json!("raw"));
        assert_eq!(ctx.variable("input"), Some(&json!("raw")));
    }

    #[test]
    fn test_record_exposes_successful_output() {
        let mut ctx = ExecutionContext::new(Uuid::new_v4());
        ctx.record(StepResult::success("a", "A", json!([1, 2]), Utc::now(), 1, 0));
        ctx.record(StepResult::failed("b", "B", "boom", Utc::now(), 1, 0));

        assert_eq!(ctx.variable("a"), Some(&json!([1, 2])));
        assert!(ctx.variable("b").is_none());
        assert!(ctx.successful_output("b").is_none());
        assert!(ctx.result("b").is_some());
    }
}
