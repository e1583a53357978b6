//! Step executor.
//!
//! [`StepExecutor::execute_step`] never fails: every error, timeout and
//! cancellation ends up in the returned [`StepResult`]. Each step gets a
//! cancellation token derived from its parent's, except parallel-group
//! children, which only use the group's token to decide whether to start.
//! Every attempt races the step body against its timeout, and loops and
//! parallel groups recurse through the same entry point for their children.

mod control;
pub mod expression;
mod retry;
pub mod template;

pub use control::{ExecutionControl, RunningGuard};
pub use retry::{run_with_retry, AttemptError, Attempted};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::{stream, FutureExt, StreamExt};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use taskpilot_core::{ExecutionContext, Step, StepKind, StepResult};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use events::{Event, EventBus};

use crate::config::ExecutorConfig;
use crate::planner::extract_json;
use crate::services::{ChatMessage, ModelClient, ToolCallContext, ToolError, ToolRegistry};

pub struct StepExecutor {
    tools: ToolRegistry,
    model: Arc<dyn ModelClient>,
    config: ExecutorConfig,
    control: ExecutionControl,
    event_bus: Option<EventBus>,
}

impl StepExecutor {
    pub fn new(tools: ToolRegistry, model: Arc<dyn ModelClient>, config: ExecutorConfig) -> Self {
        Self {
            tools,
            model,
            config,
            control: ExecutionControl::new(),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn control(&self) -> &ExecutionControl {
        &self.control
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn cancel_step(&self, step_id: &str) -> bool {
        self.control.cancel_step(step_id)
    }

    pub fn cancel_all(&self) -> usize {
        self.control.cancel_all()
    }

    /// Run one step against the context's variables.
    ///
    /// `parent` scopes cancellation: cancelling it cancels this step and
    /// every child step it spawns.
    pub async fn execute_step(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        parent: &CancellationToken,
    ) -> StepResult {
        self.run_step(step, ctx.task_id, &ctx.variables, parent).await
    }

    fn run_step<'a>(
        &'a self,
        step: &'a Step,
        task_id: Uuid,
        variables: &'a Map<String, Value>,
        parent: &'a CancellationToken,
    ) -> BoxFuture<'a, StepResult> {
        async move {
            self.control.wait_if_paused(parent).await;

            let started_at = Utc::now();
            let start = Instant::now();
            if parent.is_cancelled() {
                return StepResult::cancelled(
                    &step.id,
                    &step.name,
                    "Cancelled before start",
                    started_at,
                    0,
                    0,
                );
            }

            let token = parent.child_token();
            let _running = self.control.register(&step.id, token.clone());
            let max_retries = step.effective_max_retries();
            let timeout = step.timeout();

            debug!(
                task_id = %task_id,
                step_id = %step.id,
                kind = step.kind.as_str(),
                timeout_ms = step.timeout_ms,
                max_retries,
                "Executing step"
            );

            let attempted = run_with_retry(
                &step.id,
                max_retries,
                &self.config.retry,
                &token,
                |retry, error| {
                    self.progress(
                        task_id,
                        &step.id,
                        format!("Retry {}/{} after: {}", retry, max_retries, error),
                        None,
                    )
                },
                |_| self.attempt(step, task_id, variables, &token, timeout),
            )
            .await;

            let duration_ms = start.elapsed().as_millis() as u64;
            match attempted.outcome {
                Ok(output) => {
                    info!(
                        step_id = %step.id,
                        duration_ms,
                        retries = attempted.retries,
                        "Step succeeded"
                    );
                    StepResult::success(
                        &step.id,
                        &step.name,
                        output,
                        started_at,
                        duration_ms,
                        attempted.retries,
                    )
                }
                Err(error @ AttemptError::Cancelled(_)) => {
                    info!(step_id = %step.id, duration_ms, "Step cancelled");
                    StepResult::cancelled(
                        &step.id,
                        &step.name,
                        error.to_string(),
                        started_at,
                        duration_ms,
                        attempted.retries,
                    )
                }
                Err(error) => {
                    warn!(
                        step_id = %step.id,
                        error = %error,
                        duration_ms,
                        retries = attempted.retries,
                        "Step failed"
                    );
                    StepResult::failed(
                        &step.id,
                        &step.name,
                        error.to_string(),
                        started_at,
                        duration_ms,
                        attempted.retries,
                    )
                }
            }
        }
        .boxed()
    }

    /// One attempt: the step body raced against a fresh timeout window.
    ///
    /// Leaf steps are also raced against cancellation. Loops and parallel
    /// groups watch the token themselves so children already in flight are
    /// awaited rather than dropped.
    async fn attempt(
        &self,
        step: &Step,
        task_id: Uuid,
        variables: &Map<String, Value>,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<Value, AttemptError> {
        let attempt_token = token.child_token();
        let composite = matches!(step.kind, StepKind::Loop { .. } | StepKind::Parallel { .. });

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled(), if !composite => {
                Err(AttemptError::Cancelled(format!("step {} cancelled", step.id)))
            }
            _ = tokio::time::sleep(timeout) => {
                Err(AttemptError::Timeout { timeout_ms: step.timeout_ms })
            }
            result = self.dispatch(step, task_id, variables, &attempt_token, timeout) => result,
        };

        // Stop anything the body left running
        attempt_token.cancel();
        outcome
    }

    async fn dispatch(
        &self,
        step: &Step,
        task_id: Uuid,
        variables: &Map<String, Value>,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<Value, AttemptError> {
        match &step.kind {
            StepKind::Tool { tool } => self.run_tool(step, tool, variables, token, timeout).await,
            StepKind::Model => self.run_model(step, variables, token).await,
            StepKind::Condition { expression } => run_condition(step, expression, variables),
            StepKind::Loop { steps } => self.run_loop(step, steps, task_id, variables, token).await,
            StepKind::Parallel { steps } => {
                self.run_parallel(step, steps, task_id, variables, token).await
            }
        }
    }

    async fn run_tool(
        &self,
        step: &Step,
        tool: &str,
        variables: &Map<String, Value>,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<Value, AttemptError> {
        let params = template::resolve_params(&step.params, variables);
        let ctx = ToolCallContext {
            cancellation: token.clone(),
            timeout,
            variables: variables.clone(),
        };

        self.tools
            .invoke(tool, params, ctx)
            .await
            .map_err(|e| match e {
                ToolError::Cancelled => AttemptError::Cancelled(format!("tool {} cancelled", tool)),
                other => AttemptError::Failed(other.to_string()),
            })
    }

    async fn run_model(
        &self,
        step: &Step,
        variables: &Map<String, Value>,
        token: &CancellationToken,
    ) -> Result<Value, AttemptError> {
        let params = template::resolve_params(&step.params, variables);
        let prompt = params
            .get("prompt")
            .or_else(|| params.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                let description = template::resolve_value(&Value::String(step.description.clone()), variables);
                Some(template::to_text(&description)).filter(|s| !s.trim().is_empty())
            })
            .ok_or_else(|| AttemptError::Failed(format!("model step {} has no prompt", step.id)))?;

        let response = match params.get("system").and_then(Value::as_str) {
            Some(system) => {
                let messages = [ChatMessage::system(system), ChatMessage::user(prompt)];
                self.model.chat(&messages, token.clone()).await
            }
            None => self.model.complete(&prompt, token.clone()).await,
        }
        .map_err(|e| AttemptError::Failed(format!("model call failed: {}", e)))?;

        let wants_json = params
            .get("outputFormat")
            .or_else(|| params.get("output_format"))
            .and_then(Value::as_str)
            == Some("json");
        if wants_json {
            if let Some(parsed) = extract_json(&response) {
                return Ok(parsed);
            }
            debug!(step_id = %step.id, "Model output is not JSON, keeping raw text");
        }
        Ok(Value::String(response))
    }

    async fn run_loop(
        &self,
        step: &Step,
        children: &[Step],
        task_id: Uuid,
        variables: &Map<String, Value>,
        token: &CancellationToken,
    ) -> Result<Value, AttemptError> {
        let items = match step.params.get("items").map(|v| template::resolve_value(v, variables)) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(AttemptError::Failed(format!(
                    "loop step {} needs an array 'items' parameter",
                    step.id
                )))
            }
        };

        let total = items.len();
        let mut outputs = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            if token.is_cancelled() {
                return Err(AttemptError::Cancelled(format!(
                    "loop {} cancelled at iteration {}",
                    step.id, index
                )));
            }

            let mut scope = variables.clone();
            scope.insert("$item".to_string(), item);
            scope.insert("$index".to_string(), json!(index));
            scope.insert("$total".to_string(), json!(total));

            let mut iteration = Map::new();
            for child in children {
                let result = self.run_step(child, task_id, &scope, token).await;
                match result.output {
                    Some(output) if result.is_success() => {
                        scope.insert(child.id.clone(), output.clone());
                        iteration.insert(child.id.clone(), output);
                    }
                    _ => {
                        let message = format!(
                            "iteration {} step {}: {}",
                            index,
                            child.id,
                            result.error.as_deref().unwrap_or("did not succeed")
                        );
                        return Err(if token.is_cancelled() {
                            AttemptError::Cancelled(message)
                        } else {
                            AttemptError::Failed(message)
                        });
                    }
                }
            }
            outputs.push(Value::Object(iteration));

            self.progress(
                task_id,
                &step.id,
                format!("Iteration {}/{} done", index + 1, total),
                Some((index + 1) as f64 / total as f64),
            );
        }

        Ok(Value::Array(outputs))
    }

    async fn run_parallel(
        &self,
        step: &Step,
        children: &[Step],
        task_id: Uuid,
        variables: &Map<String, Value>,
        token: &CancellationToken,
    ) -> Result<Value, AttemptError> {
        let total = children.len();
        let limit = self.config.max_concurrency.max(1);
        let finished = AtomicUsize::new(0);
        let finished = &finished;

        let launches: Vec<BoxFuture<'_, (usize, Option<StepResult>)>> = children
            .iter()
            .enumerate()
            .map(|(index, child)| {
                async move {
                    // The group token only gates launching. A started child
                    // runs under its own token so it can finish; cancel_step
                    // and cancel_all still reach it through the registry.
                    if token.is_cancelled() {
                        return (index, None);
                    }
                    let own = CancellationToken::new();
                    let result = self.run_step(child, task_id, variables, &own).await;
                    let done = finished.fetch_add(1, Ordering::Relaxed) + 1;
                    self.progress(
                        task_id,
                        &step.id,
                        format!("Child {} {} ({}/{})", child.id, result.status.as_str(), done, total),
                        Some(done as f64 / total as f64),
                    );
                    (index, Some(result))
                }
                .boxed()
            })
            .collect();

        let completed: Vec<(usize, Option<StepResult>)> =
            stream::iter(launches).buffer_unordered(limit).collect().await;

        let mut slots: Vec<Option<StepResult>> = vec![None; total];
        for (index, result) in completed {
            slots[index] = result;
        }

        if token.is_cancelled() {
            let launched = slots.iter().filter(|s| s.is_some()).count();
            return Err(AttemptError::Cancelled(format!(
                "parallel group {} cancelled after launching {}/{} children",
                step.id, launched, total
            )));
        }

        let failed: Vec<&str> = slots
            .iter()
            .zip(children)
            .filter(|(slot, _)| !slot.as_ref().is_some_and(StepResult::is_success))
            .map(|(_, child)| child.id.as_str())
            .collect();
        if !failed.is_empty() {
            return Err(AttemptError::Failed(format!(
                "parallel group {}: {} of {} children failed ({})",
                step.id,
                failed.len(),
                total,
                failed.join(", ")
            )));
        }

        Ok(Value::Array(
            slots
                .into_iter()
                .map(|slot| slot.and_then(|r| r.output).unwrap_or(Value::Null))
                .collect(),
        ))
    }

    fn progress(&self, task_id: Uuid, step_id: &str, message: String, progress: Option<f64>) {
        if let Some(ref bus) = self.event_bus {
            bus.emit(Event::StepProgress {
                task_id,
                step_id: step_id.to_string(),
                message,
                progress,
            });
        }
    }
}

fn condition_reference() -> &'static Regex {
    static REFERENCE: OnceLock<Regex> = OnceLock::new();
    REFERENCE.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("Invalid condition regex pattern")
    })
}

/// Evaluate a condition step. `{{path}}` wrappers are accepted and read as
/// bare paths.
fn run_condition(
    step: &Step,
    expression: &str,
    variables: &Map<String, Value>,
) -> Result<Value, AttemptError> {
    let expression = condition_reference().replace_all(expression, "$1");
    let result = expression::evaluate_bool(&expression, variables).map_err(|e| {
        AttemptError::Failed(format!("invalid condition '{}': {}", expression, e))
    })?;

    let branch = if result {
        step.param_str("then").unwrap_or("then")
    } else {
        step.param_str("else").unwrap_or("else")
    };
    Ok(json!({ "branch": branch, "result": result }))
}
