//! Plan builder.
//!
//! Two model calls (analysis, then step generation), then local dependency
//! optimization and validation. Plans are never edited in place: replanning
//! and the modification helpers all return a successor plan.

mod graph;
mod parser;
mod validation;

pub use graph::{optimize_dependencies, prune_dangling, topological_sort};
pub use parser::{extract_json, normalize_steps, parse_analysis, parse_steps};
pub use validation::{estimate_duration_ms, validate_plan};

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use taskpilot_core::{Plan, ReplanLineage, Step, TaskAnalysis};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PlannerConfig;
use crate::error::{OrchestratorError, Result};
use crate::prompts::PlannerPrompts;
use crate::services::{ModelClient, ToolRegistry};

pub struct Planner {
    model: Arc<dyn ModelClient>,
    tools: ToolRegistry,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(model: Arc<dyn ModelClient>, tools: ToolRegistry, config: PlannerConfig) -> Self {
        Self {
            model,
            tools,
            config,
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn create_plan(
        &self,
        description: &str,
        context: &Value,
        cancel: &CancellationToken,
    ) -> Result<Plan> {
        let analysis = self.analyze(description, context, cancel).await?;

        let prompt = PlannerPrompts::generation(
            description,
            context,
            &analysis,
            &self.tools.descriptors(),
            self.config.max_steps,
        );
        let response = self
            .call_model(&prompt, self.config.generation_timeout(), "step generation", cancel)
            .await?;
        let steps = parse_steps(&response, &self.config).map_err(|e| {
            OrchestratorError::planning(format!("unparsable step list: {}", e))
        })?;

        let mut plan = Plan::new(description, steps);
        plan.metadata.analysis = Some(analysis);
        let plan = self.finalize(plan)?;

        info!(
            plan_id = %plan.id,
            steps = plan.len(),
            estimated_ms = plan.estimated_duration_ms,
            "Plan created"
        );
        Ok(plan)
    }

    /// Optimize dependencies, validate and estimate an assembled plan.
    ///
    /// Also the entry point for caller-supplied plans.
    pub fn finalize(&self, mut plan: Plan) -> Result<Plan> {
        plan.steps = optimize_dependencies(std::mem::take(&mut plan.steps))?;
        validate_plan(&plan, self.config.max_steps, &self.tools)?;
        plan.estimated_duration_ms = estimate_duration_ms(&plan.steps);
        Ok(plan)
    }

    async fn analyze(
        &self,
        description: &str,
        context: &Value,
        cancel: &CancellationToken,
    ) -> Result<TaskAnalysis> {
        let prompt = PlannerPrompts::analysis(description, context);
        let response = self
            .call_model(&prompt, self.config.analysis_timeout(), "analysis", cancel)
            .await?;

        Ok(parse_analysis(&response).unwrap_or_else(|| {
            warn!("Task analysis response was not parseable, using conservative default");
            TaskAnalysis::conservative()
        }))
    }

    /// Replacement plan after `failed_step` failed.
    ///
    /// The result keeps every step of `original` that precedes the failed
    /// one, followed by the newly generated steps, so indices of work
    /// already done stay put.
    pub async fn replan(
        &self,
        original: &Plan,
        failed_step: &Step,
        error: &str,
        completed: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Plan> {
        let prompt = PlannerPrompts::replan(
            original,
            failed_step,
            error,
            completed,
            &self.tools.descriptors(),
        );
        let response = self
            .call_model(&prompt, self.config.generation_timeout(), "replan", cancel)
            .await?;
        let fresh = parse_steps(&response, &self.config)
            .map_err(|e| OrchestratorError::planning(format!("unparsable replan: {}", e)))?;

        let split = original.index_of(&failed_step.id).unwrap_or(original.len());
        let mut steps: Vec<Step> = original.steps[..split].to_vec();
        for step in fresh {
            if steps.iter().any(|s| s.id == step.id) {
                debug!(step_id = %step.id, "Replan repeated a finished step, ignoring it");
                continue;
            }
            steps.push(step);
        }

        let mut plan = original.successor(steps);
        plan.metadata.modified = false;
        plan.metadata.replan = Some(ReplanLineage {
            parent_plan_id: original.id,
            failed_step_id: failed_step.id.clone(),
            reason: error.to_string(),
        });
        let plan = self.finalize(plan)?;

        info!(
            plan_id = %plan.id,
            parent_plan_id = %original.id,
            failed_step = %failed_step.id,
            steps = plan.len(),
            "Replan created"
        );
        Ok(plan)
    }

    /// Insert `step` at `position` (appended when out of range).
    pub fn insert_step(&self, plan: &Plan, step: Step, position: Option<usize>) -> Result<Plan> {
        let mut steps = plan.steps.clone();
        let at = position.unwrap_or(steps.len()).min(steps.len());
        steps.insert(at, step);
        self.modified(plan, steps)
    }

    /// Remove a step. References to it from other steps are dropped.
    pub fn remove_step(&self, plan: &Plan, step_id: &str) -> Result<Plan> {
        let index = plan
            .index_of(step_id)
            .ok_or_else(|| OrchestratorError::StepNotFound(step_id.to_string()))?;
        let mut steps = plan.steps.clone();
        steps.remove(index);
        self.modified(plan, steps)
    }

    pub fn update_step<F>(&self, plan: &Plan, step_id: &str, update: F) -> Result<Plan>
    where
        F: FnOnce(&mut Step),
    {
        let mut steps = plan.steps.clone();
        let step = steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| OrchestratorError::StepNotFound(step_id.to_string()))?;
        update(step);
        self.modified(plan, steps)
    }

    fn modified(&self, plan: &Plan, steps: Vec<Step>) -> Result<Plan> {
        let mut next = plan.successor(steps);
        next.metadata.modified = true;
        self.finalize(next)
    }

    async fn call_model(
        &self,
        prompt: &str,
        timeout: Duration,
        purpose: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let call_token = cancel.child_token();
        debug!(purpose, timeout_ms = timeout.as_millis() as u64, "Calling model");

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, self.model.complete(prompt, call_token.clone())) => result,
            _ = cancel.cancelled() => {
                return Err(OrchestratorError::Cancelled(format!("{} cancelled", purpose)));
            }
        };

        match outcome {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(OrchestratorError::planning(format!(
                "{} call failed: {}",
                purpose, e
            ))),
            Err(_) => {
                call_token.cancel();
                Err(OrchestratorError::planning(format!(
                    "{} timed out after {}ms",
                    purpose,
                    timeout.as_millis()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ChatMessage, ModelError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use taskpilot_core::StepKind;

    /// Replies with canned responses in order.
    struct Scripted {
        replies: Mutex<VecDeque<std::result::Result<String, ModelError>>>,
        delay: Option<Duration>,
    }

    impl Scripted {
        fn new(replies: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
                delay: None,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::new()),
                delay: Some(delay),
            })
        }
    }

    #[async_trait]
    impl ModelClient for Scripted {
        async fn complete(
            &self,
            _prompt: &str,
            _cancel: CancellationToken,
        ) -> std::result::Result<String, ModelError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::other("script exhausted")))
        }

        async fn chat(
            &self,
            messages: &[ChatMessage],
            cancel: CancellationToken,
        ) -> std::result::Result<String, ModelError> {
            self.complete(&messages[0].content, cancel).await
        }
    }

    fn planner(model: Arc<dyn ModelClient>) -> Planner {
        Planner::new(model, ToolRegistry::with_builtins(), PlannerConfig::default())
    }

    #[tokio::test]
    async fn test_create_plan_sorts_and_estimates() {
        let model = Scripted::new(vec![
            r#"{"task_type": "data"}"#,
            r#"[
                {"id": "report", "type": "model", "dependsOn": ["a", "b"], "retryable": false, "timeout": 1000},
                {"id": "a", "type": "tool", "tool": "echo", "params": {"value": 1}, "retryable": false, "timeout": 1000},
                {"id": "b", "type": "tool", "tool": "echo", "params": {"value": 2}, "dependsOn": ["nope"], "retryable": false, "timeout": 1000}
            ]"#,
        ]);
        let plan = planner(model)
            .create_plan("Add numbers", &Value::Null, &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "report"]);
        assert!(plan.steps[1].depends_on.is_empty());
        assert_eq!(plan.estimated_duration_ms, 3000);
        assert_eq!(plan.metadata.analysis.unwrap().task_type, "data");
    }

    #[tokio::test]
    async fn test_unparsable_analysis_uses_default() {
        let model = Scripted::new(vec!["I think it is a data task", r#"[{"id": "x"}]"#]);
        let plan = planner(model)
            .create_plan("t", &Value::Null, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.metadata.analysis, Some(TaskAnalysis::conservative()));
        assert_eq!(plan.steps[0].kind, StepKind::Model);
    }

    #[tokio::test]
    async fn test_unparsable_steps_is_planning_error() {
        let model = Scripted::new(vec!["{}", "no idea"]);
        let err = planner(model)
            .create_plan("t", &Value::Null, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Planning(_)));
    }

    #[tokio::test]
    async fn test_cycle_rejected_at_creation() {
        let model = Scripted::new(vec![
            "{}",
            r#"[{"id": "a", "dependsOn": ["b"]}, {"id": "b", "dependsOn": ["a"]}]"#,
        ]);
        let err = planner(model)
            .create_plan("t", &Value::Null, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Validation(crate::ValidationError::DependencyCycle { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected() {
        let model = Scripted::new(vec!["{}", r#"[{"type": "tool", "tool": "rm_rf"}]"#]);
        let err = planner(model)
            .create_plan("t", &Value::Null, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Validation(crate::ValidationError::UnknownTool { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_timeout_is_planning_error() {
        let config = PlannerConfig {
            analysis_timeout_ms: 100,
            ..Default::default()
        };
        let planner = Planner::new(
            Scripted::slow(Duration::from_secs(10)),
            ToolRegistry::new(),
            config,
        );
        let err = planner
            .create_plan("t", &Value::Null, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Planning(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_replan_keeps_prefix_and_lineage() {
        let original = Plan::new(
            "t",
            vec![
                Step::tool("a", "echo"),
                Step::model("b").depends_on(["a"]),
                Step::model("c").depends_on(["b"]),
            ],
        );
        let model = Scripted::new(vec![
            r#"[{"id": "a"}, {"id": "b2", "dependsOn": ["a"]}, {"id": "c2", "dependsOn": ["b2"]}]"#,
        ]);
        let mut completed = Map::new();
        completed.insert("a".to_string(), json!("A"));

        let plan = planner(model)
            .replan(
                &original,
                &original.steps[1],
                "model down",
                &completed,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b2", "c2"]);
        assert_eq!(plan.metadata.version, 2);
        let lineage = plan.metadata.replan.unwrap();
        assert_eq!(lineage.parent_plan_id, original.id);
        assert_eq!(lineage.failed_step_id, "b");
        assert_eq!(lineage.reason, "model down");
    }

    #[tokio::test]
    async fn test_replan_parse_failure() {
        let original = Plan::new("t", vec![Step::model("a")]);
        let err = planner(Scripted::new(vec!["sorry"]))
            .replan(
                &original,
                &original.steps[0],
                "boom",
                &Map::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Planning(_)));
    }

    #[test]
    fn test_modification_helpers_reoptimize() {
        let planner = planner(Scripted::new(vec![]));
        let plan = planner
            .finalize(Plan::new("t", vec![Step::model("a"), Step::model("b")]))
            .unwrap();

        let inserted = planner
            .insert_step(&plan, Step::model("first").depends_on(["b"]), Some(0))
            .unwrap();
        let ids: Vec<&str> = inserted.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "first"]);
        assert!(inserted.metadata.modified);
        assert_ne!(inserted.id, plan.id);

        let removed = planner.remove_step(&inserted, "b").unwrap();
        assert!(removed.step("first").unwrap().depends_on.is_empty());

        let updated = planner
            .update_step(&removed, "a", |s| s.timeout_ms = 5)
            .unwrap();
        assert_eq!(updated.step("a").unwrap().timeout_ms, 5);
        assert!(planner.remove_step(&plan, "missing").is_err());
    }
}
