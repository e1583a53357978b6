use std::collections::HashSet;
use taskpilot_core::{Plan, Step, StepKind};

use crate::error::ValidationError;
use crate::services::ToolRegistry;

/// Check a plan against the step limit and tool catalogue.
///
/// Child steps of loops and parallel groups are checked for tool references
/// but do not count towards the step limit.
pub fn validate_plan(
    plan: &Plan,
    max_steps: usize,
    tools: &ToolRegistry,
) -> Result<(), ValidationError> {
    if plan.is_empty() {
        return Err(ValidationError::EmptyPlan);
    }
    if plan.len() > max_steps {
        return Err(ValidationError::TooManySteps {
            count: plan.len(),
            max: max_steps,
        });
    }

    let ids: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
    if ids.len() != plan.len() {
        let mut seen = HashSet::new();
        if let Some(dup) = plan.steps.iter().find(|s| !seen.insert(s.id.as_str())) {
            return Err(ValidationError::DuplicateStepId(dup.id.clone()));
        }
    }

    for step in &plan.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(ValidationError::DanglingDependency {
                    step_id: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        check_tools(step, tools)?;
    }

    Ok(())
}

fn check_tools(step: &Step, tools: &ToolRegistry) -> Result<(), ValidationError> {
    if let StepKind::Tool { tool } = &step.kind {
        if tool.trim().is_empty() {
            return Err(ValidationError::MissingToolReference(step.id.clone()));
        }
        if !tools.contains(tool) {
            return Err(ValidationError::UnknownTool {
                step_id: step.id.clone(),
                tool: tool.clone(),
            });
        }
    }
    step.children()
        .iter()
        .try_for_each(|child| check_tools(child, tools))
}

/// Sum of step timeouts, with retryable steps weighted by 1.5.
pub fn estimate_duration_ms(steps: &[Step]) -> u64 {
    steps
        .iter()
        .map(|step| {
            if step.retryable {
                step.timeout_ms.saturating_mul(3) / 2
            } else {
                step.timeout_ms
            }
        })
        .fold(0u64, u64::saturating_add)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> ToolRegistry {
        ToolRegistry::with_builtins()
    }

    #[test]
    fn test_valid_plan_passes() {
        let plan = Plan::new(
            "t",
            vec![Step::tool("a", "echo"), Step::model("b").depends_on(["a"])],
        );
        assert!(validate_plan(&plan, 10, &registry()).is_ok());
    }

    #[test]
    fn test_too_many_steps() {
        let plan = Plan::new("t", (0..3).map(|i| Step::model(format!("s{}", i))).collect());
        assert_eq!(
            validate_plan(&plan, 2, &registry()),
            Err(ValidationError::TooManySteps { count: 3, max: 2 })
        );
    }

    #[test]
    fn test_unknown_tool_in_nested_child() {
        let plan = Plan::new(
            "t",
            vec![Step::parallel("g", vec![Step::tool("x", "teleport")])],
        );
        assert_eq!(
            validate_plan(&plan, 10, &registry()),
            Err(ValidationError::UnknownTool {
                step_id: "x".to_string(),
                tool: "teleport".to_string()
            })
        );
    }

    #[test]
    fn test_missing_tool_reference() {
        let plan = Plan::new("t", vec![Step::tool("a", "")]);
        assert_eq!(
            validate_plan(&plan, 10, &registry()),
            Err(ValidationError::MissingToolReference("a".to_string()))
        );
    }

    #[test]
    fn test_dangling_dependency() {
        let plan = Plan::new("t", vec![Step::model("a").depends_on(["zzz"])]);
        assert!(matches!(
            validate_plan(&plan, 10, &registry()),
            Err(ValidationError::DanglingDependency { .. })
        ));
    }

    #[test]
    fn test_empty_plan() {
        let plan = Plan::new("t", vec![]);
        assert_eq!(validate_plan(&plan, 10, &registry()), Err(ValidationError::EmptyPlan));
    }

    #[test]
    fn test_estimate_weights_retryable_steps() {
        let steps = vec![
            Step::model("a").with_timeout(Duration::from_millis(1000)),
            Step::model("b")
                .with_timeout(Duration::from_millis(1000))
                .with_retries(2),
        ];
        assert_eq!(estimate_duration_ms(&steps), 2500);
    }
}
