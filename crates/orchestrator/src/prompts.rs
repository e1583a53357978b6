use serde_json::{Map, Value};
use taskpilot_core::{Plan, Step, TaskAnalysis};

use crate::services::ToolDescriptor;

pub struct PlannerPrompts;

impl PlannerPrompts {
    pub fn analysis(description: &str, context: &Value) -> String {
        format!(
            r#"Analyze the following task before it is broken into steps.

## Task
{description}

## Context
{context}

## Required Output
Respond with a single JSON object and nothing else:
{{
  "task_type": "short classification, e.g. research, data, automation",
  "resources": ["resources or inputs the task needs"],
  "risks": ["things that could go wrong"],
  "confirmation_points": ["actions that need a human to confirm first"]
}}"#,
            description = description,
            context = render_json(context),
        )
    }

    pub fn generation(
        description: &str,
        context: &Value,
        analysis: &TaskAnalysis,
        tools: &[ToolDescriptor],
        max_steps: usize,
    ) -> String {
        format!(
            r#"Break the following task into an executable plan.

## Task
{description}

## Context
{context}

## Analysis
{analysis}

## Available Tools
{tools}

## Required Output
Respond with a JSON array of at most {max_steps} steps and nothing else.
Each step is an object:
{{
  "id": "unique id, e.g. step_1",
  "name": "short name",
  "description": "what the step does",
  "type": "tool | model | condition | loop | parallel",
  "tool": "tool name (tool steps only)",
  "params": {{}},
  "dependsOn": ["ids of steps whose output this step needs"],
  "retryable": true,
  "maxRetries": 3,
  "timeout": 30000,
  "requiresConfirmation": false,
  "expression": "boolean expression (condition steps only)",
  "steps": []
}}

Parameters may reference earlier outputs with `{{{{step_id}}}}` or `{{{{step_id.field}}}}`.
Only use tools from the list above."#,
            description = description,
            context = render_json(context),
            analysis = render_json(&serde_json::to_value(analysis).unwrap_or_default()),
            tools = render_tools(tools),
            max_steps = max_steps,
        )
    }

    pub fn replan(
        plan: &Plan,
        failed_step: &Step,
        error: &str,
        completed: &Map<String, Value>,
        tools: &[ToolDescriptor],
    ) -> String {
        let remaining: Vec<&str> = plan
            .index_of(&failed_step.id)
            .map(|i| plan.steps[i..].iter().map(|s| s.id.as_str()).collect())
            .unwrap_or_default();

        format!(
            r#"A step of the plan below failed. Produce replacement steps for the remaining work.

## Task
{description}

## Failed Step
**Id:** {step_id}
**Name:** {step_name}
**Error:** {error}

## Completed Outputs
{completed}

## Steps Not Yet Done
{remaining}

## Available Tools
{tools}

## Required Output
Respond with a JSON array of steps in the same format as the original plan.
Do not repeat steps that already completed; their outputs are available
through `{{{{step_id}}}}` references."#,
            description = plan.task_description,
            step_id = failed_step.id,
            step_name = failed_step.name,
            error = error,
            completed = render_json(&Value::Object(completed.clone())),
            remaining = remaining.join(", "),
            tools = render_tools(tools),
        )
    }
}

fn render_json(value: &Value) -> String {
    match value {
        Value::Null => "(none)".to_string(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn render_tools(tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return "(no tools registered; use model steps)".to_string();
    }

    tools
        .iter()
        .map(|tool| {
            let params: Vec<String> = tool
                .params
                .iter()
                .map(|p| {
                    format!(
                        "{}: {:?}{}",
                        p.name,
                        p.kind,
                        if p.required { "" } else { " (optional)" }
                    )
                })
                .collect();
            format!(
                "- **{}** [{}]: {} ({})",
                tool.name,
                tool.category,
                tool.description,
                params.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ToolRegistry;
    use serde_json::json;

    #[test]
    fn test_analysis_prompt_contains_task() {
        let prompt = PlannerPrompts::analysis("Summarize logs", &json!({"dir": "/var/log"}));
        assert!(prompt.contains("Summarize logs"));
        assert!(prompt.contains("/var/log"));
        assert!(prompt.contains("confirmation_points"));
    }

    #[test]
    fn test_generation_prompt_lists_tools() {
        let tools = ToolRegistry::with_builtins().descriptors();
        let prompt = PlannerPrompts::generation(
            "Do things",
            &Value::Null,
            &TaskAnalysis::conservative(),
            &tools,
            10,
        );
        assert!(prompt.contains("**echo**"));
        assert!(prompt.contains("at most 10 steps"));
        assert!(prompt.contains("{{step_id}}"));
    }

    #[test]
    fn test_replan_prompt_contains_failure() {
        let plan = Plan::new(
            "Fetch and report",
            vec![Step::tool("fetch", "echo"), Step::model("report")],
        );
        let prompt = PlannerPrompts::replan(
            &plan,
            &plan.steps[1],
            "model unavailable",
            &Map::new(),
            &[],
        );
        assert!(prompt.contains("model unavailable"));
        assert!(prompt.contains("**Id:** report"));
        assert!(prompt.contains("Steps Not Yet Done\nreport"));
    }
}
