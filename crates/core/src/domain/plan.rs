use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Step;

/// Structured pre-planning analysis of a task description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAnalysis {
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub confirmation_points: Vec<String>,
}

fn default_task_type() -> String {
    "general".to_string()
}

impl TaskAnalysis {
    /// Used when the analysis response cannot be parsed.
    pub fn conservative() -> Self {
        Self {
            task_type: default_task_type(),
            resources: Vec::new(),
            risks: vec!["analysis unavailable".to_string()],
            confirmation_points: Vec::new(),
        }
    }
}

impl Default for TaskAnalysis {
    fn default() -> Self {
        Self::conservative()
    }
}

/// Where a replanned plan came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplanLineage {
    pub parent_plan_id: Uuid,
    pub failed_step_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub analysis: Option<TaskAnalysis>,
    #[serde(default)]
    pub replan: Option<ReplanLineage>,
    #[serde(default)]
    pub modified: bool,
    #[serde(default = "default_version")]
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl Default for PlanMetadata {
    fn default() -> Self {
        Self {
            analysis: None,
            replan: None,
            modified: false,
            version: default_version(),
            created_at: Utc::now(),
        }
    }
}

/// Dependency-ordered sequence of steps for one task.
///
/// Step order is execution order. Plans are not edited in place; the
/// planner's modification helpers return a new plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub task_description: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub estimated_duration_ms: u64,
    #[serde(default)]
    pub metadata: PlanMetadata,
}

impl Plan {
    pub fn new(task_description: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_description: task_description.into(),
            steps,
            estimated_duration_ms: 0,
            metadata: PlanMetadata::default(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Derive a successor plan with the same lineage but a new identity.
    pub fn successor(&self, steps: Vec<Step>) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.version = self.metadata.version + 1;
        metadata.created_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_description: self.task_description.clone(),
            steps,
            estimated_duration_ms: 0,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_lookup() {
        let plan = Plan::new("t", vec![Step::model("a"), Step::model("b")]);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.index_of("b"), Some(1));
        assert!(plan.step("c").is_none());
    }

    #[test]
    fn test_successor_bumps_version() {
        let plan = Plan::new("t", vec![Step::model("a")]);
        let next = plan.successor(vec![]);
        assert_ne!(next.id, plan.id);
        assert_eq!(next.metadata.version, plan.metadata.version + 1);
        assert_eq!(next.task_description, "t");
    }

    #[test]
    fn test_analysis_defaults_when_fields_missing() {
        let analysis: TaskAnalysis = serde_json::from_str("{}").unwrap();
        assert_eq!(analysis.task_type, "general");
        assert!(analysis.risks.is_empty());
        assert!(!TaskAnalysis::conservative().risks.is_empty());
    }
}
