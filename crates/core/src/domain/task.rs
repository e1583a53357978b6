use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;
use crate::{Plan, StepResult, StepStatus};

/// Lifecycle state of one in-flight task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Idle,
    Planning,
    Executing,
    Waiting,
    Complete,
    Error,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Waiting => "waiting",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "planning" => Some(Self::Planning),
            "executing" => Some(Self::Executing),
            "waiting" => Some(Self::Waiting),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// States from which a captured checkpoint can be resumed.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Executing | Self::Waiting)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CoreError::UnknownState(s.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    #[serde(default)]
    pub input: Value,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            input,
            state: TaskState::default(),
            started_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }
}

/// Persisted history of one task run.
///
/// Written by the agent whenever the run makes durable progress and read
/// back when a task is resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub plan: Option<Plan>,
    /// Plans that were replaced by a replan or an explicit modification.
    #[serde(default)]
    pub plan_versions: Vec<Plan>,
    #[serde(default)]
    pub results: Vec<StepResult>,
    pub error: Option<String>,
    pub failed_step: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            plan: None,
            plan_versions: Vec::new(),
            results: Vec::new(),
            error: None,
            failed_step: None,
            updated_at: Utc::now(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.task.state
    }

    /// A record in `Idle` was cancelled; records are only created on start.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.task.state,
            TaskState::Complete | TaskState::Error | TaskState::Idle
        )
    }

    /// Replace the active plan, keeping the previous one as a prior version.
    pub fn replace_plan(&mut self, plan: Plan) {
        if let Some(previous) = self.plan.replace(plan) {
            self.plan_versions.push(previous);
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Aggregate counts over the step results of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub duration_ms: u64,
}

impl TaskSummary {
    pub fn from_results(results: &[StepResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match result.status {
                StepStatus::Success => summary.succeeded += 1,
                StepStatus::Failed => summary.failed += 1,
                StepStatus::Skipped => summary.skipped += 1,
                StepStatus::Cancelled => summary.cancelled += 1,
            }
            summary.duration_ms += result.duration_ms;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_creation() {
        let task = Task::new("Summarize the report", json!({"path": "report.md"}));

        assert_eq!(task.description, "Summarize the report");
        assert_eq!(task.state, TaskState::Idle);
        assert_eq!(task.input["path"], "report.md");
    }

    #[test]
    fn test_task_state_round_trip_names() {
        assert_eq!(TaskState::Executing.as_str(), "executing");
        assert_eq!(TaskState::parse("waiting"), Some(TaskState::Waiting));
        assert_eq!(TaskState::parse("invalid"), None);
        assert!("bogus".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_resumable_states() {
        assert!(TaskState::Executing.is_resumable());
        assert!(TaskState::Waiting.is_resumable());
        assert!(!TaskState::Complete.is_resumable());
        assert!(!TaskState::Error.is_resumable());
        assert!(!TaskState::Idle.is_resumable());
    }

    #[test]
    fn test_record_keeps_plan_versions() {
        let mut record = TaskRecord::new(Task::new("t", Value::Null));
        record.replace_plan(Plan::new("t", Vec::new()));
        assert!(record.plan_versions.is_empty());

        record.replace_plan(Plan::new("t", Vec::new()));
        assert_eq!(record.plan_versions.len(), 1);
    }

    #[test]
    fn test_summary_counts() {
        let results = vec![
            StepResult::skipped("a", "A"),
            StepResult::skipped("b", "B"),
        ];
        let summary = TaskSummary::from_results(&results);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.succeeded, 0);
    }
}
