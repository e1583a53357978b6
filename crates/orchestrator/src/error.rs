use thiserror::Error;
use uuid::Uuid;

/// Reasons a plan is rejected before any step runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Plan has no steps")]
    EmptyPlan,

    #[error("Plan has {count} steps, maximum is {max}")]
    TooManySteps { count: usize, max: usize },

    #[error("Step {step_id} references unknown tool '{tool}'")]
    UnknownTool { step_id: String, tool: String },

    #[error("Tool step {0} has no tool reference")]
    MissingToolReference(String),

    #[error("Dependency cycle detected among steps: {}", .steps.join(", "))]
    DependencyCycle { steps: Vec<String> },

    #[error("Step {step_id} depends on missing step {dependency}")]
    DanglingDependency { step_id: String, dependency: String },

    #[error("Duplicate step id: {0}")]
    DuplicateStepId(String),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Plan validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Step {step_id} timed out after {timeout_ms}ms")]
    StepTimeout { step_id: String, timeout_ms: u64 },

    #[error("Step {step_id} failed: {message}")]
    StepExecution { step_id: String, message: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Cannot resume task: {0}")]
    Resume(String),

    #[error("Invalid state transition from {from} on {trigger}")]
    InvalidTransition { from: String, trigger: String },

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("No active task")]
    NoActiveTask,

    #[error("Agent is busy with task {0}")]
    TaskBusy(Uuid),

    #[error("Storage error: {0}")]
    Storage(#[from] db::DbError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    pub fn planning(reason: impl Into<String>) -> Self {
        Self::Planning(reason.into())
    }

    pub fn resume(reason: impl Into<String>) -> Self {
        Self::Resume(reason.into())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
