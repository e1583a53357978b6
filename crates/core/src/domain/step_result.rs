use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Final status of a recorded step.
///
/// Running and pending are transient and never recorded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,
    /// Present only on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Present only on failed/cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Retries actually consumed
    pub retries: u32,
}

impl StepResult {
    pub fn success(
        step_id: impl Into<String>,
        step_name: impl Into<String>,
        output: Value,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        retries: u32,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            step_name: step_name.into(),
            status: StepStatus::Success,
            output: Some(output),
            error: None,
            started_at,
            ended_at: Utc::now(),
            duration_ms,
            retries,
        }
    }

    pub fn failed(
        step_id: impl Into<String>,
        step_name: impl Into<String>,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        retries: u32,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            step_name: step_name.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
            started_at,
            ended_at: Utc::now(),
            duration_ms,
            retries,
        }
    }

    pub fn cancelled(
        step_id: impl Into<String>,
        step_name: impl Into<String>,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        retries: u32,
    ) -> Self {
        Self {
            status: StepStatus::Cancelled,
            ..Self::failed(step_id, step_name, error, started_at, duration_ms, retries)
        }
    }

    /// Synthetic result for a step that was never handed to the executor.
    pub fn skipped(step_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            step_name: step_name.into(),
            status: StepStatus::Skipped,
            output: None,
            error: None,
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            retries: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}
