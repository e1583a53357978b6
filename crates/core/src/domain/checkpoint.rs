use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{StepResult, TaskState};

/// Snapshot of a run's progress, enough to continue it in a fresh process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub task_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub state: TaskState,
    /// Index of the most recently recorded step
    pub cursor: usize,
    pub variables: Map<String, Value>,
    pub results: Vec<StepResult>,
    pub can_resume: bool,
    pub expires_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn capture(
        task_id: Uuid,
        state: TaskState,
        cursor: usize,
        variables: Map<String, Value>,
        results: Vec<StepResult>,
        ttl: Duration,
    ) -> Self {
        let timestamp = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            timestamp,
            state,
            cursor,
            variables,
            results,
            can_resume: state.is_resumable(),
            expires_at: timestamp + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_resume_follows_state() {
        let task_id = Uuid::new_v4();
        let executing = Checkpoint::capture(
            task_id,
            TaskState::Executing,
            0,
            Map::new(),
            Vec::new(),
            Duration::hours(1),
        );
        assert!(executing.can_resume);

        let complete = Checkpoint::capture(
            task_id,
            TaskState::Complete,
            0,
            Map::new(),
            Vec::new(),
            Duration::hours(1),
        );
        assert!(!complete.can_resume);
    }

    #[test]
    fn test_expiry() {
        let checkpoint = Checkpoint::capture(
            Uuid::new_v4(),
            TaskState::Waiting,
            2,
            Map::new(),
            Vec::new(),
            Duration::seconds(10),
        );
        assert!(!checkpoint.is_expired(checkpoint.timestamp));
        assert!(checkpoint.is_expired(checkpoint.timestamp + Duration::seconds(11)));
    }
}
