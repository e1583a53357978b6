//! Event types emitted by the orchestration engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope wrapping all events with metadata.
///
/// Serializes as `{id, timestamp, type, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    #[serde(flatten)]
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All events published by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// Free-form status line for observers
    #[serde(rename = "status")]
    Status { task_id: Uuid, message: String },

    #[serde(rename = "plan-created")]
    PlanCreated { task_id: Uuid, plan: Value },

    /// The active plan was replaced (replan or modification)
    #[serde(rename = "plan-updated")]
    PlanUpdated {
        task_id: Uuid,
        plan: Value,
        reason: String,
    },

    #[serde(rename = "step-start")]
    StepStart {
        task_id: Uuid,
        step_id: String,
        step_name: String,
        index: usize,
        total: usize,
    },

    /// Intermediate progress inside a step (retry, loop iteration, child)
    #[serde(rename = "step-progress")]
    StepProgress {
        task_id: Uuid,
        step_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
    },

    #[serde(rename = "step-complete")]
    StepComplete {
        task_id: Uuid,
        step_id: String,
        status: String,
        result: Value,
    },

    #[serde(rename = "step-error")]
    StepError {
        task_id: Uuid,
        step_id: String,
        error: String,
    },

    #[serde(rename = "task-complete")]
    TaskComplete {
        task_id: Uuid,
        output: Option<Value>,
        summary: Value,
    },

    #[serde(rename = "task-error")]
    TaskError {
        task_id: Uuid,
        error: String,
        failed_step: Option<String>,
    },

    #[serde(rename = "waiting-for-confirmation")]
    WaitingForConfirmation {
        task_id: Uuid,
        step_id: String,
        reason: String,
    },

    #[serde(rename = "state-transition")]
    StateTransition {
        task_id: Option<Uuid>,
        from: String,
        to: String,
        trigger: String,
    },
}

impl Event {
    /// Wire name of this event, as it appears in the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Status { .. } => "status",
            Event::PlanCreated { .. } => "plan-created",
            Event::PlanUpdated { .. } => "plan-updated",
            Event::StepStart { .. } => "step-start",
            Event::StepProgress { .. } => "step-progress",
            Event::StepComplete { .. } => "step-complete",
            Event::StepError { .. } => "step-error",
            Event::TaskComplete { .. } => "task-complete",
            Event::TaskError { .. } => "task-error",
            Event::WaitingForConfirmation { .. } => "waiting-for-confirmation",
            Event::StateTransition { .. } => "state-transition",
        }
    }

    /// Get the task ID associated with this event, if any
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Event::Status { task_id, .. }
            | Event::PlanCreated { task_id, .. }
            | Event::PlanUpdated { task_id, .. }
            | Event::StepStart { task_id, .. }
            | Event::StepProgress { task_id, .. }
            | Event::StepComplete { task_id, .. }
            | Event::StepError { task_id, .. }
            | Event::TaskComplete { task_id, .. }
            | Event::TaskError { task_id, .. }
            | Event::WaitingForConfirmation { task_id, .. } => Some(*task_id),
            Event::StateTransition { task_id, .. } => *task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_envelope_creation() {
        let event = Event::Status {
            task_id: Uuid::new_v4(),
            message: "planning".to_string(),
        };
        let envelope = EventEnvelope::new(event);

        assert!(!envelope.id.is_nil());
        assert!(envelope.timestamp <= Utc::now());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let task_id = Uuid::new_v4();
        let envelope = EventEnvelope::new(Event::StepError {
            task_id,
            step_id: "fetch".to_string(),
            error: "timed out".to_string(),
        });

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "step-error");
        assert_eq!(value["data"]["step_id"], "fetch");
        assert_eq!(value["data"]["task_id"], json!(task_id.to_string()));
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"waiting-for-confirmation","data":{"task_id":"550e8400-e29b-41d4-a716-446655440000","step_id":"deploy","reason":"needs approval"}}"#;
        let event: Event = serde_json::from_str(json).unwrap();

        match event {
            Event::WaitingForConfirmation { step_id, reason, .. } => {
                assert_eq!(step_id, "deploy");
                assert_eq!(reason, "needs approval");
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let event = Event::StateTransition {
            task_id: None,
            from: "idle".to_string(),
            to: "planning".to_string(),
            trigger: "start_task".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.kind());
        assert_eq!(event.task_id(), None);
    }

    #[test]
    fn test_event_task_id() {
        let task_id = Uuid::new_v4();
        let event = Event::TaskError {
            task_id,
            error: "boom".to_string(),
            failed_step: Some("s1".to_string()),
        };
        assert_eq!(event.task_id(), Some(task_id));
    }
}
