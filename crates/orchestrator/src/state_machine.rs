//! Task lifecycle state machine.
//!
//! A static transition table keyed by `(state, trigger)`. Each entry may
//! carry a guard and an effect. [`TaskStateMachine::dispatch`] is total: an
//! unmatched trigger is rejected and a failing guard blocks, both without
//! touching the machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskpilot_core::{Plan, StepResult, TaskState};
use tracing::{debug, info};
use uuid::Uuid;

use events::{Event, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    StartTask,
    PlanReady,
    PlanFailed,
    StepComplete,
    NeedConfirmation,
    ExecutionFailed,
    UserConfirmed,
    UserRejected,
    Cancel,
    Reset,
    Retry,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartTask => "start_task",
            Self::PlanReady => "plan_ready",
            Self::PlanFailed => "plan_failed",
            Self::StepComplete => "step_complete",
            Self::NeedConfirmation => "need_confirmation",
            Self::ExecutionFailed => "execution_failed",
            Self::UserConfirmed => "user_confirmed",
            Self::UserRejected => "user_rejected",
            Self::Cancel => "cancel",
            Self::Reset => "reset",
            Self::Retry => "retry",
        }
    }
}

/// A trigger together with its payload.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// `task_id` of `None` lets the machine assign a fresh id
    StartTask { task_id: Option<Uuid> },
    PlanReady { plan: Option<Plan> },
    PlanFailed { error: String },
    StepComplete { result: StepResult },
    NeedConfirmation { step_id: String, reason: String },
    ExecutionFailed {
        error: String,
        result: Option<StepResult>,
    },
    UserConfirmed { data: Option<Value> },
    UserRejected { reason: Option<String> },
    Cancel,
    Reset,
    Retry,
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Self::StartTask { .. } => TriggerKind::StartTask,
            Self::PlanReady { .. } => TriggerKind::PlanReady,
            Self::PlanFailed { .. } => TriggerKind::PlanFailed,
            Self::StepComplete { .. } => TriggerKind::StepComplete,
            Self::NeedConfirmation { .. } => TriggerKind::NeedConfirmation,
            Self::ExecutionFailed { .. } => TriggerKind::ExecutionFailed,
            Self::UserConfirmed { .. } => TriggerKind::UserConfirmed,
            Self::UserRejected { .. } => TriggerKind::UserRejected,
            Self::Cancel => TriggerKind::Cancel,
            Self::Reset => TriggerKind::Reset,
            Self::Retry => TriggerKind::Retry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingInfo {
    pub step_id: String,
    pub reason: String,
}

/// Data the machine owns alongside its state.
#[derive(Debug, Clone, Default)]
pub struct MachineContext {
    pub task_id: Option<Uuid>,
    pub plan: Option<Plan>,
    pub cursor: usize,
    pub results: Vec<StepResult>,
    pub error: Option<String>,
    pub failed_result: Option<StepResult>,
    pub waiting: Option<WaitingInfo>,
    pub confirmation: Option<Value>,
}

impl MachineContext {
    fn plan_len(&self) -> usize {
        self.plan.as_ref().map_or(0, Plan::len)
    }

    fn is_last_step(&self) -> bool {
        self.cursor + 1 >= self.plan_len()
    }
}

type Guard = fn(&MachineContext, &Trigger) -> bool;
type Effect = fn(&mut MachineContext, Trigger);

struct Transition {
    from: TaskState,
    trigger: TriggerKind,
    to: TaskState,
    guard: Option<Guard>,
    effect: Option<Effect>,
}

const fn transition(
    from: TaskState,
    trigger: TriggerKind,
    to: TaskState,
    guard: Option<Guard>,
    effect: Option<Effect>,
) -> Transition {
    Transition {
        from,
        trigger,
        to,
        guard,
        effect,
    }
}

fn plan_has_steps(_: &MachineContext, trigger: &Trigger) -> bool {
    matches!(trigger, Trigger::PlanReady { plan: Some(plan) } if !plan.is_empty())
}

fn not_last_step(ctx: &MachineContext, _: &Trigger) -> bool {
    !ctx.is_last_step()
}

fn last_step(ctx: &MachineContext, _: &Trigger) -> bool {
    ctx.is_last_step()
}

fn start_task(ctx: &mut MachineContext, trigger: Trigger) {
    let task_id = match trigger {
        Trigger::StartTask { task_id } => task_id,
        _ => None,
    };
    *ctx = MachineContext {
        task_id: Some(task_id.unwrap_or_else(Uuid::new_v4)),
        ..Default::default()
    };
}

fn accept_plan(ctx: &mut MachineContext, trigger: Trigger) {
    if let Trigger::PlanReady { plan } = trigger {
        ctx.plan = plan;
    }
    ctx.cursor = 0;
}

fn record_error(ctx: &mut MachineContext, trigger: Trigger) {
    match trigger {
        Trigger::PlanFailed { error } => ctx.error = Some(error),
        Trigger::ExecutionFailed { error, result } => {
            ctx.error = Some(error);
            ctx.failed_result = result;
        }
        Trigger::UserRejected { reason } => {
            ctx.error = Some(reason.unwrap_or_else(|| "Rejected by user".to_string()));
        }
        _ => {}
    }
}

fn append_and_advance(ctx: &mut MachineContext, trigger: Trigger) {
    append_result(ctx, trigger);
    ctx.cursor += 1;
}

fn append_result(ctx: &mut MachineContext, trigger: Trigger) {
    if let Trigger::StepComplete { result } = trigger {
        ctx.results.push(result);
    }
}

fn enter_waiting(ctx: &mut MachineContext, trigger: Trigger) {
    if let Trigger::NeedConfirmation { step_id, reason } = trigger {
        ctx.waiting = Some(WaitingInfo { step_id, reason });
    }
}

fn leave_waiting(ctx: &mut MachineContext, trigger: Trigger) {
    ctx.waiting = None;
    if let Trigger::UserConfirmed { data } = trigger {
        ctx.confirmation = data;
    }
}

fn reject_waiting(ctx: &mut MachineContext, trigger: Trigger) {
    ctx.waiting = None;
    record_error(ctx, trigger);
}

fn clear_for_retry(ctx: &mut MachineContext, _: Trigger) {
    ctx.error = None;
    ctx.failed_result = None;
    ctx.plan = None;
    ctx.cursor = 0;
    ctx.results.clear();
}

use TaskState as S;
use TriggerKind as T;

static TRANSITIONS: &[Transition] = &[
    transition(S::Idle, T::StartTask, S::Planning, None, Some(start_task)),
    transition(S::Planning, T::PlanReady, S::Executing, Some(plan_has_steps), Some(accept_plan)),
    transition(S::Planning, T::PlanFailed, S::Error, None, Some(record_error)),
    transition(S::Planning, T::Cancel, S::Idle, None, None),
    transition(S::Executing, T::StepComplete, S::Executing, Some(not_last_step), Some(append_and_advance)),
    transition(S::Executing, T::StepComplete, S::Complete, Some(last_step), Some(append_result)),
    transition(S::Executing, T::NeedConfirmation, S::Waiting, None, Some(enter_waiting)),
    transition(S::Executing, T::ExecutionFailed, S::Error, None, Some(record_error)),
    transition(S::Executing, T::Cancel, S::Idle, None, None),
    transition(S::Waiting, T::UserConfirmed, S::Executing, None, Some(leave_waiting)),
    transition(S::Waiting, T::UserRejected, S::Error, None, Some(reject_waiting)),
    transition(S::Waiting, T::Cancel, S::Idle, None, None),
    transition(S::Complete, T::Reset, S::Idle, None, None),
    transition(S::Error, T::Reset, S::Idle, None, None),
    transition(S::Error, T::Retry, S::Planning, None, Some(clear_for_retry)),
];

/// Result of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Transitioned { from: TaskState, to: TaskState },
    /// No transition for this trigger in the current state
    Rejected,
    /// A transition exists but its guard failed
    Blocked,
}

impl DispatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Transitioned { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskState,
    pub to: TaskState,
    pub trigger: TriggerKind,
    pub at: DateTime<Utc>,
}

pub struct TaskStateMachine {
    state: TaskState,
    context: MachineContext,
    history: Vec<TransitionRecord>,
    event_bus: Option<EventBus>,
}

impl TaskStateMachine {
    pub fn new() -> Self {
        Self {
            state: TaskState::Idle,
            context: MachineContext::default(),
            history: Vec::new(),
            event_bus: None,
        }
    }

    /// Rebuild a machine at a known state, e.g. when resuming from a checkpoint.
    pub fn restore(state: TaskState, context: MachineContext) -> Self {
        Self {
            state,
            context,
            ..Self::new()
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn context(&self) -> &MachineContext {
        &self.context
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Triggers that have at least one transition out of the current state.
    pub fn available_triggers(&self) -> Vec<TriggerKind> {
        let mut kinds: Vec<TriggerKind> = Vec::new();
        for t in TRANSITIONS.iter().filter(|t| t.from == self.state) {
            if !kinds.contains(&t.trigger) {
                kinds.push(t.trigger);
            }
        }
        kinds
    }

    pub fn can_dispatch(&self, kind: TriggerKind) -> bool {
        TRANSITIONS
            .iter()
            .any(|t| t.from == self.state && t.trigger == kind)
    }

    pub fn dispatch(&mut self, trigger: Trigger) -> DispatchOutcome {
        let kind = trigger.kind();
        let candidates: Vec<&Transition> = TRANSITIONS
            .iter()
            .filter(|t| t.from == self.state && t.trigger == kind)
            .collect();

        if candidates.is_empty() {
            debug!(
                state = %self.state,
                trigger = kind.as_str(),
                "Trigger rejected"
            );
            return DispatchOutcome::Rejected;
        }

        let Some(selected) = candidates
            .into_iter()
            .find(|t| t.guard.map_or(true, |guard| guard(&self.context, &trigger)))
        else {
            debug!(
                state = %self.state,
                trigger = kind.as_str(),
                "Transition blocked by guard"
            );
            return DispatchOutcome::Blocked;
        };

        let from = self.state;
        let to = selected.to;
        self.state = to;
        if let Some(effect) = selected.effect {
            effect(&mut self.context, trigger);
        }

        self.history.push(TransitionRecord {
            from,
            to,
            trigger: kind,
            at: Utc::now(),
        });

        info!(
            task_id = ?self.context.task_id,
            from = %from,
            to = %to,
            trigger = kind.as_str(),
            "Task state transition"
        );

        if let Some(ref bus) = self.event_bus {
            bus.emit(Event::StateTransition {
                task_id: self.context.task_id,
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
                trigger: kind.as_str().to_string(),
            });
        }

        DispatchOutcome::Transitioned { from, to }
    }

    /// Swap the active plan without a transition, keeping cursor and results.
    pub fn replace_plan(&mut self, plan: Plan) {
        self.context.plan = Some(plan);
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskpilot_core::Step;

    fn plan_of(n: usize) -> Plan {
        Plan::new(
            "test",
            (0..n).map(|i| Step::model(format!("s{}", i))).collect(),
        )
    }

    fn done(id: &str) -> Trigger {
        Trigger::StepComplete {
            result: StepResult::success(id, id, json!(null), Utc::now(), 0, 0),
        }
    }

    #[test]
    fn test_happy_path_sequence() {
        let mut machine = TaskStateMachine::new();
        assert_eq!(machine.state(), TaskState::Idle);

        assert!(machine.dispatch(Trigger::StartTask { task_id: None }).is_applied());
        assert_eq!(machine.state(), TaskState::Planning);
        assert!(machine.context().task_id.is_some());

        assert!(machine
            .dispatch(Trigger::PlanReady {
                plan: Some(plan_of(1))
            })
            .is_applied());
        assert_eq!(machine.state(), TaskState::Executing);
        assert_eq!(machine.context().cursor, 0);

        assert_eq!(
            machine.dispatch(done("s0")),
            DispatchOutcome::Transitioned {
                from: TaskState::Executing,
                to: TaskState::Complete
            }
        );
        assert!(machine.dispatch(Trigger::Reset).is_applied());

        let states: Vec<TaskState> = machine.history().iter().map(|r| r.to).collect();
        assert_eq!(
            states,
            vec![
                TaskState::Planning,
                TaskState::Executing,
                TaskState::Complete,
                TaskState::Idle
            ]
        );
    }

    #[test]
    fn test_unmatched_trigger_is_rejected_without_mutation() {
        let mut machine = TaskStateMachine::new();
        assert_eq!(machine.dispatch(Trigger::Reset), DispatchOutcome::Rejected);
        assert_eq!(machine.dispatch(done("x")), DispatchOutcome::Rejected);
        assert_eq!(machine.state(), TaskState::Idle);
        assert!(machine.history().is_empty());
        assert!(machine.context().results.is_empty());
    }

    #[test]
    fn test_plan_ready_guard_blocks_empty_plan() {
        let mut machine = TaskStateMachine::new();
        machine.dispatch(Trigger::StartTask { task_id: None });

        assert_eq!(
            machine.dispatch(Trigger::PlanReady { plan: None }),
            DispatchOutcome::Blocked
        );
        assert_eq!(
            machine.dispatch(Trigger::PlanReady {
                plan: Some(plan_of(0))
            }),
            DispatchOutcome::Blocked
        );
        assert_eq!(machine.state(), TaskState::Planning);
        assert_eq!(machine.history().len(), 1);
    }

    #[test]
    fn test_step_complete_advances_until_last() {
        let mut machine = TaskStateMachine::new();
        machine.dispatch(Trigger::StartTask { task_id: None });
        machine.dispatch(Trigger::PlanReady {
            plan: Some(plan_of(3)),
        });

        machine.dispatch(done("s0"));
        assert_eq!(machine.state(), TaskState::Executing);
        assert_eq!(machine.context().cursor, 1);

        machine.dispatch(done("s1"));
        assert_eq!(machine.context().cursor, 2);

        machine.dispatch(done("s2"));
        assert_eq!(machine.state(), TaskState::Complete);
        assert_eq!(machine.context().results.len(), 3);
    }

    #[test]
    fn test_confirmation_round_trip() {
        let mut machine = TaskStateMachine::new();
        machine.dispatch(Trigger::StartTask { task_id: None });
        machine.dispatch(Trigger::PlanReady {
            plan: Some(plan_of(2)),
        });

        machine.dispatch(Trigger::NeedConfirmation {
            step_id: "s0".to_string(),
            reason: "deletes files".to_string(),
        });
        assert_eq!(machine.state(), TaskState::Waiting);
        assert_eq!(machine.context().waiting.as_ref().unwrap().step_id, "s0");

        machine.dispatch(Trigger::UserConfirmed {
            data: Some(json!({"ok": true})),
        });
        assert_eq!(machine.state(), TaskState::Executing);
        assert!(machine.context().waiting.is_none());
        assert_eq!(machine.context().confirmation, Some(json!({"ok": true})));
    }

    #[test]
    fn test_rejection_records_error() {
        let mut machine = TaskStateMachine::new();
        machine.dispatch(Trigger::StartTask { task_id: None });
        machine.dispatch(Trigger::PlanReady {
            plan: Some(plan_of(1)),
        });
        machine.dispatch(Trigger::NeedConfirmation {
            step_id: "s0".to_string(),
            reason: "r".to_string(),
        });
        machine.dispatch(Trigger::UserRejected { reason: None });

        assert_eq!(machine.state(), TaskState::Error);
        assert_eq!(machine.context().error.as_deref(), Some("Rejected by user"));
    }

    #[test]
    fn test_retry_clears_run_state() {
        let mut machine = TaskStateMachine::new();
        machine.dispatch(Trigger::StartTask { task_id: None });
        machine.dispatch(Trigger::PlanReady {
            plan: Some(plan_of(2)),
        });
        machine.dispatch(done("s0"));
        machine.dispatch(Trigger::ExecutionFailed {
            error: "boom".to_string(),
            result: None,
        });
        assert_eq!(machine.state(), TaskState::Error);

        assert!(machine.dispatch(Trigger::Retry).is_applied());
        assert_eq!(machine.state(), TaskState::Planning);
        let ctx = machine.context();
        assert!(ctx.error.is_none());
        assert!(ctx.plan.is_none());
        assert!(ctx.results.is_empty());
        assert_eq!(ctx.cursor, 0);
    }

    #[test]
    fn test_cancel_from_every_active_state() {
        for setup in 0..3 {
            let mut machine = TaskStateMachine::new();
            machine.dispatch(Trigger::StartTask { task_id: None });
            if setup >= 1 {
                machine.dispatch(Trigger::PlanReady {
                    plan: Some(plan_of(2)),
                });
            }
            if setup == 2 {
                machine.dispatch(Trigger::NeedConfirmation {
                    step_id: "s0".to_string(),
                    reason: "r".to_string(),
                });
            }
            assert!(machine.dispatch(Trigger::Cancel).is_applied());
            assert_eq!(machine.state(), TaskState::Idle);
        }
    }

    #[test]
    fn test_available_triggers() {
        let machine = TaskStateMachine::restore(TaskState::Error, MachineContext::default());
        assert_eq!(
            machine.available_triggers(),
            vec![TriggerKind::Reset, TriggerKind::Retry]
        );
        assert!(!machine.can_dispatch(TriggerKind::Cancel));
    }

    #[tokio::test]
    async fn test_transition_event_published() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut machine = TaskStateMachine::new().with_event_bus(bus);

        let task_id = Uuid::new_v4();
        machine.dispatch(Trigger::StartTask {
            task_id: Some(task_id),
        });

        let envelope = rx.recv().await.unwrap();
        match envelope.event {
            Event::StateTransition {
                task_id: id,
                from,
                to,
                trigger,
            } => {
                assert_eq!(id, Some(task_id));
                assert_eq!(from, "idle");
                assert_eq!(to, "planning");
                assert_eq!(trigger, "start_task");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
