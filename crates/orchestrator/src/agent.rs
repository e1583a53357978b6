//! Task driver.
//!
//! The agent owns one state machine and runs one task at a time: plan,
//! walk the plan through the executor, checkpoint, persist the task
//! record and publish events. Commands (confirm, reject, cancel, pause)
//! arrive from other tasks through `&self`, so an agent is usually shared
//! behind an `Arc`.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use taskpilot_core::{
    Checkpoint, ExecutionContext, Plan, Step, StepResult, StepStatus, Task, TaskRecord, TaskState,
    TaskSummary,
};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use db::KeyValueStore;
use events::{Event, EventBus};

use crate::checkpoint::CheckpointStore;
use crate::config::{CheckpointPolicy, EngineConfig};
use crate::error::{OrchestratorError, Result};
use crate::executor::StepExecutor;
use crate::planner::Planner;
use crate::services::{ModelClient, ToolRegistry};
use crate::state_machine::{
    DispatchOutcome, MachineContext, TaskStateMachine, TransitionRecord, Trigger, TriggerKind,
};

/// Variable holding the data passed with the most recent confirmation.
pub const CONFIRMATION_VAR: &str = "$confirmation";

/// What a caller gets back from [`Agent::run`], [`Agent::run_plan`] and
/// [`Agent::resume`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskResponse {
    pub task_id: Uuid,
    pub state: TaskState,
    /// Output of the last successful step
    pub output: Option<Value>,
    pub results: Vec<StepResult>,
    pub summary: TaskSummary,
    pub error: Option<String>,
    pub failed_step: Option<String>,
    pub duration_ms: u64,
}

impl TaskResponse {
    pub fn is_success(&self) -> bool {
        self.state == TaskState::Complete
    }
}

enum Decision {
    Confirmed(Option<Value>),
    Rejected(Option<String>),
}

struct PendingConfirmation {
    step_id: String,
    tx: oneshot::Sender<Decision>,
}

/// Latest progress of the active (or last) run, for on-demand checkpoints.
#[derive(Clone)]
struct LiveRun {
    task_id: Uuid,
    cursor: usize,
    variables: Map<String, Value>,
    results: Vec<StepResult>,
}

enum Outcome {
    Complete,
    Failed {
        error: String,
        step_id: Option<String>,
    },
    Cancelled {
        step_id: Option<String>,
    },
}

/// Per-run state owned by the walk.
struct Run {
    record: TaskRecord,
    ctx: ExecutionContext,
    results: Vec<StepResult>,
    token: CancellationToken,
    started: Instant,
    replanned: bool,
}

impl Run {
    fn task_id(&self) -> Uuid {
        self.record.task.id
    }
}

pub struct Agent {
    planner: Planner,
    executor: StepExecutor,
    checkpoints: CheckpointStore,
    event_bus: EventBus,
    config: EngineConfig,
    machine: Mutex<TaskStateMachine>,
    pending: Mutex<Option<PendingConfirmation>>,
    current: Mutex<Option<CancellationToken>>,
    live: Mutex<Option<LiveRun>>,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: ToolRegistry,
        store: Arc<dyn KeyValueStore>,
        config: EngineConfig,
    ) -> Self {
        Self::with_event_bus(model, tools, store, config, EventBus::new())
    }

    pub fn with_event_bus(
        model: Arc<dyn ModelClient>,
        tools: ToolRegistry,
        store: Arc<dyn KeyValueStore>,
        config: EngineConfig,
        event_bus: EventBus,
    ) -> Self {
        let planner = Planner::new(Arc::clone(&model), tools.clone(), config.planner.clone());
        let executor = StepExecutor::new(tools, model, config.executor.clone())
            .with_event_bus(event_bus.clone());
        let checkpoints = CheckpointStore::new(store, config.checkpoint.clone());
        let machine = TaskStateMachine::new().with_event_bus(event_bus.clone());

        Self {
            planner,
            executor,
            checkpoints,
            event_bus,
            config,
            machine: Mutex::new(machine),
            pending: Mutex::new(None),
            current: Mutex::new(None),
            live: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn state(&self) -> TaskState {
        self.machine.lock().await.state()
    }

    pub async fn current_task(&self) -> Option<Uuid> {
        self.machine.lock().await.context().task_id
    }

    pub async fn transition_history(&self) -> Vec<TransitionRecord> {
        self.machine.lock().await.history().to_vec()
    }

    pub async fn available_triggers(&self) -> Vec<TriggerKind> {
        self.machine.lock().await.available_triggers()
    }

    /// Plan `description` with the model and execute the plan.
    pub async fn run(&self, description: &str, input: Value) -> Result<TaskResponse> {
        let task = Task::new(description, input);
        let mut run = self.begin(task).await?;

        info!(task_id = %run.task_id(), "Planning task");
        self.status(run.task_id(), "Planning task");

        let planned = self
            .planner
            .create_plan(description, &run.record.task.input, &run.token)
            .await;
        if let Err(outcome) = self.accept_plan(&mut run, planned).await {
            return Ok(self.finish(run, outcome).await);
        }
        Ok(self.walk_from_start(run).await)
    }

    /// Execute a caller-supplied plan. The plan is validated and sorted
    /// but no model call is made to produce it.
    pub async fn run_plan(&self, description: &str, input: Value, plan: Plan) -> Result<TaskResponse> {
        let task = Task::new(description, input);
        let mut run = self.begin(task).await?;

        let planned = self.planner.finalize(plan);
        if let Err(outcome) = self.accept_plan(&mut run, planned).await {
            return Ok(self.finish(run, outcome).await);
        }
        Ok(self.walk_from_start(run).await)
    }

    /// Continue an interrupted task from its most recent resumable checkpoint.
    pub async fn resume(&self, task_id: Uuid) -> Result<TaskResponse> {
        let record = self
            .checkpoints
            .load_task(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::resume(format!("task {} not found", task_id)))?;

        if record.is_finished() {
            return Err(OrchestratorError::resume(format!(
                "task {} already finished in state {}",
                task_id,
                record.state()
            )));
        }

        let checkpoint = match self.checkpoints.latest_resumable(task_id).await? {
            Some(checkpoint) => checkpoint,
            None => {
                let reason = match self.checkpoints.latest(task_id).await? {
                    Some(latest) => format!(
                        "latest checkpoint of task {} was captured in state {} and cannot be resumed",
                        task_id, latest.state
                    ),
                    None => format!("no checkpoint for task {}", task_id),
                };
                return Err(OrchestratorError::resume(reason));
            }
        };

        let plan = record
            .plan
            .clone()
            .ok_or_else(|| OrchestratorError::resume(format!("task {} has no plan", task_id)))?;

        // With no recorded step the cursor does not point at anything yet
        let start = if checkpoint.results.is_empty() {
            0
        } else {
            checkpoint.cursor + 1
        };

        let finished = start >= plan.len();
        let token = CancellationToken::new();
        {
            let mut machine = self.machine.lock().await;
            self.ensure_idle(&mut machine)?;
            let context = MachineContext {
                task_id: Some(task_id),
                plan: Some(plan.clone()),
                cursor: start.min(plan.len().saturating_sub(1)),
                results: checkpoint.results.clone(),
                ..Default::default()
            };
            let state = if finished {
                TaskState::Complete
            } else {
                TaskState::Executing
            };
            *machine = TaskStateMachine::restore(state, context).with_event_bus(self.event_bus.clone());
        }
        *self.current.lock().await = Some(token.clone());

        info!(
            task_id = %task_id,
            checkpoint_id = %checkpoint.id,
            start,
            total = plan.len(),
            "Resuming task"
        );
        self.status(task_id, &format!("Resuming at step {} of {}", start + 1, plan.len()));

        let mut run = Run {
            record,
            ctx: ExecutionContext::from_checkpoint(&checkpoint),
            results: checkpoint.results.clone(),
            token,
            started: Instant::now(),
            replanned: false,
        };
        run.record.task.state = TaskState::Executing;
        self.set_live(&run, checkpoint.cursor).await;

        if finished {
            info!(task_id = %task_id, "Nothing left to run, task already complete");
            return Ok(self.finish(run, Outcome::Complete).await);
        }

        Ok(self.walk(run, plan, start).await)
    }

    /// Approve the step waiting for confirmation. `step_id`, when given,
    /// must name that step.
    pub async fn confirm(&self, step_id: Option<&str>, data: Option<Value>) -> Result<()> {
        let mut pending = self.pending.lock().await;
        let waiting = self.take_pending(&mut pending, step_id, TriggerKind::UserConfirmed).await?;

        self.dispatch_checked(Trigger::UserConfirmed { data: data.clone() })
            .await?;
        info!(step_id = %waiting.step_id, "Step confirmed");
        let _ = waiting.tx.send(Decision::Confirmed(data));
        Ok(())
    }

    /// Reject the step waiting for confirmation; the task fails.
    pub async fn reject(&self, reason: Option<String>) -> Result<()> {
        let mut pending = self.pending.lock().await;
        let waiting = self.take_pending(&mut pending, None, TriggerKind::UserRejected).await?;

        self.dispatch_checked(Trigger::UserRejected {
            reason: reason.clone(),
        })
        .await?;
        info!(step_id = %waiting.step_id, reason = ?reason, "Step rejected");
        let _ = waiting.tx.send(Decision::Rejected(reason));
        Ok(())
    }

    /// Cancel the active task. Returns false when nothing is running.
    pub async fn cancel(&self) -> bool {
        let Some(token) = self.current.lock().await.clone() else {
            return false;
        };

        token.cancel();
        let cancelled = self.executor.cancel_all();
        self.pending.lock().await.take();
        let outcome = self.machine.lock().await.dispatch(Trigger::Cancel);

        info!(running_steps = cancelled, applied = outcome.is_applied(), "Task cancelled");
        true
    }

    /// Hold the next step until [`Agent::resume_execution`]. A running step
    /// is not interrupted.
    pub fn pause(&self) {
        self.executor.pause();
    }

    pub fn resume_execution(&self) {
        self.executor.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.executor.is_paused()
    }

    pub fn cancel_step(&self, step_id: &str) -> bool {
        self.executor.cancel_step(step_id)
    }

    /// Capture and store a checkpoint of the current (or last) run now,
    /// regardless of the checkpoint policy.
    pub async fn checkpoint_now(&self) -> Result<Checkpoint> {
        let live = self
            .live
            .lock()
            .await
            .clone()
            .ok_or(OrchestratorError::NoActiveTask)?;
        let state = self.state().await;

        let checkpoint = Checkpoint::capture(
            live.task_id,
            state,
            live.cursor,
            live.variables,
            live.results,
            self.checkpoints.ttl(),
        );
        self.checkpoints.save_checkpoint(&checkpoint).await?;
        info!(
            task_id = %checkpoint.task_id,
            checkpoint_id = %checkpoint.id,
            can_resume = checkpoint.can_resume,
            "Manual checkpoint saved"
        );
        Ok(checkpoint)
    }

    async fn begin(&self, task: Task) -> Result<Run> {
        let token = CancellationToken::new();
        {
            let mut machine = self.machine.lock().await;
            self.ensure_idle(&mut machine)?;
            *machine = TaskStateMachine::new().with_event_bus(self.event_bus.clone());
            machine.dispatch(Trigger::StartTask {
                task_id: Some(task.id),
            });
        }
        *self.current.lock().await = Some(token.clone());

        let mut record = TaskRecord::new(task);
        record.task.state = TaskState::Planning;
        let input = record.task.input.clone();
        let mut run = Run {
            ctx: ExecutionContext::new(record.task.id).with_input(&input),
            record,
            results: Vec::new(),
            token,
            started: Instant::now(),
            replanned: false,
        };
        self.persist(&mut run).await;
        Ok(run)
    }

    /// Terminal states reset automatically; anything else is a running task.
    fn ensure_idle(&self, machine: &mut TaskStateMachine) -> Result<()> {
        match machine.state() {
            TaskState::Idle => Ok(()),
            TaskState::Complete | TaskState::Error => {
                machine.dispatch(Trigger::Reset);
                Ok(())
            }
            _ => Err(OrchestratorError::TaskBusy(
                machine.context().task_id.unwrap_or_else(Uuid::nil),
            )),
        }
    }

    /// Feed a planning outcome to the machine. A plan that cannot be used
    /// comes back as the outcome the run has to finish with.
    async fn accept_plan(&self, run: &mut Run, planned: Result<Plan>) -> std::result::Result<(), Outcome> {
        let task_id = run.task_id();
        let plan = match planned {
            Ok(plan) => plan,
            Err(_) if run.token.is_cancelled() => {
                return Err(Outcome::Cancelled { step_id: None });
            }
            Err(e) => {
                let message = e.to_string();
                self.machine.lock().await.dispatch(Trigger::PlanFailed {
                    error: message.clone(),
                });
                return Err(Outcome::Failed {
                    error: message,
                    step_id: None,
                });
            }
        };

        let outcome = self.machine.lock().await.dispatch(Trigger::PlanReady {
            plan: Some(plan.clone()),
        });
        if !outcome.is_applied() {
            if run.token.is_cancelled() {
                return Err(Outcome::Cancelled { step_id: None });
            }
            let message = format!("plan {} was not accepted in the current state", plan.id);
            self.machine.lock().await.dispatch(Trigger::PlanFailed {
                error: message.clone(),
            });
            return Err(Outcome::Failed {
                error: message,
                step_id: None,
            });
        }

        info!(task_id = %task_id, plan_id = %plan.id, steps = plan.len(), "Plan ready");
        self.emit(Event::PlanCreated {
            task_id,
            plan: serde_json::to_value(&plan).unwrap_or(Value::Null),
        });
        run.record.replace_plan(plan);
        run.record.task.state = TaskState::Executing;
        self.persist(run).await;
        Ok(())
    }

    async fn walk_from_start(&self, run: Run) -> TaskResponse {
        let Some(plan) = run.record.plan.clone() else {
            return self
                .finish(
                    run,
                    Outcome::Failed {
                        error: "no plan".to_string(),
                        step_id: None,
                    },
                )
                .await;
        };
        self.set_live(&run, 0).await;
        self.walk(run, plan, 0).await
    }

    async fn walk(&self, mut run: Run, mut plan: Plan, start: usize) -> TaskResponse {
        let task_id = run.task_id();
        let mut index = start;

        while index < plan.len() {
            let step = plan.steps[index].clone();
            if run.token.is_cancelled() {
                return self.finish(run, Outcome::Cancelled { step_id: None }).await;
            }

            self.emit(Event::StepStart {
                task_id,
                step_id: step.id.clone(),
                step_name: step.name.clone(),
                index,
                total: plan.len(),
            });

            if step.requires_confirmation {
                match self.await_confirmation(&mut run, &step, index).await {
                    Some(Decision::Confirmed(data)) => {
                        if let Some(data) = data {
                            run.ctx.set_variable(CONFIRMATION_VAR, data);
                        }
                    }
                    Some(Decision::Rejected(reason)) => {
                        let error = reason.unwrap_or_else(|| "Rejected by user".to_string());
                        skip_dependents(&mut run, &plan, index, &step.id);
                        return self
                            .finish(
                                run,
                                Outcome::Failed {
                                    error,
                                    step_id: Some(step.id),
                                },
                            )
                            .await;
                    }
                    None => {
                        return self
                            .finish(
                                run,
                                Outcome::Cancelled {
                                    step_id: Some(step.id),
                                },
                            )
                            .await;
                    }
                }
            }

            let unmet = step
                .depends_on
                .iter()
                .find(|dep| run.ctx.successful_output(dep).is_none())
                .cloned();
            let result = match unmet {
                Some(dependency) => {
                    debug!(
                        task_id = %task_id,
                        step_id = %step.id,
                        dependency = %dependency,
                        "Dependency did not succeed, skipping step"
                    );
                    StepResult::skipped(&step.id, &step.name)
                }
                None => {
                    for dep in &step.depends_on {
                        if let Some(output) = run.ctx.successful_output(dep).cloned() {
                            run.ctx.set_variable(dep.clone(), output);
                        }
                    }
                    self.executor.execute_step(&step, &run.ctx, &run.token).await
                }
            };

            run.ctx.record(result.clone());
            run.results.push(result.clone());
            self.emit(Event::StepComplete {
                task_id,
                step_id: step.id.clone(),
                status: result.status.as_str().to_string(),
                result: serde_json::to_value(&result).unwrap_or(Value::Null),
            });

            if run.token.is_cancelled() {
                return self
                    .finish(
                        run,
                        Outcome::Cancelled {
                            step_id: Some(step.id),
                        },
                    )
                    .await;
            }

            if matches!(result.status, StepStatus::Success | StepStatus::Skipped) {
                self.machine
                    .lock()
                    .await
                    .dispatch(Trigger::StepComplete { result });
                self.record_progress(&mut run, index).await;
                index += 1;
                continue;
            }

            let mut error = result
                .error
                .clone()
                .unwrap_or_else(|| format!("step {} did not succeed", step.id));
            self.emit(Event::StepError {
                task_id,
                step_id: step.id.clone(),
                error: error.clone(),
            });

            if self.config.replan_on_failure && !run.replanned {
                run.replanned = true;
                match self.replan(&mut run, &plan, &step, &error, index).await {
                    Ok(next) => {
                        plan = next;
                        continue;
                    }
                    Err(e) => {
                        error!(task_id = %task_id, step_id = %step.id, error = %e, "Replan failed");
                        error = format!("{}; replan failed: {}", error, e);
                    }
                }
            }

            self.machine.lock().await.dispatch(Trigger::ExecutionFailed {
                error: error.clone(),
                result: Some(result),
            });
            skip_dependents(&mut run, &plan, index, &step.id);
            self.record_progress(&mut run, index).await;
            return self
                .finish(
                    run,
                    Outcome::Failed {
                        error,
                        step_id: Some(step.id),
                    },
                )
                .await;
        }

        self.finish(run, Outcome::Complete).await
    }

    /// Replace the work from `index` on with a freshly planned tail.
    ///
    /// On success the failed result is dropped from the run; it stays
    /// visible through the step-error event and the new plan's lineage.
    async fn replan(
        &self,
        run: &mut Run,
        plan: &Plan,
        failed: &Step,
        error: &str,
        index: usize,
    ) -> Result<Plan> {
        let task_id = run.task_id();
        info!(task_id = %task_id, step_id = %failed.id, "Replanning after step failure");
        self.status(task_id, &format!("Replanning after {} failed", failed.id));

        let completed: Map<String, Value> = run
            .results
            .iter()
            .filter(|r| r.is_success())
            .filter_map(|r| r.output.clone().map(|o| (r.step_id.clone(), o)))
            .collect();

        let next = self
            .planner
            .replan(plan, failed, error, &completed, &run.token)
            .await?;
        if next.len() <= index {
            return Err(OrchestratorError::planning("replan produced no remaining steps"));
        }

        run.results.pop();
        run.ctx.results.remove(&failed.id);

        self.machine.lock().await.replace_plan(next.clone());
        run.record.replace_plan(next.clone());
        self.emit(Event::PlanUpdated {
            task_id,
            plan: serde_json::to_value(&next).unwrap_or(Value::Null),
            reason: format!("step {} failed: {}", failed.id, error),
        });
        self.persist(run).await;
        Ok(next)
    }

    /// Suspend until the step is confirmed, rejected or the task is
    /// cancelled (`None`).
    async fn await_confirmation(&self, run: &mut Run, step: &Step, index: usize) -> Option<Decision> {
        let task_id = run.task_id();
        let reason = step
            .param_str("confirmationReason")
            .map(str::to_string)
            .unwrap_or_else(|| format!("Step '{}' requires confirmation", step.name));

        let rx = {
            let mut pending = self.pending.lock().await;
            let (tx, rx) = oneshot::channel();
            let outcome = self.machine.lock().await.dispatch(Trigger::NeedConfirmation {
                step_id: step.id.clone(),
                reason: reason.clone(),
            });
            if !outcome.is_applied() {
                return None;
            }
            *pending = Some(PendingConfirmation {
                step_id: step.id.clone(),
                tx,
            });
            rx
        };

        info!(task_id = %task_id, step_id = %step.id, "Waiting for confirmation");
        self.emit(Event::WaitingForConfirmation {
            task_id,
            step_id: step.id.clone(),
            reason,
        });
        run.record.task.state = TaskState::Waiting;
        // Cursor stays on the last recorded step; this one has not run
        self.record_progress(run, index.saturating_sub(1)).await;

        let decision = tokio::select! {
            decision = rx => decision.ok(),
            _ = run.token.cancelled() => None,
        };
        if matches!(decision, Some(Decision::Confirmed(_))) {
            run.record.task.state = TaskState::Executing;
        }
        decision
    }

    async fn take_pending(
        &self,
        pending: &mut Option<PendingConfirmation>,
        step_id: Option<&str>,
        trigger: TriggerKind,
    ) -> Result<PendingConfirmation> {
        let Some(waiting) = pending.take() else {
            return Err(OrchestratorError::InvalidTransition {
                from: self.state().await.to_string(),
                trigger: trigger.as_str().to_string(),
            });
        };
        match step_id {
            Some(id) if id != waiting.step_id => {
                let id = id.to_string();
                *pending = Some(waiting);
                Err(OrchestratorError::StepNotFound(id))
            }
            _ => Ok(waiting),
        }
    }

    async fn dispatch_checked(&self, trigger: Trigger) -> Result<DispatchOutcome> {
        let mut machine = self.machine.lock().await;
        let kind = trigger.kind();
        let outcome = machine.dispatch(trigger);
        if outcome.is_applied() {
            Ok(outcome)
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: machine.state().to_string(),
                trigger: kind.as_str().to_string(),
            })
        }
    }

    /// Refresh the live snapshot, checkpoint per policy and persist the record.
    async fn record_progress(&self, run: &mut Run, cursor: usize) {
        self.set_live(run, cursor).await;

        if self.config.checkpoint.policy == CheckpointPolicy::EveryStep {
            let state = self.state().await;
            let checkpoint = Checkpoint::capture(
                run.task_id(),
                state,
                cursor,
                run.ctx.variables.clone(),
                run.results.clone(),
                self.checkpoints.ttl(),
            );
            if let Err(e) = self.checkpoints.save_checkpoint(&checkpoint).await {
                warn!(task_id = %run.task_id(), error = %e, "Failed to save checkpoint");
            }
        }

        self.persist(run).await;
    }

    async fn set_live(&self, run: &Run, cursor: usize) {
        *self.live.lock().await = Some(LiveRun {
            task_id: run.task_id(),
            cursor,
            variables: run.ctx.variables.clone(),
            results: run.results.clone(),
        });
    }

    async fn persist(&self, run: &mut Run) {
        run.record.results = run.results.clone();
        run.record.touch();
        if let Err(e) = self.checkpoints.save_task(&run.record).await {
            warn!(task_id = %run.task_id(), error = %e, "Failed to persist task record");
        }
    }

    async fn finish(&self, mut run: Run, outcome: Outcome) -> TaskResponse {
        let task_id = run.task_id();
        *self.current.lock().await = None;

        let (error, failed_step) = match outcome {
            Outcome::Complete => (None, None),
            Outcome::Failed { error, step_id } => (Some(error), step_id),
            Outcome::Cancelled { step_id } => {
                let mut machine = self.machine.lock().await;
                if machine.can_dispatch(TriggerKind::Cancel) {
                    machine.dispatch(Trigger::Cancel);
                }
                (Some(format!("Task {} cancelled", task_id)), step_id)
            }
        };

        let state = self.state().await;
        let output = run
            .results
            .iter()
            .rev()
            .find(|r| r.is_success())
            .and_then(|r| r.output.clone());
        let summary = TaskSummary::from_results(&run.results);
        let duration_ms = run.started.elapsed().as_millis() as u64;

        match &error {
            None => {
                info!(
                    task_id = %task_id,
                    steps = summary.total,
                    duration_ms,
                    "Task complete"
                );
                self.emit(Event::TaskComplete {
                    task_id,
                    output: output.clone(),
                    summary: serde_json::to_value(&summary).unwrap_or(Value::Null),
                });
            }
            Some(message) => {
                error!(
                    task_id = %task_id,
                    error = %message,
                    failed_step = ?failed_step,
                    duration_ms,
                    "Task failed"
                );
                self.emit(Event::TaskError {
                    task_id,
                    error: message.clone(),
                    failed_step: failed_step.clone(),
                });
            }
        }

        run.record.task.state = state;
        run.record.error = error.clone();
        run.record.failed_step = failed_step.clone();
        self.persist(&mut run).await;

        TaskResponse {
            task_id,
            state,
            output,
            results: run.results,
            summary,
            error,
            failed_step,
            duration_ms,
        }
    }

    fn status(&self, task_id: Uuid, message: &str) {
        self.emit(Event::Status {
            task_id,
            message: message.to_string(),
        });
    }

    fn emit(&self, event: Event) {
        self.event_bus.emit(event);
    }
}

/// After a halt, mark every later step that (transitively) depends on the
/// halted step as skipped. Unrelated later steps stay absent.
fn skip_dependents(run: &mut Run, plan: &Plan, index: usize, halted: &str) {
    let mut blocked = vec![halted.to_string()];
    for step in plan.steps.iter().skip(index + 1) {
        if step.depends_on.iter().any(|dep| blocked.contains(dep)) {
            blocked.push(step.id.clone());
            let result = StepResult::skipped(&step.id, &step.name);
            run.ctx.record(result.clone());
            run.results.push(result);
        }
    }
}
