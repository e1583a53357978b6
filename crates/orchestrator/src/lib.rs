pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod executor;
pub mod planner;
pub mod prompts;
pub mod services;
pub mod state_machine;

pub use agent::{Agent, TaskResponse, CONFIRMATION_VAR};
pub use checkpoint::CheckpointStore;
pub use config::{
    Backoff, CheckpointConfig, CheckpointPolicy, EngineConfig, ExecutorConfig, PlannerConfig,
    RetryPolicy,
};
pub use error::{OrchestratorError, Result, ValidationError};
pub use executor::StepExecutor;
pub use planner::Planner;
pub use services::{
    ChatMessage, ChatRole, ModelClient, ModelError, ModelErrorKind, NoModel, ParamType, Tool,
    ToolCallContext, ToolDescriptor, ToolError, ToolParam, ToolRegistry,
};
pub use state_machine::{DispatchOutcome, TaskStateMachine, TransitionRecord, Trigger, TriggerKind};
