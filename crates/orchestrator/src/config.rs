//! Engine configuration.
//!
//! Every section has serde defaults so a partial file (or none at all)
//! yields a working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    pub checkpoint: CheckpointConfig,
    /// Attempt one replan when a step fails mid-walk
    pub replan_on_failure: bool,
}

impl EngineConfig {
    pub fn with_planner(mut self, planner: PlannerConfig) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_replan(mut self, enabled: bool) -> Self {
        self.replan_on_failure = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub max_steps: usize,
    pub analysis_timeout_ms: u64,
    pub generation_timeout_ms: u64,
    pub default_step_timeout_ms: u64,
    pub default_max_retries: u32,
    pub default_retryable: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            analysis_timeout_ms: 60_000,
            generation_timeout_ms: 60_000,
            default_step_timeout_ms: taskpilot_core::DEFAULT_STEP_TIMEOUT_MS,
            default_max_retries: taskpilot_core::DEFAULT_MAX_RETRIES,
            default_retryable: true,
        }
    }
}

impl PlannerConfig {
    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.max_steps = max;
        self
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn linear(base: Duration) -> Self {
        Self {
            backoff: Backoff::Linear,
            base_delay_ms: base.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential,
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = self.max_delay_ms.max(self.base_delay_ms);
        let ms = match self.backoff {
            Backoff::Linear => self.base_delay_ms.saturating_mul(retry as u64),
            Backoff::Exponential => {
                let shift = retry.saturating_sub(1).min(20);
                self.base_delay_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms.min(max_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on parallel-group children in flight
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    #[default]
    EveryStep,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub policy: CheckpointPolicy,
    pub ttl_secs: u64,
    /// Checkpoints retained per task, newest first
    pub keep_last: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            policy: CheckpointPolicy::EveryStep,
            ttl_secs: 7 * 24 * 60 * 60,
            keep_last: 10,
        }
    }
}

impl CheckpointConfig {
    pub fn manual() -> Self {
        Self {
            policy: CheckpointPolicy::Manual,
            ..Default::default()
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}
