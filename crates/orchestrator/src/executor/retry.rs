//! Attempt loop with backoff between failures.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryPolicy;

/// Why a single attempt did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    Timeout { timeout_ms: u64 },
    Cancelled(String),
    Failed(String),
}

impl AttemptError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { timeout_ms } => write!(f, "Step timed out after {}ms", timeout_ms),
            Self::Cancelled(reason) => write!(f, "Cancelled: {}", reason),
            Self::Failed(message) => f.write_str(message),
        }
    }
}

/// Outcome of the whole attempt loop plus the retries it spent.
#[derive(Debug)]
pub struct Attempted<T> {
    pub outcome: Result<T, AttemptError>,
    pub retries: u32,
}

/// Run `attempt` until it succeeds, `max_retries` retries are spent, or
/// `token` is cancelled. Cancellation is never retried.
///
/// `on_retry` is told the upcoming retry number and the error that caused it.
pub async fn run_with_retry<T, F, Fut, R>(
    step_id: &str,
    max_retries: u32,
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut on_retry: R,
    mut attempt: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
    R: FnMut(u32, &AttemptError),
{
    let mut retries_used: u32 = 0;

    loop {
        let error = match attempt(retries_used).await {
            Ok(value) => {
                return Attempted {
                    outcome: Ok(value),
                    retries: retries_used,
                }
            }
            Err(error) => error,
        };

        if error.is_cancelled() || token.is_cancelled() || retries_used >= max_retries {
            let error = if token.is_cancelled() && !error.is_cancelled() {
                AttemptError::Cancelled(error.to_string())
            } else {
                error
            };
            return Attempted {
                outcome: Err(error),
                retries: retries_used,
            };
        }

        let next = retries_used + 1;
        let delay = policy.delay_for(next);
        warn!(
            step_id,
            error = %error,
            retry_attempt = next,
            max_retries,
            retry_in_ms = delay.as_millis() as u64,
            "Retrying step"
        );
        on_retry(next, &error);

        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {
                    return Attempted {
                        outcome: Err(AttemptError::Cancelled("cancelled during retry backoff".to_string())),
                        retries: retries_used,
                    };
                }
            }
        }
        retries_used = next;
    }
}
