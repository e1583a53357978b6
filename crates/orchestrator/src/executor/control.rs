//! Pause gate and the registry of running steps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct RunningStep {
    step_id: String,
    token: CancellationToken,
}

/// Shared control surface for one executor. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionControl {
    running: Arc<Mutex<HashMap<u64, RunningStep>>>,
    next_id: Arc<AtomicU64>,
    paused: Arc<watch::Sender<bool>>,
}

impl ExecutionControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            running: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            paused: Arc::new(paused),
        }
    }

    /// Block the next step from starting. Steps in flight are unaffected.
    pub fn pause(&self) {
        info!("Execution paused");
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        info!("Execution resumed");
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait while paused. Returns early if `token` is cancelled.
    pub async fn wait_if_paused(&self, token: &CancellationToken) {
        let mut rx = self.paused.subscribe();
        if !*rx.borrow() {
            return;
        }
        debug!("Waiting for execution to resume");
        tokio::select! {
            _ = rx.wait_for(|paused| !*paused) => {}
            _ = token.cancelled() => {}
        }
    }

    /// Track a running step until the returned guard is dropped.
    pub fn register(&self, step_id: &str, token: CancellationToken) -> RunningGuard {
        let key = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock_running(&self.running).insert(
            key,
            RunningStep {
                step_id: step_id.to_string(),
                token,
            },
        );
        RunningGuard {
            key,
            running: Arc::clone(&self.running),
        }
    }

    /// Cancel every running instance of `step_id`.
    pub fn cancel_step(&self, step_id: &str) -> bool {
        let running = lock_running(&self.running);
        let mut found = false;
        for entry in running.values().filter(|r| r.step_id == step_id) {
            entry.token.cancel();
            found = true;
        }
        if found {
            info!(step_id, "Step cancelled");
        }
        found
    }

    /// Cancel everything currently running. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let running = lock_running(&self.running);
        for entry in running.values() {
            entry.token.cancel();
        }
        if !running.is_empty() {
            info!(count = running.len(), "Cancelled all running steps");
        }
        running.len()
    }

    pub fn running_steps(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_running(&self.running)
            .values()
            .map(|r| r.step_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry holds no invariant a panicking holder could break, so a
/// poisoned lock is still usable.
fn lock_running(
    running: &Mutex<HashMap<u64, RunningStep>>,
) -> MutexGuard<'_, HashMap<u64, RunningStep>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes its step from the running registry on drop, whichever way the
/// step ended.
pub struct RunningGuard {
    key: u64,
    running: Arc<Mutex<HashMap<u64, RunningStep>>>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock_running(&self.running).remove(&self.key);
    }
}
