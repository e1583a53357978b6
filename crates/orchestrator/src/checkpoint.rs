//! Durable task history and checkpoints over the key-value contract.
//!
//! Keys:
//! - `task:{task_id}` holds the [`TaskRecord`]
//! - `checkpoint:{task_id}:{nanos:020}:{checkpoint_id}` holds one
//!   [`Checkpoint`]; the zero-padded timestamp makes lexical order
//!   chronological so `keys()` returns oldest first.

use db::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use taskpilot_core::{Checkpoint, TaskRecord};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CheckpointConfig;
use crate::error::Result;

const TASK_PREFIX: &str = "task:";
const CHECKPOINT_PREFIX: &str = "checkpoint:";

#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn KeyValueStore>,
    config: CheckpointConfig,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn KeyValueStore>, config: CheckpointConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.ttl_secs.min(i64::MAX as u64) as i64)
    }

    pub async fn save_task(&self, record: &TaskRecord) -> Result<()> {
        let value = to_value(record)?;
        self.store.set(&task_key(record.task.id), value, None).await?;
        Ok(())
    }

    pub async fn load_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>> {
        self.load(&task_key(task_id)).await
    }

    /// Store a checkpoint with the configured TTL, then prune the oldest
    /// checkpoints of the same task beyond `keep_last`.
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let key = checkpoint_key(checkpoint);
        let ttl = Some(self.config.ttl()).filter(|ttl| !ttl.is_zero());
        self.store.set(&key, to_value(checkpoint)?, ttl).await?;

        debug!(
            task_id = %checkpoint.task_id,
            checkpoint_id = %checkpoint.id,
            state = %checkpoint.state,
            cursor = checkpoint.cursor,
            "Checkpoint saved"
        );

        self.prune(checkpoint.task_id).await?;
        Ok(())
    }

    /// Checkpoints of a task, oldest first. Entries that fail to decode are
    /// skipped with a warning.
    pub async fn list_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>> {
        let keys = self.store.keys(&checkpoint_pattern(task_id)).await?;
        let found = self.store.get_many(&keys).await?;

        let mut checkpoints = Vec::with_capacity(found.len());
        for key in &keys {
            let Some(value) = found.get(key) else {
                continue;
            };
            match serde_json::from_value::<Checkpoint>(value.clone()) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable checkpoint"),
            }
        }
        Ok(checkpoints)
    }

    /// Most recent checkpoint that has not expired, resumable or not.
    pub async fn latest(&self, task_id: Uuid) -> Result<Option<Checkpoint>> {
        let now = chrono::Utc::now();
        Ok(self
            .list_checkpoints(task_id)
            .await?
            .into_iter()
            .rev()
            .find(|c| !c.is_expired(now)))
    }

    /// Most recent checkpoint with `can_resume` set.
    pub async fn latest_resumable(&self, task_id: Uuid) -> Result<Option<Checkpoint>> {
        let now = chrono::Utc::now();
        Ok(self
            .list_checkpoints(task_id)
            .await?
            .into_iter()
            .rev()
            .find(|c| c.can_resume && !c.is_expired(now)))
    }

    /// Ids of every task with a stored record.
    pub async fn task_ids(&self) -> Result<Vec<Uuid>> {
        let keys = self.store.keys(&format!("{}*", TASK_PREFIX)).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(TASK_PREFIX))
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect())
    }

    /// Remove a task record and all of its checkpoints.
    pub async fn delete_task(&self, task_id: Uuid) -> Result<usize> {
        let mut removed = self.store.clear(&checkpoint_pattern(task_id)).await?;
        if self.store.delete(&task_key(task_id)).await? {
            removed += 1;
        }
        Ok(removed)
    }

    async fn prune(&self, task_id: Uuid) -> Result<()> {
        let keep = self.config.keep_last.max(1);
        let keys = self.store.keys(&checkpoint_pattern(task_id)).await?;
        if keys.len() <= keep {
            return Ok(());
        }

        let stale = &keys[..keys.len() - keep];
        let removed = self.store.delete_many(stale).await?;
        debug!(task_id = %task_id, removed, "Pruned old checkpoints");
        Ok(())
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("config", &self.config)
            .finish()
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn task_key(task_id: Uuid) -> String {
    format!("{}{}", TASK_PREFIX, task_id)
}

fn checkpoint_key(checkpoint: &Checkpoint) -> String {
    format!(
        "{}{}:{:020}:{}",
        CHECKPOINT_PREFIX,
        checkpoint.task_id,
        checkpoint.timestamp.timestamp_nanos_opt().unwrap_or(0).max(0),
        checkpoint.id
    )
}

fn checkpoint_pattern(task_id: Uuid) -> String {
    format!("{}{}:*", CHECKPOINT_PREFIX, task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryStore;
    use serde_json::{json, Map};
    use taskpilot_core::{Plan, Step, StepResult, Task, TaskState};

    fn store(keep_last: usize) -> CheckpointStore {
        let config = CheckpointConfig {
            keep_last,
            ..Default::default()
        };
        CheckpointStore::new(Arc::new(MemoryStore::new()), config)
    }

    fn capture(store: &CheckpointStore, task_id: Uuid, state: TaskState, cursor: usize) -> Checkpoint {
        let mut checkpoint = Checkpoint::capture(task_id, state, cursor, Map::new(), Vec::new(), store.ttl());
        // Distinct, increasing timestamps regardless of clock resolution
        checkpoint.timestamp += chrono::Duration::milliseconds(cursor as i64);
        checkpoint
    }

    #[tokio::test]
    async fn test_task_record_round_trip() {
        let store = store(10);
        let mut record = TaskRecord::new(Task::new("report", json!({"x": 1})));
        record.replace_plan(Plan::new("report", vec![Step::model("a")]));
        record.results.push(StepResult::skipped("a", "a"));

        store.save_task(&record).await.unwrap();
        let loaded = store.load_task(record.task.id).await.unwrap().unwrap();
        assert_eq!(loaded.task.description, "report");
        assert_eq!(loaded.results.len(), 1);
        assert_eq!(loaded.plan.unwrap().steps[0].id, "a");

        assert_eq!(store.task_ids().await.unwrap(), vec![record.task.id]);
        assert!(store.load_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_resumable_skips_terminal() {
        let store = store(10);
        let task_id = Uuid::new_v4();
        store.save_checkpoint(&capture(&store, task_id, TaskState::Executing, 1)).await.unwrap();
        store.save_checkpoint(&capture(&store, task_id, TaskState::Executing, 2)).await.unwrap();
        store.save_checkpoint(&capture(&store, task_id, TaskState::Complete, 3)).await.unwrap();

        let latest = store.latest(task_id).await.unwrap().unwrap();
        assert_eq!(latest.cursor, 3);
        assert!(!latest.can_resume);

        let resumable = store.latest_resumable(task_id).await.unwrap().unwrap();
        assert_eq!(resumable.cursor, 2);
        assert!(resumable.can_resume);
    }

    #[tokio::test]
    async fn test_retention_keeps_newest() {
        let store = store(2);
        let task_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        for cursor in 0..5 {
            store.save_checkpoint(&capture(&store, task_id, TaskState::Executing, cursor)).await.unwrap();
        }
        store.save_checkpoint(&capture(&store, other, TaskState::Executing, 0)).await.unwrap();

        let cursors: Vec<usize> = store
            .list_checkpoints(task_id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.cursor)
            .collect();
        assert_eq!(cursors, vec![3, 4]);
        assert_eq!(store.list_checkpoints(other).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_task_removes_everything() {
        let store = store(10);
        let record = TaskRecord::new(Task::new("t", Value::Null));
        let task_id = record.task.id;
        store.save_task(&record).await.unwrap();
        store.save_checkpoint(&capture(&store, task_id, TaskState::Waiting, 0)).await.unwrap();

        assert_eq!(store.delete_task(task_id).await.unwrap(), 2);
        assert!(store.load_task(task_id).await.unwrap().is_none());
        assert!(store.latest(task_id).await.unwrap().is_none());
    }
}
