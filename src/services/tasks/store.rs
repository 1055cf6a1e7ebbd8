use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::backoff::BACKOFF_LIMIT;
use super::types::{AnalysisResult, AnalysisTask, TaskKey, TaskPhase, TaskStatus};
use crate::error::StoreError;
use crate::services::records::MinuteRange;

/// Durable task state.
///
/// Status transitions are compare-and-set on the current status, so a callback
/// racing the reaper (or a duplicate callback) loses cleanly instead of
/// overwriting a newer state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when an active task holds the same key.
    async fn insert(&self, task: AnalysisTask) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<AnalysisTask>, StoreError>;

    /// Most recently created task for `key`.
    async fn latest_for_key(&self, key: &TaskKey) -> Result<Option<AnalysisTask>, StoreError>;

    /// Oldest queued task moves to running.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<AnalysisTask>, StoreError>;

    /// Running to success, keeping `result`. False when the task was not running.
    async fn complete(
        &self,
        id: Uuid,
        result: &AnalysisResult,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Running to failed, counting the attempt.
    async fn fail(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AnalysisTask>, StoreError>;

    /// Running to failed without touching the retry budget.
    async fn discard(&self, id: Uuid, reason: &str, now: DateTime<Utc>)
        -> Result<bool, StoreError>;

    /// Failed to queued. False when the task is no longer failed or its key is busy.
    async fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Running tasks untouched since `cutoff` move to failed.
    async fn reap_stuck(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnalysisTask>, StoreError>;

    async fn list_failed(&self, config_id: &str) -> Result<Vec<AnalysisTask>, StoreError>;

    async fn count_active(
        &self,
        config_id: &str,
        phase: TaskPhase,
        range: MinuteRange,
    ) -> Result<usize, StoreError>;

    async fn get_result(&self, id: Uuid) -> Result<Option<AnalysisResult>, StoreError>;

    async fn delete_config(&self, config_id: &str) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct TaskTable {
    tasks: HashMap<Uuid, AnalysisTask>,
    results: HashMap<Uuid, AnalysisResult>,
}

impl TaskTable {
    fn active_for_key(&self, key: &TaskKey) -> Option<&AnalysisTask> {
        self.tasks
            .values()
            .find(|task| &task.key == key && task.status.is_active())
    }

    fn transition(
        &mut self,
        id: Uuid,
        from: TaskStatus,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut AnalysisTask),
    ) -> Option<AnalysisTask> {
        let task = self.tasks.get_mut(&id)?;
        if task.status != from {
            return None;
        }
        apply(task);
        task.last_updated = now;
        Some(task.clone())
    }
}

fn record_failure(task: &mut AnalysisTask, reason: &str) {
    task.status = TaskStatus::Failed;
    task.retry_count = task.retry_count.saturating_add(1);
    task.backoff_count = (task.backoff_count + 1).min(BACKOFF_LIMIT);
    task.error = Some(reason.to_string());
}

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    table: Mutex<TaskTable>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: AnalysisTask) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        if task.status.is_active() && table.active_for_key(&task.key).is_some() {
            return Err(StoreError::Conflict(format!("task {}", task.key)));
        }
        table.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AnalysisTask>, StoreError> {
        Ok(self.table.lock().await.tasks.get(&id).cloned())
    }

    async fn latest_for_key(&self, key: &TaskKey) -> Result<Option<AnalysisTask>, StoreError> {
        let table = self.table.lock().await;
        Ok(table
            .tasks
            .values()
            .filter(|task| &task.key == key)
            .max_by_key(|task| task.created_at)
            .cloned())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<AnalysisTask>, StoreError> {
        let mut table = self.table.lock().await;
        let next = table
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Queued)
            .min_by_key(|task| (task.last_updated, task.created_at))
            .map(|task| task.id);
        Ok(next.and_then(|id| {
            table.transition(id, TaskStatus::Queued, now, |task| {
                task.status = TaskStatus::Running;
            })
        }))
    }

    async fn complete(
        &self,
        id: Uuid,
        result: &AnalysisResult,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut table = self.table.lock().await;
        let done = table
            .transition(id, TaskStatus::Running, now, |task| {
                task.status = TaskStatus::Success;
                task.error = None;
            })
            .is_some();
        if done {
            table.results.insert(id, result.clone());
        }
        Ok(done)
    }

    async fn fail(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AnalysisTask>, StoreError> {
        let mut table = self.table.lock().await;
        Ok(table.transition(id, TaskStatus::Running, now, |task| {
            record_failure(task, reason)
        }))
    }

    async fn discard(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut table = self.table.lock().await;
        Ok(table
            .transition(id, TaskStatus::Running, now, |task| {
                task.status = TaskStatus::Failed;
                task.error = Some(reason.to_string());
            })
            .is_some())
    }

    async fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut table = self.table.lock().await;
        let Some(key) = table.tasks.get(&id).map(|task| task.key.clone()) else {
            return Ok(false);
        };
        if table.active_for_key(&key).is_some() {
            return Ok(false);
        }
        Ok(table
            .transition(id, TaskStatus::Failed, now, |task| {
                task.status = TaskStatus::Queued;
            })
            .is_some())
    }

    async fn reap_stuck(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnalysisTask>, StoreError> {
        let mut table = self.table.lock().await;
        let stuck: Vec<Uuid> = table
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Running && task.last_updated < cutoff)
            .map(|task| task.id)
            .collect();
        Ok(stuck
            .into_iter()
            .filter_map(|id| {
                table.transition(id, TaskStatus::Running, now, |task| {
                    record_failure(task, "stuck")
                })
            })
            .collect())
    }

    async fn list_failed(&self, config_id: &str) -> Result<Vec<AnalysisTask>, StoreError> {
        let table = self.table.lock().await;
        let mut failed: Vec<AnalysisTask> = table
            .tasks
            .values()
            .filter(|task| task.key.config_id == config_id && task.status == TaskStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|task| (task.key.minute, task.created_at));
        Ok(failed)
    }

    async fn count_active(
        &self,
        config_id: &str,
        phase: TaskPhase,
        range: MinuteRange,
    ) -> Result<usize, StoreError> {
        let table = self.table.lock().await;
        Ok(table
            .tasks
            .values()
            .filter(|task| {
                task.key.config_id == config_id
                    && task.key.phase == phase
                    && range.contains(task.key.minute)
                    && task.status.is_active()
            })
            .count())
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<AnalysisResult>, StoreError> {
        Ok(self.table.lock().await.results.get(&id).cloned())
    }

    async fn delete_config(&self, config_id: &str) -> Result<u64, StoreError> {
        let mut table = self.table.lock().await;
        let doomed: Vec<Uuid> = table
            .tasks
            .values()
            .filter(|task| task.key.config_id == config_id)
            .map(|task| task.id)
            .collect();
        for id in &doomed {
            table.tasks.remove(id);
            table.results.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
