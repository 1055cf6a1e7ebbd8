use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use super::backoff::RetryPolicy;
use super::store::TaskStore;
use super::types::{
    AnalysisTask, NoOpReason, Scheduled, TaskDescriptor, TaskInputs, TaskKey, TaskOutcome,
    TaskPhase, TaskStatus,
};
use crate::error::StoreError;
use crate::services::configs::{ConfigStore, VerificationConfig};
use crate::services::records::{ClusterLevel, MinuteRange, RecordStore};
use crate::services::risk::{AlertDecision, RiskEvaluator};

/// Builds the URLs handed to workers.
#[derive(Debug, Clone)]
pub struct WorkerUrls {
    base: Url,
}

impl WorkerUrls {
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    /// Where a worker reads the samples of `level` for `range`.
    pub fn records_url(&self, config_id: &str, level: ClusterLevel, range: MinuteRange) -> String {
        let mut url = self.base.clone();
        url.set_path(&format!("/api/records/{config_id}/{}", level.as_str()));
        url.query_pairs_mut()
            .clear()
            .append_pair("from", &range.start.to_string())
            .append_pair("to", &range.end.to_string());
        url.to_string()
    }

    /// Where a worker posts the result of `task_id`.
    pub fn save_url(&self, task_id: Uuid) -> String {
        let mut url = self.base.clone();
        url.set_path(&format!("/api/tasks/{task_id}/result"));
        url.set_query(None);
        url.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultDisposition {
    /// The task was not running; a late or duplicate callback.
    Ignored,
    /// The owning run is gone.
    Discarded,
    Completed(Option<AlertDecision>),
    Failed { retryable: bool },
}

pub struct TaskScheduler {
    tasks: Arc<dyn TaskStore>,
    records: Arc<dyn RecordStore>,
    configs: Arc<dyn ConfigStore>,
    risk: Arc<RiskEvaluator>,
    policy: RetryPolicy,
    liveness: Duration,
    urls: WorkerUrls,
}

impl TaskScheduler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        records: Arc<dyn RecordStore>,
        configs: Arc<dyn ConfigStore>,
        risk: Arc<RiskEvaluator>,
        policy: RetryPolicy,
        liveness: Duration,
        urls: WorkerUrls,
    ) -> Self {
        Self {
            tasks,
            records,
            configs,
            risk,
            policy,
            liveness,
            urls,
        }
    }

    pub fn urls(&self) -> &WorkerUrls {
        &self.urls
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Creates the analysis task for (`level`, `minute`) unless one is in flight,
    /// done, backing off or out of retries.
    pub async fn schedule_if_ready(
        &self,
        config: &VerificationConfig,
        level: ClusterLevel,
        minute: i64,
        inputs: TaskInputs,
        now: DateTime<Utc>,
    ) -> Result<Scheduled> {
        let Some(phase) = TaskPhase::for_level(level) else {
            anyhow::bail!("{level} samples are not analyzed by workers");
        };
        if !self.configs.is_run_valid(&config.id).await? {
            return Ok(Scheduled::NoOp(NoOpReason::RunInvalid));
        }

        let key = TaskKey::new(phase, config.id.clone(), minute);
        if let Some(previous) = self.tasks.latest_for_key(&key).await? {
            match previous.status {
                TaskStatus::Queued | TaskStatus::Running => {
                    return Ok(Scheduled::NoOp(NoOpReason::InFlight))
                }
                TaskStatus::Success => return Ok(Scheduled::NoOp(NoOpReason::Completed)),
                TaskStatus::Failed => return self.retry(&previous, now).await,
            }
        }

        let id = Uuid::new_v4();
        let task = AnalysisTask {
            id,
            account_id: config.account_id.clone(),
            key,
            control_input: inputs.control_input,
            test_input: inputs.test_input,
            save_url: self.urls.save_url(id),
            tolerance: config.tolerance,
            status: TaskStatus::Queued,
            retry_count: 0,
            backoff_count: 0,
            error: None,
            created_at: now,
            last_updated: now,
        };
        match self.tasks.insert(task).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => return Ok(Scheduled::NoOp(NoOpReason::InFlight)),
            Err(err) => return Err(err.into()),
        }
        tracing::info!(
            config_id = %config.id,
            phase = %phase,
            minute,
            task_id = %id,
            "scheduled analysis task"
        );
        Ok(Scheduled::Created(id))
    }

    async fn retry(&self, task: &AnalysisTask, now: DateTime<Utc>) -> Result<Scheduled> {
        if self.policy.is_exhausted(task) {
            return Ok(Scheduled::NoOp(NoOpReason::Exhausted));
        }
        if !self.policy.allows_retry(task, now) {
            return Ok(Scheduled::NoOp(NoOpReason::BackingOff));
        }
        if !self.tasks.requeue(task.id, now).await? {
            return Ok(Scheduled::NoOp(NoOpReason::InFlight));
        }
        tracing::info!(
            task_id = %task.id,
            key = %task.key,
            retries = task.retry_count,
            "requeued failed analysis task"
        );
        Ok(Scheduled::Requeued(task.id))
    }

    /// Applies a worker callback.
    pub async fn on_task_result(
        &self,
        task_id: Uuid,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<ResultDisposition> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Running {
            tracing::debug!(task_id = %task_id, status = task.status.as_str(), "ignoring late callback");
            return Ok(ResultDisposition::Ignored);
        }

        let config = self.configs.get(&task.key.config_id).await?;
        let Some(config) = config.filter(|config| config.enabled) else {
            self.tasks.discard(task_id, "run_invalid", now).await?;
            tracing::info!(task_id = %task_id, key = %task.key, "discarded result for invalid run");
            return Ok(ResultDisposition::Discarded);
        };

        let result = match outcome {
            TaskOutcome::Success(result) => match result.validate() {
                Ok(()) => result,
                Err(reason) => {
                    return self
                        .record_failure(&task, &format!("malformed_result: {reason}"), now)
                        .await
                }
            },
            TaskOutcome::Failure { reason } => {
                return self.record_failure(&task, &reason, now).await
            }
        };

        // The task stays running until the alert decision is stored.
        let decision = match task.key.phase {
            TaskPhase::ClusterL1 => None,
            TaskPhase::ClusterL2 => Some(
                self.risk
                    .on_analysis_result(&config, task.key.minute, &result, now)
                    .await
                    .with_context(|| format!("failed to evaluate risk for {}", task.key))?,
            ),
        };
        if !self.tasks.complete(task_id, &result, now).await? {
            return Ok(ResultDisposition::Ignored);
        }
        tracing::info!(
            task_id = %task_id,
            key = %task.key,
            risk_score = result.risk_score,
            "analysis task completed"
        );
        Ok(ResultDisposition::Completed(decision))
    }

    async fn record_failure(
        &self,
        task: &AnalysisTask,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ResultDisposition> {
        let Some(failed) = self.tasks.fail(task.id, reason, now).await? else {
            return Ok(ResultDisposition::Ignored);
        };
        tracing::warn!(
            task_id = %failed.id,
            key = %failed.key,
            retries = failed.retry_count,
            reason = %reason,
            "analysis task failed"
        );
        if self.policy.is_exhausted(&failed) {
            self.risk.on_task_exhausted(&failed, now).await?;
            return Ok(ResultDisposition::Failed { retryable: false });
        }
        Ok(ResultDisposition::Failed { retryable: true })
    }

    /// Fails running tasks that stopped reporting.
    pub async fn reap_stuck(&self, now: DateTime<Utc>) -> Result<usize> {
        let liveness = chrono::Duration::from_std(self.liveness)
            .context("task liveness does not fit a timestamp offset")?;
        let reaped = self.tasks.reap_stuck(now - liveness, now).await?;
        for task in &reaped {
            tracing::warn!(
                task_id = %task.id,
                key = %task.key,
                retries = task.retry_count,
                "reaped stuck analysis task"
            );
            if self.policy.is_exhausted(task) {
                self.risk.on_task_exhausted(task, now).await?;
            }
        }
        Ok(reaped.len())
    }

    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<TaskDescriptor>> {
        let claimed = self.tasks.claim_next(now).await?;
        if let Some(task) = &claimed {
            tracing::debug!(task_id = %task.id, key = %task.key, "task claimed");
        }
        Ok(claimed.map(|task| task.descriptor()))
    }

    /// Requeues failed tasks of `config_id` whose backoff elapsed.
    pub async fn retry_failed(&self, config_id: &str, now: DateTime<Utc>) -> Result<usize> {
        if !self.configs.is_run_valid(config_id).await? {
            return Ok(0);
        }
        let mut requeued = 0;
        for task in self.tasks.list_failed(config_id).await? {
            // A newer task for the same key supersedes this one.
            let latest = self.tasks.latest_for_key(&task.key).await?;
            if latest.is_some_and(|latest| latest.id != task.id) {
                continue;
            }
            if task.key.phase == TaskPhase::ClusterL1 && !self.l1_rows_remain(&task).await? {
                tracing::debug!(
                    task_id = %task.id,
                    key = %task.key,
                    "window already merged; not retrying cross-host analysis"
                );
                continue;
            }
            if matches!(self.retry(&task, now).await?, Scheduled::Requeued(_)) {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// L1 rows of a minute are gone once its window was merged into L2.
    async fn l1_rows_remain(&self, task: &AnalysisTask) -> Result<bool> {
        let rows = self
            .records
            .query(
                &task.key.config_id,
                ClusterLevel::CrossHostClustered,
                MinuteRange::single(task.key.minute),
                &[],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// True when no cross-host analysis is still queued or running inside `range`.
    pub async fn window_settled(&self, config_id: &str, range: MinuteRange) -> Result<bool> {
        let active = self
            .tasks
            .count_active(config_id, TaskPhase::ClusterL1, range)
            .await?;
        Ok(active == 0)
    }
}
