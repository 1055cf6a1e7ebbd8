use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::backoff::BACKOFF_LIMIT;
use super::store::TaskStore;
use super::types::{AnalysisResult, AnalysisTask, TaskKey, TaskPhase, TaskStatus};
use crate::error::StoreError;
use crate::services::configs::Tolerance;
use crate::services::records::MinuteRange;

#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: Uuid,
    account_id: String,
    config_id: String,
    phase: String,
    minute: i64,
    control_input: String,
    test_input: Option<String>,
    save_url: String,
    tolerance: String,
    status: String,
    retry_count: i32,
    backoff_count: i32,
    error: Option<String>,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Option<AnalysisTask> {
        let phase = TaskPhase::parse(&self.phase)?;
        let status = TaskStatus::parse(&self.status)?;
        Some(AnalysisTask {
            id: self.id,
            account_id: self.account_id,
            key: TaskKey::new(phase, self.config_id, self.minute),
            control_input: self.control_input,
            test_input: self.test_input,
            save_url: self.save_url,
            tolerance: Tolerance::parse(&self.tolerance).unwrap_or_default(),
            status,
            retry_count: self.retry_count.max(0) as u32,
            backoff_count: self.backoff_count.max(0) as u32,
            error: self.error,
            created_at: self.created_at,
            last_updated: self.last_updated,
        })
    }
}

const TASK_COLUMNS: &str = "id, account_id, config_id, phase, minute, control_input, test_input, \
     save_url, tolerance, status, retry_count, backoff_count, error, created_at, last_updated";

fn into_tasks(rows: Vec<TaskRow>) -> Vec<AnalysisTask> {
    rows.into_iter().filter_map(TaskRow::into_task).collect()
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, task: AnalysisTask) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cv_tasks (
                id, account_id, config_id, phase, minute, task_key, task_key_hash,
                control_input, test_input, save_url, tolerance, status, retry_count,
                backoff_count, error, created_at, last_updated
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17
            )
            "#,
        )
        .bind(task.id)
        .bind(&task.account_id)
        .bind(&task.key.config_id)
        .bind(task.key.phase.as_str())
        .bind(task.key.minute)
        .bind(task.key.storage_key())
        .bind(task.key.hash())
        .bind(&task.control_input)
        .bind(&task.test_input)
        .bind(&task.save_url)
        .bind(task.tolerance.as_str())
        .bind(task.status.as_str())
        .bind(task.retry_count as i32)
        .bind(task.backoff_count as i32)
        .bind(&task.error)
        .bind(task.created_at)
        .bind(task.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::from_db(err, &format!("task {}", task.key)))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AnalysisTask>, StoreError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM cv_tasks WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(TaskRow::into_task))
    }

    async fn latest_for_key(&self, key: &TaskKey) -> Result<Option<AnalysisTask>, StoreError> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM cv_tasks WHERE task_key_hash = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(key.hash())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(TaskRow::into_task))
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<AnalysisTask>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let claimed: Option<TaskRow> = sqlx::query_as(&format!(
            r#"
            WITH next AS (
                SELECT id
                FROM cv_tasks
                WHERE status = 'queued'
                ORDER BY last_updated ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE cv_tasks
            SET status = 'running', last_updated = $1
            WHERE id IN (SELECT id FROM next)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(claimed.and_then(TaskRow::into_task))
    }

    async fn complete(
        &self,
        id: Uuid,
        result: &AnalysisResult,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE cv_tasks
            SET status = 'success', result = $2, error = NULL, last_updated = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(SqlJson(result))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn fail(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AnalysisTask>, StoreError> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            r#"
            UPDATE cv_tasks
            SET status = 'failed',
                retry_count = retry_count + 1,
                backoff_count = LEAST(backoff_count + 1, $4),
                error = $2,
                last_updated = $3
            WHERE id = $1 AND status = 'running'
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(reason)
        .bind(now)
        .bind(BACKOFF_LIMIT as i32)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(TaskRow::into_task))
    }

    async fn discard(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE cv_tasks
            SET status = 'failed', error = $2, last_updated = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE cv_tasks
            SET status = 'queued', last_updated = $2
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await;
        match updated {
            Ok(result) => Ok(result.rows_affected() == 1),
            // Another attempt for the key is already active.
            Err(err) if crate::error::is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn reap_stuck(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnalysisTask>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
            UPDATE cv_tasks
            SET status = 'failed',
                retry_count = retry_count + 1,
                backoff_count = LEAST(backoff_count + 1, $3),
                error = 'stuck',
                last_updated = $2
            WHERE status = 'running' AND last_updated < $1
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(cutoff)
        .bind(now)
        .bind(BACKOFF_LIMIT as i32)
        .fetch_all(&self.pool)
        .await?;
        Ok(into_tasks(rows))
    }

    async fn list_failed(&self, config_id: &str) -> Result<Vec<AnalysisTask>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM cv_tasks WHERE config_id = $1 AND status = 'failed' \
             ORDER BY minute ASC, created_at ASC"
        ))
        .bind(config_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(into_tasks(rows))
    }

    async fn count_active(
        &self,
        config_id: &str,
        phase: TaskPhase,
        range: MinuteRange,
    ) -> Result<usize, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)::BIGINT
            FROM cv_tasks
            WHERE config_id = $1
              AND phase = $2
              AND minute BETWEEN $3 AND $4
              AND status IN ('queued', 'running')
            "#,
        )
        .bind(config_id)
        .bind(phase.as_str())
        .bind(range.start)
        .bind(range.end)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.max(0) as usize)
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<AnalysisResult>, StoreError> {
        let row: Option<(Option<SqlJson<AnalysisResult>>,)> =
            sqlx::query_as("SELECT result FROM cv_tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(result,)| result).map(|result| result.0))
    }

    async fn delete_config(&self, config_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM cv_tasks WHERE config_id = $1")
            .bind(config_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
