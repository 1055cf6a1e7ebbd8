use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::collections::HashSet;
use uuid::Uuid;

use super::store::AlertStore;
use super::types::{
    Alert, AlertCategory, AlertSeverity, AlertStatus, DataGap, Feedback, FeedbackKind,
};
use crate::error::StoreError;
use crate::ids::advisory_lock_key;

#[derive(Debug, Clone)]
pub struct PgAlertStore {
    pool: PgPool,
}

impl PgAlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct AlertRow {
    id: Uuid,
    config_id: String,
    minute: i64,
    category: String,
    severity: String,
    fingerprint: Option<String>,
    risk_score: f64,
    text: Option<String>,
    hosts: Vec<String>,
    status: String,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl AlertRow {
    fn into_alert(self) -> Option<Alert> {
        Some(Alert {
            id: self.id,
            config_id: self.config_id,
            minute: self.minute,
            category: AlertCategory::parse(&self.category)?,
            severity: AlertSeverity::parse(&self.severity)?,
            fingerprint: self.fingerprint,
            risk_score: self.risk_score,
            text: self.text,
            hosts: self.hosts,
            status: if self.status == AlertStatus::Closed.as_str() {
                AlertStatus::Closed
            } else {
                AlertStatus::Open
            },
            created_at: self.created_at,
            closed_at: self.closed_at,
        })
    }
}

#[async_trait]
impl AlertStore for PgAlertStore {
    async fn insert_if_absent(&self, alert: Alert) -> Result<bool, StoreError> {
        let lock_key = advisory_lock_key(
            "cv_alerts",
            &format!("{}:{}", alert.config_id, alert.minute),
        );
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_key)
            .execute(&mut *tx)
            .await?;
        let (covered,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM cv_alerts
                WHERE config_id = $1
                  AND minute = $2
                  AND ($3::text = 'risk' OR category = 'risk' OR fingerprint IS NOT DISTINCT FROM $4)
            )
            "#,
        )
        .bind(&alert.config_id)
        .bind(alert.minute)
        .bind(alert.category.as_str())
        .bind(&alert.fingerprint)
        .fetch_one(&mut *tx)
        .await?;
        if covered {
            tx.rollback().await?;
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO cv_alerts (
                id, config_id, minute, category, severity, fingerprint, dedup_key,
                risk_score, text, hosts, status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (config_id, dedup_key) DO NOTHING
            "#,
        )
        .bind(alert.id)
        .bind(&alert.config_id)
        .bind(alert.minute)
        .bind(alert.category.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.fingerprint)
        .bind(alert.dedup_key())
        .bind(alert.risk_score)
        .bind(&alert.text)
        .bind(&alert.hosts)
        .bind(alert.status.as_str())
        .bind(alert.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_for_config(&self, config_id: &str) -> Result<Vec<Alert>, StoreError> {
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, config_id, minute, category, severity, fingerprint, risk_score,
                   text, hosts, status, created_at, closed_at
            FROM cv_alerts
            WHERE config_id = $1
            ORDER BY minute ASC, created_at ASC
            "#,
        )
        .bind(config_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(AlertRow::into_alert).collect())
    }

    async fn close(&self, alert_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            WITH target AS (
                SELECT id, status AS previous FROM cv_alerts WHERE id = $1 FOR UPDATE
            )
            UPDATE cv_alerts
            SET status = 'closed', closed_at = COALESCE(cv_alerts.closed_at, $2)
            FROM target
            WHERE cv_alerts.id = target.id
            RETURNING target.previous
            "#,
        )
        .bind(alert_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((previous,)) => Ok(previous != AlertStatus::Closed.as_str()),
            None => Err(StoreError::NotFound(format!("alert {alert_id}"))),
        }
    }

    async fn close_open_before(
        &self,
        config_id: &str,
        category: AlertCategory,
        minute: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cv_alerts
            SET status = 'closed', closed_at = $4
            WHERE config_id = $1 AND category = $2 AND minute < $3 AND status = 'open'
            "#,
        )
        .bind(config_id)
        .bind(category.as_str())
        .bind(minute)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn append_feedback(&self, feedback: Feedback) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cv_feedback (config_id, fingerprint, kind, comment, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&feedback.config_id)
        .bind(&feedback.fingerprint)
        .bind(feedback.kind.as_str())
        .bind(&feedback.comment)
        .bind(feedback.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fingerprints_with(
        &self,
        config_id: &str,
        kind: FeedbackKind,
    ) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT fingerprint FROM cv_feedback WHERE config_id = $1 AND kind = $2",
        )
        .bind(config_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    async fn record_gap(&self, gap: DataGap) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cv_data_gaps (config_id, minute, phase, task_id, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (config_id, minute, phase) DO NOTHING
            "#,
        )
        .bind(&gap.config_id)
        .bind(gap.minute)
        .bind(&gap.phase)
        .bind(gap.task_id)
        .bind(&gap.reason)
        .bind(gap.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_gaps(&self, config_id: &str) -> Result<Vec<DataGap>, StoreError> {
        let rows: Vec<(String, i64, String, Uuid, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT config_id, minute, phase, task_id, reason, created_at
            FROM cv_data_gaps
            WHERE config_id = $1
            ORDER BY minute ASC
            "#,
        )
        .bind(config_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(config_id, minute, phase, task_id, reason, created_at)| DataGap {
                    config_id,
                    minute,
                    phase,
                    task_id,
                    reason,
                    created_at,
                },
            )
            .collect())
    }
}
