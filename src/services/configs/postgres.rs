use async_trait::async_trait;
use sqlx::{FromRow, PgPool};

use super::{ConfigStore, Tolerance, VerificationConfig};
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct PgConfigStore {
    pool: PgPool,
}

impl PgConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct ConfigRow {
    id: String,
    account_id: String,
    name: String,
    enabled: bool,
    hosts: Vec<String>,
    collector_url: Option<String>,
    alert_enabled: bool,
    alert_threshold: f64,
    tolerance: String,
    baseline_start: Option<i64>,
    baseline_end: Option<i64>,
}

impl From<ConfigRow> for VerificationConfig {
    fn from(row: ConfigRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            name: row.name,
            enabled: row.enabled,
            hosts: row.hosts,
            collector_url: row.collector_url,
            alert_enabled: row.alert_enabled,
            alert_threshold: row.alert_threshold,
            tolerance: Tolerance::parse(&row.tolerance).unwrap_or_default(),
            baseline_start: row.baseline_start,
            baseline_end: row.baseline_end,
        }
    }
}

const SELECT_CONFIG: &str = r#"
    SELECT id, account_id, name, enabled, hosts, collector_url, alert_enabled,
           alert_threshold, tolerance, baseline_start, baseline_end
    FROM cv_configs
"#;

#[async_trait]
impl ConfigStore for PgConfigStore {
    async fn list_accounts(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT account_id FROM cv_configs WHERE enabled ORDER BY account_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    async fn list_enabled(&self, account_id: &str) -> Result<Vec<VerificationConfig>, StoreError> {
        let rows: Vec<ConfigRow> = sqlx::query_as(&format!(
            "{SELECT_CONFIG} WHERE account_id = $1 AND enabled ORDER BY id"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(VerificationConfig::from).collect())
    }

    async fn get(&self, config_id: &str) -> Result<Option<VerificationConfig>, StoreError> {
        let row: Option<ConfigRow> = sqlx::query_as(&format!("{SELECT_CONFIG} WHERE id = $1"))
            .bind(config_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(VerificationConfig::from))
    }

    async fn upsert(&self, config: VerificationConfig) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cv_configs (
                id, account_id, name, enabled, hosts, collector_url, alert_enabled,
                alert_threshold, tolerance, baseline_start, baseline_end, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now())
            ON CONFLICT (id) DO UPDATE SET
                account_id = EXCLUDED.account_id,
                name = EXCLUDED.name,
                enabled = EXCLUDED.enabled,
                hosts = EXCLUDED.hosts,
                collector_url = EXCLUDED.collector_url,
                alert_enabled = EXCLUDED.alert_enabled,
                alert_threshold = EXCLUDED.alert_threshold,
                tolerance = EXCLUDED.tolerance,
                baseline_start = EXCLUDED.baseline_start,
                baseline_end = EXCLUDED.baseline_end,
                updated_at = now()
            "#,
        )
        .bind(&config.id)
        .bind(&config.account_id)
        .bind(&config.name)
        .bind(config.enabled)
        .bind(&config.hosts)
        .bind(&config.collector_url)
        .bind(config.alert_enabled)
        .bind(config.alert_threshold)
        .bind(config.tolerance.as_str())
        .bind(config.baseline_start)
        .bind(config.baseline_end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_baseline(
        &self,
        config_id: &str,
        start: i64,
        end: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cv_configs
            SET baseline_start = $2, baseline_end = $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(config_id)
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("config {config_id}")));
        }
        Ok(())
    }

    async fn set_enabled(&self, config_id: &str, enabled: bool) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE cv_configs SET enabled = $2, updated_at = now() WHERE id = $1")
                .bind(config_id)
                .bind(enabled)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("config {config_id}")));
        }
        Ok(())
    }
}
