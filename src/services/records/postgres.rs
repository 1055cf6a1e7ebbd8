use async_trait::async_trait;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::{BTreeMap, BTreeSet};

use super::{ClusterLevel, LogSample, MinuteRange, RecordStore, SampleSnapshot};
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct SampleRow {
    id: i64,
    config_id: String,
    host: String,
    minute: i64,
    level: i16,
    cluster_label: String,
    text: String,
    count: i64,
    tags: SqlJson<BTreeMap<String, String>>,
}

impl SampleRow {
    fn into_sample(self) -> Option<LogSample> {
        let level = ClusterLevel::from_rank(self.level)?;
        Some(LogSample {
            config_id: self.config_id,
            host: self.host,
            minute: self.minute,
            level,
            cluster_label: self.cluster_label,
            text: self.text,
            count: self.count,
            tags: self.tags.0,
        })
    }
}

fn ranks(levels: &[ClusterLevel]) -> Vec<i16> {
    levels.iter().map(ClusterLevel::rank).collect()
}

async fn insert_samples(
    tx: &mut Transaction<'_, Postgres>,
    samples: &[LogSample],
) -> Result<(), sqlx::Error> {
    for sample in samples {
        let hosts: Vec<String> = sample.hosts().into_iter().collect();
        sqlx::query(
            r#"
            INSERT INTO cv_log_samples (
                config_id, host, minute, level, cluster_label, text, count, hosts, tags
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&sample.config_id)
        .bind(&sample.host)
        .bind(sample.minute)
        .bind(sample.level.rank())
        .bind(&sample.cluster_label)
        .bind(&sample.text)
        .bind(sample.count)
        .bind(hosts)
        .bind(SqlJson(&sample.tags))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn save_batch(&self, samples: Vec<LogSample>) -> Result<(), StoreError> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        insert_samples(&mut tx, &samples).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        config_id: &str,
        level: ClusterLevel,
        range: MinuteRange,
        hosts: &[String],
    ) -> Result<Vec<LogSample>, StoreError> {
        let rows: Vec<SampleRow> = sqlx::query_as(
            r#"
            SELECT id, config_id, host, minute, level, cluster_label, text, count, tags
            FROM cv_log_samples
            WHERE config_id = $1
              AND level = $2
              AND minute BETWEEN $3 AND $4
              AND (cardinality($5::text[]) = 0 OR hosts && $5::text[])
            ORDER BY minute ASC, host ASC, id ASC
            "#,
        )
        .bind(config_id)
        .bind(level.rank())
        .bind(range.start)
        .bind(range.end)
        .bind(hosts)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(SampleRow::into_sample).collect())
    }

    async fn snapshot(
        &self,
        config_id: &str,
        level: ClusterLevel,
        range: MinuteRange,
    ) -> Result<SampleSnapshot, StoreError> {
        let rows: Vec<SampleRow> = sqlx::query_as(
            r#"
            SELECT id, config_id, host, minute, level, cluster_label, text, count, tags
            FROM cv_log_samples
            WHERE config_id = $1 AND level = $2 AND minute BETWEEN $3 AND $4
            ORDER BY minute ASC, host ASC, id ASC
            "#,
        )
        .bind(config_id)
        .bind(level.rank())
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        let mut snapshot = SampleSnapshot::default();
        for row in rows {
            let id = row.id;
            if let Some(sample) = row.into_sample() {
                snapshot.row_ids.push(id);
                snapshot.samples.push(sample);
            }
        }
        Ok(snapshot)
    }

    async fn delete_level(
        &self,
        config_id: &str,
        level: ClusterLevel,
        range: MinuteRange,
        hosts: &[String],
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cv_log_samples
            WHERE config_id = $1
              AND level = $2
              AND minute BETWEEN $3 AND $4
              AND (cardinality($5::text[]) = 0 OR hosts && $5::text[])
            "#,
        )
        .bind(config_id)
        .bind(level.rank())
        .bind(range.start)
        .bind(range.end)
        .bind(hosts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_distinct_hosts(
        &self,
        config_id: &str,
        level: ClusterLevel,
        minute: i64,
    ) -> Result<usize, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT h)::BIGINT
            FROM cv_log_samples, unnest(hosts) AS h
            WHERE config_id = $1 AND level = $2 AND minute = $3
            "#,
        )
        .bind(config_id)
        .bind(level.rank())
        .bind(minute)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.max(0) as usize)
    }

    async fn reported_hosts(
        &self,
        config_id: &str,
        levels: &[ClusterLevel],
        minute: i64,
    ) -> Result<BTreeSet<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT h
            FROM cv_log_samples, unnest(hosts) AS h
            WHERE config_id = $1
              AND level = ANY($2)
              AND minute = $3
              AND cluster_label = $4
            "#,
        )
        .bind(config_id)
        .bind(ranks(levels))
        .bind(minute)
        .bind(super::HEARTBEAT_LABEL)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    async fn max_minute(
        &self,
        config_id: &str,
        levels: &[ClusterLevel],
    ) -> Result<Option<i64>, StoreError> {
        let row: (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT MAX(minute)
            FROM cv_log_samples
            WHERE config_id = $1 AND level = ANY($2)
            "#,
        )
        .bind(config_id)
        .bind(ranks(levels))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn pending_minutes(
        &self,
        config_id: &str,
        level: ClusterLevel,
        up_to: i64,
    ) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT minute
            FROM cv_log_samples
            WHERE config_id = $1 AND level = $2 AND minute <= $3
            ORDER BY minute ASC
            "#,
        )
        .bind(config_id)
        .bind(level.rank())
        .bind(up_to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    async fn promote(
        &self,
        config_id: &str,
        taken: &[i64],
        next: Vec<LogSample>,
    ) -> Result<u64, StoreError> {
        if taken.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let deleted =
            sqlx::query("DELETE FROM cv_log_samples WHERE config_id = $1 AND id = ANY($2)")
                .bind(config_id)
                .bind(taken)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        if deleted != taken.len() as u64 {
            // Another promoter got here first.
            tx.rollback().await?;
            return Ok(0);
        }
        insert_samples(&mut tx, &next).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn delete_up_to(
        &self,
        config_id: &str,
        levels: &[ClusterLevel],
        up_to: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cv_log_samples
            WHERE config_id = $1 AND level = ANY($2) AND minute <= $3
            "#,
        )
        .bind(config_id)
        .bind(ranks(levels))
        .bind(up_to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_config(&self, config_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM cv_log_samples WHERE config_id = $1")
            .bind(config_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pg_test_pool, raw_batch, raw_line};
    use anyhow::Result;

    #[tokio::test]
    async fn promotion_moves_rows_between_levels_once() -> Result<()> {
        let Some(pool) = pg_test_pool("cv_records_test").await? else {
            return Ok(());
        };
        let store = PgRecordStore::new(pool);
        store.save_batch(raw_batch("host1", 10, &["disk full"])).await?;
        store.save(raw_line("host1", 11, "later")).await?;

        let taken = store
            .snapshot("cfg", ClusterLevel::HostRaw, MinuteRange::single(10))
            .await?;
        assert_eq!(taken.row_ids.len(), 2);
        store.save(raw_line("host1", 10, "arrived late")).await?;

        let mut clustered = raw_line("host1", 10, "disk full");
        clustered.level = ClusterLevel::HostClustered;
        let moved = store
            .promote("cfg", &taken.row_ids, vec![clustered.clone()])
            .await?;
        assert_eq!(moved, 2);
        let again = store.promote("cfg", &taken.row_ids, vec![clustered]).await?;
        assert_eq!(again, 0, "second promoter must not duplicate rows");
        let late = store
            .query("cfg", ClusterLevel::HostRaw, MinuteRange::single(10), &[])
            .await?;
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].text, "arrived late");

        let promoted = store
            .query("cfg", ClusterLevel::HostClustered, MinuteRange::single(10), &[])
            .await?;
        assert_eq!(promoted.len(), 1);
        assert_eq!(
            store.pending_minutes("cfg", ClusterLevel::HostRaw, 100).await?,
            vec![10, 11]
        );
        assert_eq!(store.latest_minute("cfg").await?, Some(11));
        assert_eq!(
            store.delete_up_to("cfg", &[ClusterLevel::HostRaw], 11).await?,
            2
        );
        Ok(())
    }
}
