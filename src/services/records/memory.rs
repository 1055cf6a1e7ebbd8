use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::Mutex;

use super::{ClusterLevel, LogSample, MinuteRange, RecordStore, SampleSnapshot};
use crate::error::StoreError;

#[derive(Debug)]
struct StoredSample {
    id: i64,
    sample: LogSample,
}

#[derive(Debug, Default)]
struct SampleTables {
    next_id: i64,
    by_config: HashMap<String, Vec<StoredSample>>,
}

impl SampleTables {
    fn rows(&self, config_id: &str) -> impl Iterator<Item = &LogSample> {
        self.by_config
            .get(config_id)
            .into_iter()
            .flatten()
            .map(|stored| &stored.sample)
    }

    fn push(&mut self, sample: LogSample) {
        self.next_id += 1;
        let id = self.next_id;
        self.by_config
            .entry(sample.config_id.clone())
            .or_default()
            .push(StoredSample { id, sample });
    }

    fn retain(&mut self, config_id: &str, mut keep: impl FnMut(&StoredSample) -> bool) -> u64 {
        let Some(rows) = self.by_config.get_mut(config_id) else {
            return 0;
        };
        let before = rows.len();
        rows.retain(|stored| keep(stored));
        (before - rows.len()) as u64
    }
}

/// Record store backed by process memory. Used by tests and `--in-memory` runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: Mutex<SampleTables>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn selected(
    sample: &LogSample,
    level: ClusterLevel,
    range: MinuteRange,
    hosts: &[String],
) -> bool {
    sample.level == level && range.contains(sample.minute) && sample.matches_hosts(hosts)
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save_batch(&self, samples: Vec<LogSample>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        for sample in samples {
            tables.push(sample);
        }
        Ok(())
    }

    async fn query(
        &self,
        config_id: &str,
        level: ClusterLevel,
        range: MinuteRange,
        hosts: &[String],
    ) -> Result<Vec<LogSample>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<LogSample> = tables
            .rows(config_id)
            .filter(|sample| selected(sample, level, range, hosts))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.minute, &a.host).cmp(&(b.minute, &b.host)));
        Ok(rows)
    }

    async fn snapshot(
        &self,
        config_id: &str,
        level: ClusterLevel,
        range: MinuteRange,
    ) -> Result<SampleSnapshot, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<&StoredSample> = tables
            .by_config
            .get(config_id)
            .into_iter()
            .flatten()
            .filter(|stored| selected(&stored.sample, level, range, &[]))
            .collect();
        rows.sort_by(|a, b| {
            (a.sample.minute, &a.sample.host, a.id).cmp(&(b.sample.minute, &b.sample.host, b.id))
        });
        Ok(SampleSnapshot {
            row_ids: rows.iter().map(|stored| stored.id).collect(),
            samples: rows.into_iter().map(|stored| stored.sample.clone()).collect(),
        })
    }

    async fn delete_level(
        &self,
        config_id: &str,
        level: ClusterLevel,
        range: MinuteRange,
        hosts: &[String],
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.retain(config_id, |stored| {
            !selected(&stored.sample, level, range, hosts)
        }))
    }

    async fn count_distinct_hosts(
        &self,
        config_id: &str,
        level: ClusterLevel,
        minute: i64,
    ) -> Result<usize, StoreError> {
        let tables = self.tables.lock().await;
        let hosts: BTreeSet<String> = tables
            .rows(config_id)
            .filter(|sample| sample.level == level && sample.minute == minute)
            .flat_map(LogSample::hosts)
            .collect();
        Ok(hosts.len())
    }

    async fn reported_hosts(
        &self,
        config_id: &str,
        levels: &[ClusterLevel],
        minute: i64,
    ) -> Result<BTreeSet<String>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .rows(config_id)
            .filter(|sample| {
                sample.is_heartbeat() && sample.minute == minute && levels.contains(&sample.level)
            })
            .flat_map(LogSample::hosts)
            .collect())
    }

    async fn max_minute(
        &self,
        config_id: &str,
        levels: &[ClusterLevel],
    ) -> Result<Option<i64>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .rows(config_id)
            .filter(|sample| levels.contains(&sample.level))
            .map(|sample| sample.minute)
            .max())
    }

    async fn pending_minutes(
        &self,
        config_id: &str,
        level: ClusterLevel,
        up_to: i64,
    ) -> Result<Vec<i64>, StoreError> {
        let tables = self.tables.lock().await;
        let minutes: BTreeSet<i64> = tables
            .rows(config_id)
            .filter(|sample| sample.level == level && sample.minute <= up_to)
            .map(|sample| sample.minute)
            .collect();
        Ok(minutes.into_iter().collect())
    }

    async fn promote(
        &self,
        config_id: &str,
        taken: &[i64],
        next: Vec<LogSample>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let taken: HashSet<i64> = taken.iter().copied().collect();
        let present = tables
            .by_config
            .get(config_id)
            .into_iter()
            .flatten()
            .filter(|stored| taken.contains(&stored.id))
            .count();
        if taken.is_empty() || present != taken.len() {
            return Ok(0);
        }
        let deleted = tables.retain(config_id, |stored| !taken.contains(&stored.id));
        for sample in next {
            tables.push(sample);
        }
        Ok(deleted)
    }

    async fn delete_up_to(
        &self,
        config_id: &str,
        levels: &[ClusterLevel],
        up_to: i64,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.retain(config_id, |stored| {
            !(levels.contains(&stored.sample.level) && stored.sample.minute <= up_to)
        }))
    }

    async fn delete_config(&self, config_id: &str) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .by_config
            .remove(config_id)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::records::CROSS_HOST;
    use anyhow::Result;

    fn sample(host: &str, minute: i64, level: ClusterLevel, text: &str) -> LogSample {
        LogSample {
            config_id: "cfg".to_string(),
            host: host.to_string(),
            minute,
            level,
            cluster_label: "1".to_string(),
            text: text.to_string(),
            count: 1,
            tags: Default::default(),
        }
    }

    #[tokio::test]
    async fn promote_replaces_source_rows_atomically() -> Result<()> {
        let store = MemoryRecordStore::new();
        store
            .save_batch(vec![
                sample("a", 10, ClusterLevel::HostRaw, "x"),
                sample("b", 10, ClusterLevel::HostRaw, "y"),
                sample("a", 11, ClusterLevel::HostRaw, "z"),
            ])
            .await?;

        let taken = store
            .snapshot("cfg", ClusterLevel::HostRaw, MinuteRange::single(10))
            .await?;
        assert_eq!(taken.samples.len(), 2);
        let next = vec![sample("a", 10, ClusterLevel::HostClustered, "x")];
        let deleted = store.promote("cfg", &taken.row_ids, next.clone()).await?;
        assert_eq!(deleted, 2);
        assert_eq!(store.promote("cfg", &taken.row_ids, next).await?, 0);
        assert!(store
            .query("cfg", ClusterLevel::HostRaw, MinuteRange::single(10), &[])
            .await?
            .is_empty());
        assert_eq!(
            store
                .pending_minutes("cfg", ClusterLevel::HostRaw, 100)
                .await?,
            vec![11]
        );
        assert_eq!(store.latest_minute("cfg").await?, Some(11));
        Ok(())
    }

    #[tokio::test]
    async fn rows_saved_after_the_snapshot_survive_promotion() -> Result<()> {
        let store = MemoryRecordStore::new();
        store.save(sample("a", 10, ClusterLevel::HostRaw, "early")).await?;
        let taken = store
            .snapshot("cfg", ClusterLevel::HostRaw, MinuteRange::single(10))
            .await?;
        store.save(sample("a", 10, ClusterLevel::HostRaw, "late")).await?;

        let next = vec![sample("a", 10, ClusterLevel::HostClustered, "early")];
        assert_eq!(store.promote("cfg", &taken.row_ids, next).await?, 1);
        let left = store
            .query("cfg", ClusterLevel::HostRaw, MinuteRange::single(10), &[])
            .await?;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].text, "late");
        Ok(())
    }

    #[tokio::test]
    async fn host_filters_and_counts_see_cross_host_contributors() -> Result<()> {
        let store = MemoryRecordStore::new();
        let mut merged = sample(CROSS_HOST, 20, ClusterLevel::CrossHostRaw, "boom");
        merged.set_hosts(&["a".to_string(), "c".to_string()].into_iter().collect());
        store.save(merged).await?;
        store
            .save(LogSample::heartbeat("cfg", "b", 20, ClusterLevel::HostClustered))
            .await?;

        assert_eq!(
            store
                .count_distinct_hosts("cfg", ClusterLevel::CrossHostRaw, 20)
                .await?,
            2
        );
        let only_c = store
            .query(
                "cfg",
                ClusterLevel::CrossHostRaw,
                MinuteRange::single(20),
                &["c".to_string()],
            )
            .await?;
        assert_eq!(only_c.len(), 1);
        let reported = store
            .reported_hosts("cfg", &[ClusterLevel::HostRaw, ClusterLevel::HostClustered], 20)
            .await?;
        assert_eq!(reported.into_iter().collect::<Vec<_>>(), vec!["b".to_string()]);

        let removed = store
            .delete_level(
                "cfg",
                ClusterLevel::CrossHostRaw,
                MinuteRange::single(20),
                &["c".to_string()],
            )
            .await?;
        assert_eq!(removed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn delete_up_to_only_touches_listed_levels() -> Result<()> {
        let store = MemoryRecordStore::new();
        store
            .save_batch(vec![
                sample("a", 5, ClusterLevel::HostRaw, "old"),
                sample("a", 9, ClusterLevel::HostRaw, "new"),
                sample(CROSS_HOST, 5, ClusterLevel::WindowClustered, "kept"),
            ])
            .await?;
        let dropped = store
            .delete_up_to("cfg", &[ClusterLevel::HostRaw], 5)
            .await?;
        assert_eq!(dropped, 1);
        assert_eq!(store.delete_config("cfg").await?, 2);
        assert_eq!(store.latest_minute("cfg").await?, None);
        Ok(())
    }
}
