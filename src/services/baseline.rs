use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::ValidationError;
use crate::services::configs::{ConfigStore, VerificationConfig, BASELINE_UNSET};
use crate::services::records::{MinuteRange, RecordStore};
use crate::services::tasks::TaskStore;

/// Decides when a configuration's next collection interval is due.
///
/// The end of every interval handed out is remembered per configuration, so
/// repeated checks never hand out the same interval twice even before the
/// collected data lands in the record store.
pub struct BaselineManager {
    records: Arc<dyn RecordStore>,
    configs: Arc<dyn ConfigStore>,
    tasks: Arc<dyn TaskStore>,
    poll_interval: i64,
    triggered: Mutex<HashMap<String, i64>>,
    account_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BaselineManager {
    pub fn new(
        records: Arc<dyn RecordStore>,
        configs: Arc<dyn ConfigStore>,
        tasks: Arc<dyn TaskStore>,
        poll_interval_minutes: i64,
    ) -> Self {
        Self {
            records,
            configs,
            tasks,
            poll_interval: poll_interval_minutes.max(1),
            triggered: Mutex::new(HashMap::new()),
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn poll_interval(&self) -> i64 {
        self.poll_interval
    }

    pub async fn next_collection_interval(
        &self,
        config: &VerificationConfig,
    ) -> Result<Option<MinuteRange>> {
        let triggered = self.triggered.lock().await;
        self.interval_locked(config, &triggered).await
    }

    /// Claims the due interval as [`Self::claim_due_interval`] does, so `true`
    /// comes back once per interval. [`Self::next_collection_interval`] looks
    /// without claiming.
    pub async fn is_collection_due(
        &self,
        config: &VerificationConfig,
        now_minute: i64,
    ) -> Result<bool> {
        Ok(self.claim_due_interval(config, now_minute).await?.is_some())
    }

    /// Returns the due interval and records it as triggered.
    pub async fn claim_due_interval(
        &self,
        config: &VerificationConfig,
        now_minute: i64,
    ) -> Result<Option<MinuteRange>> {
        let Some(baseline_start) = config.baseline_start.filter(|_| config.has_baseline()) else {
            return Ok(None);
        };
        if baseline_start > now_minute {
            return Ok(None);
        }

        let mut triggered = self.triggered.lock().await;
        let Some(interval) = self.interval_locked(config, &triggered).await? else {
            return Ok(None);
        };
        if interval.end > now_minute {
            return Ok(None);
        }
        let latest = self.records.latest_minute(&config.id).await?;
        if latest.is_some_and(|latest| latest >= interval.end) {
            return Ok(None);
        }
        triggered.insert(config.id.clone(), interval.end);
        Ok(Some(interval))
    }

    /// Forgets a claimed interval so the next check hands it out again.
    pub async fn release_interval(&self, config_id: &str, interval: MinuteRange) {
        let mut triggered = self.triggered.lock().await;
        if triggered.get(config_id) == Some(&interval.end) {
            let previous = interval.start - 1;
            triggered.insert(config_id.to_string(), previous);
        }
    }

    async fn interval_locked(
        &self,
        config: &VerificationConfig,
        triggered: &HashMap<String, i64>,
    ) -> Result<Option<MinuteRange>> {
        let Some(baseline_start) = config.baseline_start.filter(|_| config.has_baseline()) else {
            return Ok(None);
        };
        let latest = self
            .records
            .latest_minute(&config.id)
            .await
            .with_context(|| format!("failed to read latest minute for {}", config.id))?;
        let last_collected = latest.into_iter().chain(triggered.get(&config.id).copied()).max();
        let start = match last_collected {
            Some(last) => baseline_start.max(last + 1),
            None => baseline_start,
        };
        Ok(Some(MinuteRange::new(start, start + self.poll_interval - 1)))
    }

    /// Writes the "no baseline yet" sentinel for configurations that never had one.
    pub async fn set_default_baseline(&self, config: &mut VerificationConfig) -> Result<bool> {
        if config.baseline_start.is_some() {
            return Ok(false);
        }
        self.configs
            .set_baseline(&config.id, BASELINE_UNSET, BASELINE_UNSET)
            .await
            .with_context(|| format!("failed to set default baseline for {}", config.id))?;
        config.baseline_start = Some(BASELINE_UNSET);
        config.baseline_end = Some(BASELINE_UNSET);
        tracing::info!(config_id = %config.id, "initialized baseline sentinel");
        Ok(true)
    }

    /// Moves the baseline and discards everything collected against the old one.
    pub async fn rebaseline(&self, config_id: &str, start: i64, end: i64) -> Result<MinuteRange> {
        if start <= 0 {
            return Err(ValidationError::new("start", "must be positive").into());
        }
        if end <= 0 {
            return Err(ValidationError::new("end", "must be positive").into());
        }
        if end < start + self.poll_interval - 1 {
            return Err(ValidationError::new(
                "end",
                format!(
                    "baseline must cover at least {} minutes",
                    self.poll_interval
                ),
            )
            .into());
        }
        let config = self
            .configs
            .get(config_id)
            .await?
            .ok_or_else(|| crate::error::StoreError::NotFound(format!("config {config_id}")))?;

        let lock = self.account_lock(&config.account_id).await;
        let _guard = lock.lock().await;

        self.configs.set_baseline(config_id, start, end).await?;
        let records = self.records.delete_config(config_id).await?;
        let tasks = self.tasks.delete_config(config_id).await?;
        self.triggered.lock().await.remove(config_id);
        tracing::info!(
            config_id = %config_id,
            start,
            end,
            purged_records = records,
            purged_tasks = tasks,
            "baseline reset"
        );
        Ok(MinuteRange::new(start, end))
    }

    pub(crate) async fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.account_locks
            .lock()
            .await
            .entry(account_id.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{raw_batch, test_verification_config, TestPipeline};

    fn with_baseline(start: i64) -> VerificationConfig {
        let mut config = test_verification_config("cfg");
        config.baseline_start = Some(start);
        config.baseline_end = Some(start + 14);
        config
    }

    #[tokio::test]
    async fn unset_or_future_baseline_is_never_due() -> anyhow::Result<()> {
        let pipeline = TestPipeline::new().await;
        let mut config = test_verification_config("cfg");
        assert!(!pipeline.baseline.is_collection_due(&config, 1_000).await?);

        config.baseline_start = Some(BASELINE_UNSET);
        assert!(!pipeline.baseline.is_collection_due(&config, 1_000).await?);
        assert_eq!(
            pipeline.baseline.next_collection_interval(&config).await?,
            None
        );

        let future = with_baseline(2_000);
        assert!(!pipeline.baseline.is_collection_due(&future, 1_000).await?);
        Ok(())
    }

    #[tokio::test]
    async fn due_exactly_once_per_interval() -> anyhow::Result<()> {
        let pipeline = TestPipeline::new().await;
        let config = with_baseline(1_000);

        // Interval [1000, 1014] is not complete at 1010.
        assert!(!pipeline.baseline.is_collection_due(&config, 1_010).await?);
        for _ in 0..2 {
            assert_eq!(
                pipeline.baseline.next_collection_interval(&config).await?,
                Some(MinuteRange::new(1_000, 1_014))
            );
        }
        assert!(pipeline.baseline.is_collection_due(&config, 1_014).await?);
        assert!(!pipeline.baseline.is_collection_due(&config, 1_014).await?);
        assert_eq!(
            pipeline.baseline.next_collection_interval(&config).await?,
            Some(MinuteRange::new(1_015, 1_029))
        );
        assert!(!pipeline.baseline.is_collection_due(&config, 1_028).await?);
        assert!(pipeline.baseline.is_collection_due(&config, 1_029).await?);
        Ok(())
    }

    #[tokio::test]
    async fn interval_follows_saved_data_and_never_rewinds() -> anyhow::Result<()> {
        let pipeline = TestPipeline::new().await;
        let config = with_baseline(1_000);
        pipeline.records.save_batch(raw_batch("host1", 1_020, &["x"])).await?;

        let first = pipeline.baseline.next_collection_interval(&config).await?;
        assert_eq!(first, Some(MinuteRange::new(1_021, 1_035)));
        assert_eq!(
            pipeline.baseline.next_collection_interval(&config).await?,
            first
        );

        // Data at the end of the interval makes it covered.
        pipeline.records.save_batch(raw_batch("host1", 1_035, &["y"])).await?;
        let next = pipeline
            .baseline
            .next_collection_interval(&config)
            .await?
            .unwrap();
        assert!(next.start > first.unwrap().start);
        Ok(())
    }

    #[tokio::test]
    async fn released_interval_is_offered_again() -> anyhow::Result<()> {
        let pipeline = TestPipeline::new().await;
        let config = with_baseline(1_000);
        let interval = pipeline
            .baseline
            .claim_due_interval(&config, 1_100)
            .await?
            .unwrap();
        pipeline.baseline.release_interval("cfg", interval).await;
        assert_eq!(
            pipeline.baseline.claim_due_interval(&config, 1_100).await?,
            Some(interval)
        );
        Ok(())
    }

    #[tokio::test]
    async fn default_baseline_writes_the_sentinel_once() -> anyhow::Result<()> {
        let pipeline = TestPipeline::new().await;
        let mut config = pipeline.add_config("cfg").await?;
        assert!(pipeline.baseline.set_default_baseline(&mut config).await?);
        assert_eq!(config.baseline_start, Some(BASELINE_UNSET));
        assert!(!pipeline.baseline.set_default_baseline(&mut config).await?);
        let stored = pipeline.configs.get("cfg").await?.unwrap();
        assert_eq!(stored.baseline_start, Some(BASELINE_UNSET));
        assert!(!stored.has_baseline());
        Ok(())
    }

    #[tokio::test]
    async fn rebaseline_validates_and_purges() -> anyhow::Result<()> {
        let pipeline = TestPipeline::new().await;
        pipeline.add_config("cfg").await?;
        pipeline.records.save_batch(raw_batch("host1", 500, &["x"])).await?;

        for (start, end) in [(0, 100), (10, -1), (100, 105)] {
            let err = pipeline
                .baseline
                .rebaseline("cfg", start, end)
                .await
                .unwrap_err();
            assert!(err.downcast_ref::<ValidationError>().is_some(), "{start}..{end}");
        }

        let window = pipeline.baseline.rebaseline("cfg", 100, 114).await?;
        assert_eq!(window, MinuteRange::new(100, 114));
        assert_eq!(pipeline.records.latest_minute("cfg").await?, None);
        let stored = pipeline.configs.get("cfg").await?.unwrap();
        assert_eq!(stored.baseline_start, Some(100));
        assert_eq!(stored.baseline_end, Some(114));
        Ok(())
    }
}
