use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{StoreError, ValidationError};
use crate::ids::cluster_label;
use crate::services::configs::ConfigStore;
use crate::services::records::{ClusterLevel, LogSample, RecordStore, HEARTBEAT_LABEL};

/// One collected log line, or a heartbeat when `cluster_label` is the heartbeat label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub host: String,
    pub minute: i64,
    #[serde(default)]
    pub cluster_label: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RawSample {
    fn is_heartbeat(&self) -> bool {
        self.cluster_label.as_deref() == Some(HEARTBEAT_LABEL)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub accepted: usize,
    pub dropped_stale: usize,
}

/// Accepts collector batches into the raw host level.
pub struct IngestService {
    records: Arc<dyn RecordStore>,
    configs: Arc<dyn ConfigStore>,
    stale_window_minutes: i64,
}

impl IngestService {
    pub fn new(
        records: Arc<dyn RecordStore>,
        configs: Arc<dyn ConfigStore>,
        stale_window_minutes: i64,
    ) -> Self {
        Self {
            records,
            configs,
            stale_window_minutes,
        }
    }

    /// Stores a batch for `config_id`.
    ///
    /// Every (host, minute) in the batch must carry a heartbeat. Minutes behind the
    /// stale horizon, or already folded into a window, are dropped.
    pub async fn ingest_raw(
        &self,
        config_id: &str,
        samples: Vec<RawSample>,
    ) -> Result<IngestOutcome> {
        let config = self
            .configs
            .get(config_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("config {config_id}")))?;
        if !config.enabled {
            return Err(ValidationError::new("config_id", "verification run is cancelled").into());
        }

        let mut groups: BTreeMap<(String, i64), Vec<RawSample>> = BTreeMap::new();
        for sample in samples {
            if sample.host.trim().is_empty() {
                return Err(ValidationError::new("host", "must not be empty").into());
            }
            groups
                .entry((sample.host.clone(), sample.minute))
                .or_default()
                .push(sample);
        }
        let missing: BTreeSet<String> = groups
            .iter()
            .filter(|(_, rows)| !rows.iter().any(RawSample::is_heartbeat))
            .map(|((host, minute), _)| format!("{host}@{minute}"))
            .collect();
        if !missing.is_empty() {
            let missing: Vec<String> = missing.into_iter().collect();
            return Err(ValidationError::new(
                "samples",
                format!("missing heartbeat for {}", missing.join(", ")),
            )
            .into());
        }

        let newest = self
            .records
            .latest_minute(config_id)
            .await?
            .into_iter()
            .chain(groups.keys().map(|(_, minute)| *minute))
            .max();
        let horizon = newest.map_or(i64::MIN, |newest| newest - self.stale_window_minutes);
        let windowed = self
            .records
            .max_minute(config_id, &[ClusterLevel::WindowClustered])
            .await?;
        let mut outcome = IngestOutcome::default();
        let mut accepted = Vec::new();
        for ((host, minute), rows) in groups {
            let stale = minute < horizon || windowed.is_some_and(|end| minute <= end);
            if stale {
                outcome.dropped_stale += rows.len();
                tracing::debug!(config_id = %config_id, host = %host, minute, "dropping stale samples");
                continue;
            }
            accepted.extend(rows.into_iter().map(|row| to_sample(config_id, row)));
        }
        outcome.accepted = accepted.len();
        if !accepted.is_empty() {
            self.records.save_batch(accepted).await?;
        }
        if outcome.dropped_stale > 0 {
            tracing::warn!(
                config_id = %config_id,
                dropped = outcome.dropped_stale,
                horizon,
                "dropped samples older than the stale horizon"
            );
        }
        Ok(outcome)
    }
}

fn to_sample(config_id: &str, row: RawSample) -> LogSample {
    if row.is_heartbeat() {
        return LogSample::heartbeat(config_id, &row.host, row.minute, ClusterLevel::HostRaw);
    }
    let text = row.text.trim().to_string();
    LogSample {
        config_id: config_id.to_string(),
        host: row.host,
        minute: row.minute,
        level: ClusterLevel::HostRaw,
        cluster_label: row.cluster_label.unwrap_or_else(|| cluster_label(&text)),
        text,
        count: row.count.unwrap_or(1).max(1),
        tags: row.tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::records::MinuteRange;
    use crate::test_support::TestPipeline;

    fn line(host: &str, minute: i64, text: &str) -> RawSample {
        RawSample {
            host: host.to_string(),
            minute,
            cluster_label: None,
            text: text.to_string(),
            count: None,
            tags: BTreeMap::new(),
        }
    }

    fn heartbeat(host: &str, minute: i64) -> RawSample {
        RawSample {
            cluster_label: Some(HEARTBEAT_LABEL.to_string()),
            ..line(host, minute, "")
        }
    }

    #[tokio::test]
    async fn batches_need_a_heartbeat_per_host_minute() -> Result<()> {
        let pipeline = TestPipeline::new().await;
        pipeline.add_config("cfg").await?;
        let err = pipeline
            .ingest
            .ingest_raw(
                "cfg",
                vec![heartbeat("host1", 100), line("host1", 100, "a"), line("host2", 100, "b")],
            )
            .await
            .unwrap_err();
        let validation = err.downcast_ref::<ValidationError>().expect("validation error");
        assert!(validation.to_string().contains("host2@100"));
        assert_eq!(pipeline.records.latest_minute("cfg").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn accepted_lines_land_at_the_raw_host_level() -> Result<()> {
        let pipeline = TestPipeline::new().await;
        pipeline.add_config("cfg").await?;
        let outcome = pipeline
            .ingest
            .ingest_raw(
                "cfg",
                vec![heartbeat("host1", 100), line("host1", 100, "  disk full ")],
            )
            .await?;
        assert_eq!(
            outcome,
            IngestOutcome {
                accepted: 2,
                dropped_stale: 0
            }
        );
        let rows = pipeline
            .records
            .query("cfg", ClusterLevel::HostRaw, MinuteRange::single(100), &[])
            .await?;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|row| row.text == "disk full" && row.count == 1));
        Ok(())
    }

    #[tokio::test]
    async fn stale_minutes_are_dropped() -> Result<()> {
        let pipeline = TestPipeline::new().await;
        pipeline.add_config("cfg").await?;
        let outcome = pipeline
            .ingest
            .ingest_raw(
                "cfg",
                vec![
                    heartbeat("host1", 10),
                    line("host1", 10, "old"),
                    heartbeat("host1", 500),
                ],
            )
            .await?;
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.dropped_stale, 2);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_or_cancelled_configs_are_rejected() -> Result<()> {
        let pipeline = TestPipeline::new().await;
        let err = pipeline
            .ingest
            .ingest_raw("nope", vec![heartbeat("host1", 1)])
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound(_))
        ));

        pipeline.add_config("cfg").await?;
        pipeline.configs.set_enabled("cfg", false).await?;
        let err = pipeline
            .ingest
            .ingest_raw("cfg", vec![heartbeat("host1", 1)])
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
        Ok(())
    }
}
