//! Moves samples forward one cluster level at a time.
//!
//! Host-local clustering and window merges happen here; the statistical work on
//! the merged data is left to the external worker.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::ids::cluster_label;
use crate::services::records::{
    ClusterLevel, LogSample, MinuteRange, RecordStore, SampleSnapshot, CROSS_HOST,
    HEARTBEAT_LABEL,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PromotionResult {
    Promoted(Vec<LogSample>),
    Incomplete,
    AlreadyPromoted,
}

impl PromotionResult {
    pub fn is_promoted(&self) -> bool {
        matches!(self, PromotionResult::Promoted(_))
    }
}

pub struct ClusterPromoter {
    records: Arc<dyn RecordStore>,
    poll_interval: i64,
}

impl ClusterPromoter {
    pub fn new(records: Arc<dyn RecordStore>, poll_interval_minutes: i64) -> Self {
        Self {
            records,
            poll_interval: poll_interval_minutes.max(1),
        }
    }

    pub fn poll_interval(&self) -> i64 {
        self.poll_interval
    }

    /// Window of L1 minutes merged into the L2 sample stamped `end`.
    pub fn window_range(&self, end: i64) -> MinuteRange {
        MinuteRange::ending_at(end, self.poll_interval)
    }

    /// End of the window holding `minute`, counting windows from `anchor`.
    pub fn window_end_for(&self, anchor: i64, minute: i64) -> i64 {
        anchor + ((minute - anchor).div_euclid(self.poll_interval) + 1) * self.poll_interval - 1
    }

    /// Promotes `level` rows at `minute` to the next level.
    ///
    /// For [`ClusterLevel::CrossHostClustered`] `minute` is the window end. Calling this again
    /// after a successful promotion returns [`PromotionResult::AlreadyPromoted`] and changes
    /// nothing.
    pub async fn try_promote(
        &self,
        config_id: &str,
        level: ClusterLevel,
        minute: i64,
        expected_hosts: &[String],
    ) -> Result<PromotionResult> {
        let range = match level {
            ClusterLevel::CrossHostClustered => self.window_range(minute),
            _ => MinuteRange::single(minute),
        };
        let snapshot = self
            .records
            .snapshot(config_id, level, range)
            .await
            .with_context(|| format!("failed to load {level} samples for {config_id}"))?;
        if snapshot.is_empty() {
            return self.absent_source(config_id, level, range).await;
        }
        let SampleSnapshot { samples: source, row_ids } = snapshot;

        let next = match level {
            ClusterLevel::HostRaw => {
                let gate = [ClusterLevel::HostRaw, ClusterLevel::HostClustered];
                if !self.all_reported(config_id, &gate, minute, expected_hosts).await? {
                    return Ok(PromotionResult::Incomplete);
                }
                merge_samples(source, ClusterLevel::HostClustered, minute, true)
            }
            ClusterLevel::HostClustered => {
                let gate = [ClusterLevel::HostClustered];
                if !self.all_reported(config_id, &gate, minute, expected_hosts).await? {
                    return Ok(PromotionResult::Incomplete);
                }
                relabel_cross_host(source)
            }
            ClusterLevel::CrossHostRaw => {
                merge_samples(source, ClusterLevel::CrossHostClustered, minute, false)
            }
            ClusterLevel::CrossHostClustered => {
                if !self.window_ready(config_id, range, &source, false).await? {
                    return Ok(PromotionResult::Incomplete);
                }
                merge_samples(source, ClusterLevel::WindowClustered, minute, false)
            }
            ClusterLevel::WindowClustered => {
                anyhow::bail!("{level} is the final cluster level and cannot be promoted")
            }
        };

        self.commit(config_id, level, range, &row_ids, next).await
    }

    /// Promotes a window whose stragglers are past the stale horizon.
    ///
    /// Minutes with no L1 rows are treated as empty; L0 leftovers still block.
    pub async fn close_window(&self, config_id: &str, end: i64) -> Result<PromotionResult> {
        let level = ClusterLevel::CrossHostClustered;
        let range = self.window_range(end);
        let snapshot = self.records.snapshot(config_id, level, range).await?;
        if snapshot.is_empty() {
            return self.absent_source(config_id, level, range).await;
        }
        if !self.window_ready(config_id, range, &snapshot.samples, true).await? {
            return Ok(PromotionResult::Incomplete);
        }
        let SampleSnapshot { samples, row_ids } = snapshot;
        let next = merge_samples(samples, ClusterLevel::WindowClustered, end, false);
        self.commit(config_id, level, range, &row_ids, next).await
    }

    async fn commit(
        &self,
        config_id: &str,
        from: ClusterLevel,
        range: MinuteRange,
        taken: &[i64],
        next: Vec<LogSample>,
    ) -> Result<PromotionResult> {
        let deleted = self
            .records
            .promote(config_id, taken, next.clone())
            .await
            .with_context(|| format!("failed to promote {from} samples for {config_id}"))?;
        if deleted == 0 {
            return Ok(PromotionResult::AlreadyPromoted);
        }
        tracing::debug!(
            config_id = %config_id,
            from = %from,
            start = range.start,
            end = range.end,
            promoted = next.len(),
            "promoted samples"
        );
        Ok(PromotionResult::Promoted(next))
    }

    async fn absent_source(
        &self,
        config_id: &str,
        level: ClusterLevel,
        range: MinuteRange,
    ) -> Result<PromotionResult> {
        for later in level.later() {
            let searched = match later {
                ClusterLevel::WindowClustered => MinuteRange::single(range.end),
                _ => range,
            };
            if !self
                .records
                .query(config_id, later, searched, &[])
                .await?
                .is_empty()
            {
                return Ok(PromotionResult::AlreadyPromoted);
            }
        }
        Ok(PromotionResult::Incomplete)
    }

    async fn all_reported(
        &self,
        config_id: &str,
        levels: &[ClusterLevel],
        minute: i64,
        expected_hosts: &[String],
    ) -> Result<bool> {
        let reported = self
            .records
            .reported_hosts(config_id, levels, minute)
            .await?;
        let missing: Vec<&String> = expected_hosts
            .iter()
            .filter(|host| !reported.contains(*host))
            .collect();
        if !missing.is_empty() {
            tracing::debug!(
                config_id = %config_id,
                minute,
                missing = ?missing,
                "hosts have not reported yet"
            );
        }
        Ok(missing.is_empty())
    }

    async fn window_ready(
        &self,
        config_id: &str,
        range: MinuteRange,
        source: &[LogSample],
        allow_gaps: bool,
    ) -> Result<bool> {
        let leftovers = self
            .records
            .query(config_id, ClusterLevel::CrossHostRaw, range, &[])
            .await?;
        if !leftovers.is_empty() {
            return Ok(false);
        }
        if allow_gaps {
            return Ok(true);
        }
        let covered: BTreeSet<i64> = source.iter().map(|sample| sample.minute).collect();
        Ok(range.minutes().all(|minute| covered.contains(&minute)))
    }
}

struct Merged {
    sample: LogSample,
    hosts: BTreeSet<String>,
}

/// Merges samples with identical text, summing counts.
///
/// With `per_host` the host stays part of the key; otherwise rows collapse onto
/// [`CROSS_HOST`] and remember the union of their contributors. Heartbeats merge
/// into one marker per key.
fn merge_samples(
    rows: Vec<LogSample>,
    level: ClusterLevel,
    minute: i64,
    per_host: bool,
) -> Vec<LogSample> {
    let mut merged: BTreeMap<(String, bool, String), Merged> = BTreeMap::new();
    for row in rows {
        let heartbeat = row.is_heartbeat();
        let host = if per_host {
            row.host.clone()
        } else {
            CROSS_HOST.to_string()
        };
        let text = if heartbeat {
            String::new()
        } else {
            row.text.trim().to_string()
        };
        let contributors = row.hosts();
        let entry = merged
            .entry((host.clone(), heartbeat, text.clone()))
            .or_insert_with(|| {
                let mut tags = row.tags.clone();
                tags.remove(crate::services::records::HOSTS_TAG);
                Merged {
                    sample: LogSample {
                        config_id: row.config_id.clone(),
                        host,
                        minute,
                        level,
                        cluster_label: if heartbeat {
                            HEARTBEAT_LABEL.to_string()
                        } else {
                            cluster_label(&text)
                        },
                        text,
                        count: 0,
                        tags,
                    },
                    hosts: BTreeSet::new(),
                }
            });
        entry.sample.count += row.count.max(1);
        entry.hosts.extend(contributors);
    }

    merged
        .into_values()
        .map(|Merged { mut sample, hosts }| {
            if !level.is_host_scoped() {
                sample.set_hosts(&hosts);
            }
            sample
        })
        .collect()
}

/// H1 to L0: every host's clusters move to [`CROSS_HOST`] unchanged.
fn relabel_cross_host(rows: Vec<LogSample>) -> Vec<LogSample> {
    let mut heartbeat_hosts = BTreeSet::new();
    let mut heartbeat: Option<LogSample> = None;
    let mut out = Vec::with_capacity(rows.len());
    for mut row in rows {
        let hosts = row.hosts();
        if row.is_heartbeat() {
            heartbeat_hosts.extend(hosts);
            if heartbeat.is_none() {
                heartbeat = Some(LogSample::heartbeat(
                    &row.config_id,
                    CROSS_HOST,
                    row.minute,
                    ClusterLevel::CrossHostRaw,
                ));
            }
            continue;
        }
        row.level = ClusterLevel::CrossHostRaw;
        row.host = CROSS_HOST.to_string();
        row.set_hosts(&hosts);
        out.push(row);
    }
    if let Some(mut marker) = heartbeat {
        marker.set_hosts(&heartbeat_hosts);
        out.push(marker);
    }
    out
}
