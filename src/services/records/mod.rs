//! Per-minute log samples and the store they live in.
//!
//! Samples move forward through [`ClusterLevel`]s. Host-scoped levels keep the
//! reporting host in `host`; cross-host levels use [`CROSS_HOST`] and list the
//! contributing hosts in the `hosts` tag.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::StoreError;

mod memory;
mod postgres;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

/// Cluster label reserved for the per-host liveness marker.
pub const HEARTBEAT_LABEL: &str = "-3";
/// Host value carried by cross-host samples.
pub const CROSS_HOST: &str = "*";
pub const HOSTS_TAG: &str = "hosts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClusterLevel {
    #[serde(rename = "H0")]
    HostRaw,
    #[serde(rename = "H1")]
    HostClustered,
    #[serde(rename = "L0")]
    CrossHostRaw,
    #[serde(rename = "L1")]
    CrossHostClustered,
    #[serde(rename = "L2")]
    WindowClustered,
}

impl ClusterLevel {
    pub const ALL: [ClusterLevel; 5] = [
        ClusterLevel::HostRaw,
        ClusterLevel::HostClustered,
        ClusterLevel::CrossHostRaw,
        ClusterLevel::CrossHostClustered,
        ClusterLevel::WindowClustered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterLevel::HostRaw => "H0",
            ClusterLevel::HostClustered => "H1",
            ClusterLevel::CrossHostRaw => "L0",
            ClusterLevel::CrossHostClustered => "L1",
            ClusterLevel::WindowClustered => "L2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(value))
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            ClusterLevel::HostRaw => Some(ClusterLevel::HostClustered),
            ClusterLevel::HostClustered => Some(ClusterLevel::CrossHostRaw),
            ClusterLevel::CrossHostRaw => Some(ClusterLevel::CrossHostClustered),
            ClusterLevel::CrossHostClustered => Some(ClusterLevel::WindowClustered),
            ClusterLevel::WindowClustered => None,
        }
    }

    pub fn is_host_scoped(&self) -> bool {
        matches!(self, ClusterLevel::HostRaw | ClusterLevel::HostClustered)
    }

    /// Levels strictly after this one.
    pub fn later(&self) -> Vec<ClusterLevel> {
        Self::ALL.into_iter().filter(|level| level > self).collect()
    }

    pub(crate) fn rank(&self) -> i16 {
        match self {
            ClusterLevel::HostRaw => 0,
            ClusterLevel::HostClustered => 1,
            ClusterLevel::CrossHostRaw => 2,
            ClusterLevel::CrossHostClustered => 3,
            ClusterLevel::WindowClustered => 4,
        }
    }

    pub(crate) fn from_rank(rank: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.rank() == rank)
    }
}

impl fmt::Display for ClusterLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_count() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSample {
    pub config_id: String,
    pub host: String,
    pub minute: i64,
    pub level: ClusterLevel,
    pub cluster_label: String,
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_count")]
    pub count: i64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl LogSample {
    pub fn heartbeat(config_id: &str, host: &str, minute: i64, level: ClusterLevel) -> Self {
        Self {
            config_id: config_id.to_string(),
            host: host.to_string(),
            minute,
            level,
            cluster_label: HEARTBEAT_LABEL.to_string(),
            text: String::new(),
            count: 1,
            tags: BTreeMap::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.cluster_label == HEARTBEAT_LABEL
    }

    /// Hosts that contributed to this sample.
    pub fn hosts(&self) -> BTreeSet<String> {
        match self.tags.get(HOSTS_TAG) {
            Some(list) if !self.level.is_host_scoped() => list
                .split(',')
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(str::to_string)
                .collect(),
            _ => BTreeSet::from([self.host.clone()]),
        }
    }

    pub(crate) fn set_hosts(&mut self, hosts: &BTreeSet<String>) {
        let joined = hosts.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        self.tags.insert(HOSTS_TAG.to_string(), joined);
    }

    pub(crate) fn matches_hosts(&self, hosts: &[String]) -> bool {
        hosts.is_empty() || self.hosts().iter().any(|host| hosts.contains(host))
    }
}

/// Rows read for promotion, with the storage ids that identify them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSnapshot {
    pub samples: Vec<LogSample>,
    pub row_ids: Vec<i64>,
}

impl SampleSnapshot {
    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty()
    }
}

/// Inclusive range of collection minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MinuteRange {
    pub start: i64,
    pub end: i64,
}

impl MinuteRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn single(minute: i64) -> Self {
        Self::new(minute, minute)
    }

    /// The `len` minutes ending at `end`.
    pub fn ending_at(end: i64, len: i64) -> Self {
        Self::new(end - len.max(1) + 1, end)
    }

    pub fn contains(&self, minute: i64) -> bool {
        self.start <= minute && minute <= self.end
    }

    pub fn minutes(&self) -> impl Iterator<Item = i64> {
        self.start..=self.end
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save(&self, sample: LogSample) -> Result<(), StoreError> {
        self.save_batch(vec![sample]).await
    }

    async fn save_batch(&self, samples: Vec<LogSample>) -> Result<(), StoreError>;

    /// Samples at `level` inside `range`. An empty `hosts` slice matches every host.
    async fn query(
        &self,
        config_id: &str,
        level: ClusterLevel,
        range: MinuteRange,
        hosts: &[String],
    ) -> Result<Vec<LogSample>, StoreError>;

    /// Like [`RecordStore::query`], keeping the row ids for a later [`RecordStore::promote`].
    async fn snapshot(
        &self,
        config_id: &str,
        level: ClusterLevel,
        range: MinuteRange,
    ) -> Result<SampleSnapshot, StoreError>;

    async fn delete_level(
        &self,
        config_id: &str,
        level: ClusterLevel,
        range: MinuteRange,
        hosts: &[String],
    ) -> Result<u64, StoreError>;

    async fn count_distinct_hosts(
        &self,
        config_id: &str,
        level: ClusterLevel,
        minute: i64,
    ) -> Result<usize, StoreError>;

    /// Hosts holding a heartbeat for `minute` at any of `levels`.
    async fn reported_hosts(
        &self,
        config_id: &str,
        levels: &[ClusterLevel],
        minute: i64,
    ) -> Result<BTreeSet<String>, StoreError>;

    async fn max_minute(
        &self,
        config_id: &str,
        levels: &[ClusterLevel],
    ) -> Result<Option<i64>, StoreError>;

    async fn latest_minute(&self, config_id: &str) -> Result<Option<i64>, StoreError> {
        self.max_minute(config_id, &ClusterLevel::ALL).await
    }

    /// Distinct minutes `<= up_to` that still hold rows at `level`, ascending.
    async fn pending_minutes(
        &self,
        config_id: &str,
        level: ClusterLevel,
        up_to: i64,
    ) -> Result<Vec<i64>, StoreError>;

    /// Deletes the rows in `taken` and inserts `next` as one step.
    ///
    /// Rows saved after the snapshot are left alone. Returns zero and writes nothing
    /// when any of `taken` is already gone.
    async fn promote(
        &self,
        config_id: &str,
        taken: &[i64],
        next: Vec<LogSample>,
    ) -> Result<u64, StoreError>;

    /// Drops rows at `levels` with `minute <= up_to`.
    async fn delete_up_to(
        &self,
        config_id: &str,
        levels: &[ClusterLevel],
        up_to: i64,
    ) -> Result<u64, StoreError>;

    async fn delete_config(&self, config_id: &str) -> Result<u64, StoreError>;
}
