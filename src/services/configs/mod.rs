use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::error::StoreError;

mod postgres;

pub use postgres::PgConfigStore;

/// Baseline value meaning "no baseline yet".
pub const BASELINE_UNSET: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tolerance {
    Low,
    #[default]
    Medium,
    High,
}

impl Tolerance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tolerance::Low => "low",
            Tolerance::Medium => "medium",
            Tolerance::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Tolerance::Low),
            "medium" => Some(Tolerance::Medium),
            "high" => Some(Tolerance::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Hosts expected to report every minute.
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub collector_url: Option<String>,
    #[serde(default)]
    pub alert_enabled: bool,
    pub alert_threshold: f64,
    #[serde(default)]
    pub tolerance: Tolerance,
    /// `None` until the first scheduling pass writes the sentinel.
    #[serde(default)]
    pub baseline_start: Option<i64>,
    #[serde(default)]
    pub baseline_end: Option<i64>,
}

fn default_enabled() -> bool {
    true
}

impl VerificationConfig {
    pub fn has_baseline(&self) -> bool {
        matches!(self.baseline_start, Some(start) if start >= 0)
    }

    /// Anchor for window alignment; zero when no baseline is set.
    pub fn window_anchor(&self) -> i64 {
        self.baseline_start.filter(|start| *start >= 0).unwrap_or(0)
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<String>, StoreError>;

    async fn list_enabled(&self, account_id: &str) -> Result<Vec<VerificationConfig>, StoreError>;

    async fn get(&self, config_id: &str) -> Result<Option<VerificationConfig>, StoreError>;

    async fn upsert(&self, config: VerificationConfig) -> Result<(), StoreError>;

    async fn set_baseline(&self, config_id: &str, start: i64, end: i64)
        -> Result<(), StoreError>;

    async fn set_enabled(&self, config_id: &str, enabled: bool) -> Result<(), StoreError>;

    /// A run stays valid while its configuration exists and is enabled.
    async fn is_run_valid(&self, config_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .get(config_id)
            .await?
            .is_some_and(|config| config.enabled))
    }
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    configs: RwLock<BTreeMap<String, VerificationConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn list_accounts(&self) -> Result<Vec<String>, StoreError> {
        let guard = self.configs.read().await;
        let mut accounts: Vec<String> = guard
            .values()
            .filter(|config| config.enabled)
            .map(|config| config.account_id.clone())
            .collect();
        accounts.sort();
        accounts.dedup();
        Ok(accounts)
    }

    async fn list_enabled(&self, account_id: &str) -> Result<Vec<VerificationConfig>, StoreError> {
        let guard = self.configs.read().await;
        Ok(guard
            .values()
            .filter(|config| config.enabled && config.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn get(&self, config_id: &str) -> Result<Option<VerificationConfig>, StoreError> {
        Ok(self.configs.read().await.get(config_id).cloned())
    }

    async fn upsert(&self, config: VerificationConfig) -> Result<(), StoreError> {
        self.configs
            .write()
            .await
            .insert(config.id.clone(), config);
        Ok(())
    }

    async fn set_baseline(
        &self,
        config_id: &str,
        start: i64,
        end: i64,
    ) -> Result<(), StoreError> {
        let mut guard = self.configs.write().await;
        let config = guard
            .get_mut(config_id)
            .ok_or_else(|| StoreError::NotFound(format!("config {config_id}")))?;
        config.baseline_start = Some(start);
        config.baseline_end = Some(end);
        Ok(())
    }

    async fn set_enabled(&self, config_id: &str, enabled: bool) -> Result<(), StoreError> {
        let mut guard = self.configs.write().await;
        let config = guard
            .get_mut(config_id)
            .ok_or_else(|| StoreError::NotFound(format!("config {config_id}")))?;
        config.enabled = enabled;
        Ok(())
    }
}
