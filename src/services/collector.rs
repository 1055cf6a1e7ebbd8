use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::services::configs::VerificationConfig;
use crate::services::records::MinuteRange;

/// Asks the data source to collect one interval for a configuration.
///
/// Collected samples come back through the ingest endpoint, not through this call.
#[async_trait]
pub trait DataCollector: Send + Sync {
    async fn request(&self, config: &VerificationConfig, interval: MinuteRange) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct CollectionRequest<'a> {
    config_id: &'a str,
    hosts: &'a [String],
    start: i64,
    end: i64,
}

#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: Client,
    timeout: Duration,
}

impl HttpCollector {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl DataCollector for HttpCollector {
    async fn request(&self, config: &VerificationConfig, interval: MinuteRange) -> Result<()> {
        let Some(url) = config.collector_url.as_deref() else {
            tracing::debug!(config_id = %config.id, "no collector configured; waiting for pushed samples");
            return Ok(());
        };
        let body = CollectionRequest {
            config_id: &config.id,
            hosts: &config.hosts,
            start: interval.start,
            end: interval.end,
        };
        self.client
            .post(url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach collector {url}"))?
            .error_for_status()
            .with_context(|| format!("collector {url} rejected the request"))?;
        tracing::info!(
            config_id = %config.id,
            start = interval.start,
            end = interval.end,
            "requested data collection"
        );
        Ok(())
    }
}
