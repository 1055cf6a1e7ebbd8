use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;
use url::Url;

use super::types::{AlertCategory, AlertSeverity};

/// Where raised alerts are announced. The alert store stays the source of truth.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(
        &self,
        config_id: &str,
        minute: i64,
        category: AlertCategory,
        severity: AlertSeverity,
        payload: &JsonValue,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(
        &self,
        config_id: &str,
        minute: i64,
        category: AlertCategory,
        severity: AlertSeverity,
        payload: &JsonValue,
    ) -> Result<()> {
        tracing::warn!(
            config_id = %config_id,
            minute,
            category = category.as_str(),
            severity = severity.as_str(),
            payload = %payload,
            "verification alert raised"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: Client,
    url: Url,
}

impl WebhookAlertSink {
    pub fn new(client: Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn raise(
        &self,
        config_id: &str,
        minute: i64,
        category: AlertCategory,
        severity: AlertSeverity,
        payload: &JsonValue,
    ) -> Result<()> {
        let body = serde_json::json!({
            "config_id": config_id,
            "minute": minute,
            "category": category,
            "severity": severity,
            "payload": payload,
        });
        self.client
            .post(self.url.clone())
            .timeout(Duration::from_secs(10))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to deliver alert to {}", self.url))?
            .error_for_status()
            .with_context(|| format!("alert webhook {} rejected the alert", self.url))?;
        Ok(())
    }
}
