use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

use super::sink::AlertSink;
use super::store::AlertStore;
use super::types::{
    Alert, AlertCategory, AlertDecision, AlertSeverity, AlertStatus, DataGap, Feedback,
    FeedbackKind,
};
use crate::ids::message_fingerprint;
use crate::services::configs::VerificationConfig;
use crate::services::tasks::{AnalysisResult, AnalysisTask, AnalysisType};

pub struct RiskEvaluator {
    alerts: Arc<dyn AlertStore>,
    sink: Arc<dyn AlertSink>,
}

impl RiskEvaluator {
    pub fn new(alerts: Arc<dyn AlertStore>, sink: Arc<dyn AlertSink>) -> Self {
        Self { alerts, sink }
    }

    pub fn alerts(&self) -> &Arc<dyn AlertStore> {
        &self.alerts
    }

    /// Decides whether the analysis of `minute` deserves an alert.
    ///
    /// At most one risk alert exists per (config, minute). When the result carries
    /// unknown clusters, one alert per distinct message text is raised instead.
    pub async fn on_analysis_result(
        &self,
        config: &VerificationConfig,
        minute: i64,
        result: &AnalysisResult,
        now: DateTime<Utc>,
    ) -> Result<AlertDecision> {
        if !config.alert_enabled {
            return Ok(AlertDecision::AlertingDisabled);
        }
        let score = result.risk_score;
        if score < config.alert_threshold {
            let closed = self
                .alerts
                .close_open_before(&config.id, AlertCategory::Risk, minute, now)
                .await?;
            if closed > 0 {
                tracing::info!(config_id = %config.id, minute, closed, "risk recovered");
            }
            return Ok(AlertDecision::BelowThreshold);
        }

        let severity = AlertSeverity::for_score(score, config.alert_threshold);
        let candidates = if result.unknown.is_empty() {
            vec![new_alert(config, minute, AlertCategory::Risk, severity, score, now)]
        } else {
            let ignored = self
                .alerts
                .fingerprints_with(&config.id, FeedbackKind::Ignore)
                .await?;
            let alerts: Vec<Alert> = unknown_by_text(result)
                .into_iter()
                .filter(|(fingerprint, _)| !ignored.contains(fingerprint))
                .map(|(fingerprint, (text, hosts))| {
                    let mut alert = new_alert(
                        config,
                        minute,
                        AlertCategory::UnknownCluster,
                        severity,
                        score,
                        now,
                    );
                    alert.fingerprint = Some(fingerprint);
                    alert.text = Some(text);
                    alert.hosts = hosts.into_iter().collect();
                    alert
                })
                .collect();
            if alerts.is_empty() {
                return Ok(AlertDecision::Suppressed);
            }
            alerts
        };

        let mut raised = Vec::new();
        for alert in candidates {
            if !self.alerts.insert_if_absent(alert.clone()).await? {
                continue;
            }
            raised.push(alert.id);
            self.announce(&alert).await;
        }
        if raised.is_empty() {
            return Ok(AlertDecision::AlreadyRaised);
        }
        Ok(AlertDecision::Raised(raised))
    }

    async fn announce(&self, alert: &Alert) {
        let payload = serde_json::json!({
            "alert_id": alert.id,
            "analysis_type": AnalysisType::LogMl.as_str(),
            "risk_score": alert.risk_score,
            "text": alert.text,
            "hosts": alert.hosts,
        });
        if let Err(err) = self
            .sink
            .raise(
                &alert.config_id,
                alert.minute,
                alert.category,
                alert.severity,
                &payload,
            )
            .await
        {
            tracing::warn!(
                config_id = %alert.config_id,
                alert_id = %alert.id,
                error = %format!("{err:#}"),
                "alert sink failed; alert stays recorded"
            );
        }
    }

    /// Records the data gap left by a task that ran out of retries.
    pub async fn on_task_exhausted(&self, task: &AnalysisTask, now: DateTime<Utc>) -> Result<()> {
        let reason = task.error.clone().unwrap_or_else(|| "failed".to_string());
        tracing::warn!(
            config_id = %task.key.config_id,
            minute = task.key.minute,
            phase = %task.key.phase,
            task_id = %task.id,
            retries = task.retry_count,
            reason = %reason,
            "analysis retries exhausted; reporting data gap"
        );
        self.alerts
            .record_gap(DataGap {
                config_id: task.key.config_id.clone(),
                minute: task.key.minute,
                phase: task.key.phase.as_str().to_string(),
                task_id: task.id,
                reason,
                created_at: now,
            })
            .await
            .with_context(|| format!("failed to record data gap for {}", task.key))?;
        Ok(())
    }

    pub async fn close_alert(&self, alert_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.alerts.close(alert_id, now).await?)
    }

    pub async fn record_feedback(&self, feedback: Feedback) -> Result<()> {
        self.alerts.append_feedback(feedback).await?;
        Ok(())
    }
}

fn new_alert(
    config: &VerificationConfig,
    minute: i64,
    category: AlertCategory,
    severity: AlertSeverity,
    risk_score: f64,
    now: DateTime<Utc>,
) -> Alert {
    Alert {
        id: Uuid::new_v4(),
        config_id: config.id.clone(),
        minute,
        category,
        severity,
        fingerprint: None,
        risk_score,
        text: None,
        hosts: Vec::new(),
        status: AlertStatus::Open,
        created_at: now,
        closed_at: None,
    }
}

/// Unknown clusters keyed by message fingerprint, with the union of their hosts.
fn unknown_by_text(result: &AnalysisResult) -> BTreeMap<String, (String, BTreeSet<String>)> {
    let mut grouped: BTreeMap<String, (String, BTreeSet<String>)> = BTreeMap::new();
    for cluster in &result.unknown {
        let text = cluster.text.trim();
        let entry = grouped
            .entry(message_fingerprint(text))
            .or_insert_with(|| (text.to_string(), BTreeSet::new()));
        entry.1.extend(cluster.hosts.iter().cloned());
    }
    grouped
}
