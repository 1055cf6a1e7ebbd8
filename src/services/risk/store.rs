use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::types::{Alert, AlertCategory, AlertStatus, DataGap, Feedback, FeedbackKind};
use crate::error::StoreError;

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Stores `alert` unless an alert that covers its minute exists (see
    /// [`Alert::is_covered_by`]). True when stored.
    async fn insert_if_absent(&self, alert: Alert) -> Result<bool, StoreError>;

    async fn list_for_config(&self, config_id: &str) -> Result<Vec<Alert>, StoreError>;

    async fn close(&self, alert_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Closes open alerts of `category` raised for minutes before `minute`.
    async fn close_open_before(
        &self,
        config_id: &str,
        category: AlertCategory,
        minute: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn append_feedback(&self, feedback: Feedback) -> Result<(), StoreError>;

    async fn fingerprints_with(
        &self,
        config_id: &str,
        kind: FeedbackKind,
    ) -> Result<HashSet<String>, StoreError>;

    /// Idempotent per (config, minute, phase).
    async fn record_gap(&self, gap: DataGap) -> Result<(), StoreError>;

    async fn list_gaps(&self, config_id: &str) -> Result<Vec<DataGap>, StoreError>;
}

#[derive(Debug, Default)]
struct AlertTables {
    alerts: Vec<Alert>,
    feedback: Vec<Feedback>,
    gaps: Vec<DataGap>,
}

#[derive(Debug, Default)]
pub struct MemoryAlertStore {
    tables: Mutex<AlertTables>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn insert_if_absent(&self, alert: Alert) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables
            .alerts
            .iter()
            .any(|existing| alert.is_covered_by(existing))
        {
            return Ok(false);
        }
        tables.alerts.push(alert);
        Ok(true)
    }

    async fn list_for_config(&self, config_id: &str) -> Result<Vec<Alert>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .alerts
            .iter()
            .filter(|alert| alert.config_id == config_id)
            .cloned()
            .collect())
    }

    async fn close(&self, alert_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(alert) = tables.alerts.iter_mut().find(|alert| alert.id == alert_id) else {
            return Err(StoreError::NotFound(format!("alert {alert_id}")));
        };
        if alert.status == AlertStatus::Closed {
            return Ok(false);
        }
        alert.status = AlertStatus::Closed;
        alert.closed_at = Some(now);
        Ok(true)
    }

    async fn close_open_before(
        &self,
        config_id: &str,
        category: AlertCategory,
        minute: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut closed = 0;
        for alert in tables.alerts.iter_mut().filter(|alert| {
            alert.config_id == config_id
                && alert.category == category
                && alert.minute < minute
                && alert.status == AlertStatus::Open
        }) {
            alert.status = AlertStatus::Closed;
            alert.closed_at = Some(now);
            closed += 1;
        }
        Ok(closed)
    }

    async fn append_feedback(&self, feedback: Feedback) -> Result<(), StoreError> {
        self.tables.lock().await.feedback.push(feedback);
        Ok(())
    }

    async fn fingerprints_with(
        &self,
        config_id: &str,
        kind: FeedbackKind,
    ) -> Result<HashSet<String>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .feedback
            .iter()
            .filter(|feedback| feedback.config_id == config_id && feedback.kind == kind)
            .map(|feedback| feedback.fingerprint.clone())
            .collect())
    }

    async fn record_gap(&self, gap: DataGap) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let exists = tables.gaps.iter().any(|existing| {
            existing.config_id == gap.config_id
                && existing.minute == gap.minute
                && existing.phase == gap.phase
        });
        if !exists {
            tables.gaps.push(gap);
        }
        Ok(())
    }

    async fn list_gaps(&self, config_id: &str) -> Result<Vec<DataGap>, StoreError> {
        let tables = self.tables.lock().await;
        let mut gaps: Vec<DataGap> = tables
            .gaps
            .iter()
            .filter(|gap| gap.config_id == config_id)
            .cloned()
            .collect();
        gaps.sort_by_key(|gap| gap.minute);
        Ok(gaps)
    }
}
