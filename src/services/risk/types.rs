use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Risk,
    UnknownCluster,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::Risk => "risk",
            AlertCategory::UnknownCluster => "unknown_cluster",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "risk" => Some(AlertCategory::Risk),
            "unknown_cluster" => Some(AlertCategory::UnknownCluster),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "warning" => Some(AlertSeverity::Warning),
            "critical" => Some(AlertSeverity::Critical),
            _ => None,
        }
    }

    pub fn for_score(score: f64, threshold: f64) -> Self {
        if threshold > 0.0 && score >= threshold * 1.5 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Closed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub config_id: String,
    pub minute: i64,
    pub category: AlertCategory,
    pub severity: AlertSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub risk_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Uniqueness key within a configuration.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.category.as_str(),
            self.minute,
            self.fingerprint.as_deref().unwrap_or("-")
        )
    }

    /// True when `existing` already covers the minute this alert is for.
    ///
    /// A risk alert is blocked by any alert for the minute. An unknown-cluster alert is
    /// blocked by a risk alert or by one carrying the same fingerprint.
    pub fn is_covered_by(&self, existing: &Alert) -> bool {
        if existing.config_id != self.config_id || existing.minute != self.minute {
            return false;
        }
        match (self.category, existing.category) {
            (AlertCategory::Risk, _) | (_, AlertCategory::Risk) => true,
            (AlertCategory::UnknownCluster, AlertCategory::UnknownCluster) => {
                existing.fingerprint == self.fingerprint
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertDecision {
    AlertingDisabled,
    BelowThreshold,
    Raised(Vec<Uuid>),
    AlreadyRaised,
    /// Every anomalous message carried ignore feedback.
    Suppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Ignore,
    Dismiss,
    Prioritize,
    ThumbsUp,
    ThumbsDown,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Ignore => "ignore",
            FeedbackKind::Dismiss => "dismiss",
            FeedbackKind::Prioritize => "prioritize",
            FeedbackKind::ThumbsUp => "thumbs_up",
            FeedbackKind::ThumbsDown => "thumbs_down",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ignore" => Some(FeedbackKind::Ignore),
            "dismiss" => Some(FeedbackKind::Dismiss),
            "prioritize" => Some(FeedbackKind::Prioritize),
            "thumbs_up" => Some(FeedbackKind::ThumbsUp),
            "thumbs_down" => Some(FeedbackKind::ThumbsDown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub config_id: String,
    pub fingerprint: String,
    pub kind: FeedbackKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A minute whose analysis exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataGap {
    pub config_id: String,
    pub minute: i64,
    pub phase: String,
    pub task_id: Uuid,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_alert as alert;

    #[test]
    fn one_category_per_minute() {
        let risk = alert(109, AlertCategory::Risk, None);
        let boom = alert(109, AlertCategory::UnknownCluster, Some("boom"));
        let bang = alert(109, AlertCategory::UnknownCluster, Some("bang"));

        assert!(risk.is_covered_by(&boom));
        assert!(boom.is_covered_by(&risk));
        assert!(boom.is_covered_by(&boom.clone()));
        assert!(!boom.is_covered_by(&bang));
        assert!(!risk.is_covered_by(&alert(110, AlertCategory::Risk, None)));
    }
}
