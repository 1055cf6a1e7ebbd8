use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::ids::sha256_hex;
use crate::services::configs::Tolerance;
use crate::services::records::ClusterLevel;

/// What the worker computes for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisType {
    /// Cross-host clustering of one minute.
    #[serde(rename = "LOG_CLUSTER")]
    LogCluster,
    /// Control versus test comparison that yields a risk score.
    #[serde(rename = "LOG_ML")]
    LogMl,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::LogCluster => "LOG_CLUSTER",
            AnalysisType::LogMl => "LOG_ML",
        }
    }
}

/// Kind of analysis dispatched for a cluster level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    ClusterL1,
    ClusterL2,
}

impl TaskPhase {
    pub fn for_level(level: ClusterLevel) -> Option<Self> {
        match level {
            ClusterLevel::HostRaw | ClusterLevel::HostClustered | ClusterLevel::CrossHostRaw => {
                None
            }
            ClusterLevel::CrossHostClustered => Some(TaskPhase::ClusterL1),
            ClusterLevel::WindowClustered => Some(TaskPhase::ClusterL2),
        }
    }

    pub fn level(&self) -> ClusterLevel {
        match self {
            TaskPhase::ClusterL1 => ClusterLevel::CrossHostClustered,
            TaskPhase::ClusterL2 => ClusterLevel::WindowClustered,
        }
    }

    pub fn analysis_type(&self) -> AnalysisType {
        match self {
            TaskPhase::ClusterL1 => AnalysisType::LogCluster,
            TaskPhase::ClusterL2 => AnalysisType::LogMl,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::ClusterL1 => "LOGS_CLUSTER_L1",
            TaskPhase::ClusterL2 => "LOGS_CLUSTER_L2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LOGS_CLUSTER_L1" => Some(TaskPhase::ClusterL1),
            "LOGS_CLUSTER_L2" => Some(TaskPhase::ClusterL2),
            _ => None,
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub phase: TaskPhase,
    pub config_id: String,
    pub minute: i64,
}

impl TaskKey {
    pub fn new(phase: TaskPhase, config_id: impl Into<String>, minute: i64) -> Self {
        Self {
            phase,
            config_id: config_id.into(),
            minute,
        }
    }

    /// String form used only at the storage boundary.
    pub fn storage_key(&self) -> String {
        format!("{}_{}_{}", self.phase.as_str(), self.config_id, self.minute)
    }

    pub fn hash(&self) -> String {
        sha256_hex(&self.storage_key())
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "success" => Some(TaskStatus::Success),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub id: Uuid,
    pub account_id: String,
    pub key: TaskKey,
    pub control_input: String,
    pub test_input: Option<String>,
    pub save_url: String,
    /// Copied from the configuration when the task is created.
    pub tolerance: Tolerance,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub backoff_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl AnalysisTask {
    pub fn level(&self) -> ClusterLevel {
        self.key.phase.level()
    }

    pub fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor {
            task_id: self.id,
            key: self.key.storage_key(),
            level: self.level(),
            analysis_type: self.key.phase.analysis_type(),
            tolerance: self.tolerance,
            control_input: self.control_input.clone(),
            test_input: self.test_input.clone(),
            save_url: self.save_url.clone(),
        }
    }
}

/// What the worker receives when it claims a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: Uuid,
    pub key: String,
    pub level: ClusterLevel,
    pub analysis_type: AnalysisType,
    pub tolerance: Tolerance,
    pub control_input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_input: Option<String>,
    pub save_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInputs {
    pub control_input: String,
    pub test_input: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduled {
    Created(Uuid),
    Requeued(Uuid),
    NoOp(NoOpReason),
}

impl Scheduled {
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Scheduled::Created(id) | Scheduled::Requeued(id) => Some(*id),
            Scheduled::NoOp(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    InFlight,
    Completed,
    Exhausted,
    BackingOff,
    RunInvalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub text: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub unknown: Vec<ClusterSummary>,
    #[serde(default)]
    pub test: Vec<ClusterSummary>,
    #[serde(default)]
    pub control: Vec<ClusterSummary>,
    #[serde(default)]
    pub ignore: Vec<ClusterSummary>,
    pub risk_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl AnalysisResult {
    pub fn with_score(risk_score: f64) -> Self {
        Self {
            unknown: Vec::new(),
            test: Vec::new(),
            control: Vec::new(),
            ignore: Vec::new(),
            risk_score,
            summary: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.risk_score.is_finite() || self.risk_score < 0.0 {
            return Err(format!("risk_score {} is not a finite non-negative number", self.risk_score));
        }
        if let Some(empty) = self.unknown.iter().find(|cluster| cluster.text.trim().is_empty()) {
            return Err(format!("unknown cluster {:?} has no text", empty.label));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(AnalysisResult),
    Failure { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_level_maps_to_at_most_one_phase() {
        for level in ClusterLevel::ALL {
            if let Some(phase) = TaskPhase::for_level(level) {
                assert_eq!(phase.level(), level);
                assert_eq!(TaskPhase::parse(phase.as_str()), Some(phase));
            }
        }
        assert_eq!(TaskPhase::for_level(ClusterLevel::HostRaw), None);
    }

    #[test]
    fn task_key_encodes_only_at_the_boundary() {
        let key = TaskKey::new(TaskPhase::ClusterL2, "cfg", 109);
        assert_eq!(key.storage_key(), "LOGS_CLUSTER_L2_cfg_109");
        assert_eq!(key.hash().len(), 64);
        assert_ne!(key.hash(), TaskKey::new(TaskPhase::ClusterL1, "cfg", 109).hash());
    }

    #[test]
    fn malformed_results_are_rejected() {
        assert!(AnalysisResult::with_score(0.6).validate().is_ok());
        assert!(AnalysisResult::with_score(f64::NAN).validate().is_err());
        assert!(AnalysisResult::with_score(-1.0).validate().is_err());

        let parsed: Result<AnalysisResult, _> = serde_json::from_str(r#"{"unknown": []}"#);
        assert!(parsed.is_err(), "risk_score is required");
    }
}
