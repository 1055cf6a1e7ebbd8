use crate::config::PipelineConfig;
use crate::ids::cluster_label;
use crate::services::baseline::BaselineManager;
use crate::services::collector::DataCollector;
use crate::services::configs::{ConfigStore, MemoryConfigStore, Tolerance, VerificationConfig};
use crate::services::ingest::IngestService;
use crate::services::promoter::ClusterPromoter;
use crate::services::records::{ClusterLevel, LogSample, MemoryRecordStore, MinuteRange};
use crate::services::risk::{
    Alert, AlertCategory, AlertSeverity, AlertSink, AlertStatus, MemoryAlertStore, RiskEvaluator,
};
use crate::services::tasks::{
    AnalysisTask, MemoryTaskStore, RetryPolicy, TaskKey, TaskPhase, TaskScheduler, TaskStatus,
    WorkerUrls,
};
use crate::state::{AppState, Stores};
use crate::time::{minute_start, Clock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;
use uuid::Uuid;

/// A pool on a fresh schema with the bundled migration applied.
///
/// `None` unless `CV_INTEGRATION_TEST=1` and `CV_TEST_DATABASE_URL` are set.
pub async fn pg_test_pool(schema: &str) -> anyhow::Result<Option<PgPool>> {
    if std::env::var("CV_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return Ok(None);
    }
    let Ok(database_url) = std::env::var("CV_TEST_DATABASE_URL") else {
        return Ok(None);
    };
    let schema = format!("{schema}_{}", std::process::id());

    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await?;
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&admin_pool)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {schema}"))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&database_url)
        .await?;
    crate::db::ensure_schema(&pool).await?;
    Ok(Some(pool))
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).expect("timestamp")
}

#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at_minute(minute: i64) -> Self {
        Self {
            now: std::sync::Mutex::new(minute_start(minute)),
        }
    }

    pub fn set_minute(&self, minute: i64) {
        *self.now.lock().expect("clock lock") = minute_start(minute);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

pub fn test_pipeline_config(poll_interval_minutes: i64) -> PipelineConfig {
    PipelineConfig {
        database_url: None,
        tick_seconds: 1,
        reaper_interval_seconds: 1,
        poll_interval_minutes,
        max_retries: 3,
        backoff_base_seconds: 60,
        backoff_cap_seconds: 60 * 1024,
        task_liveness_seconds: 900,
        stale_window_minutes: 8 * poll_interval_minutes,
        worker_base_url: Url::parse("http://127.0.0.1:8080").expect("worker url"),
        alert_webhook_url: None,
        collector_timeout_seconds: 1,
    }
}

pub fn test_verification_config(id: &str) -> VerificationConfig {
    VerificationConfig {
        id: id.to_string(),
        account_id: "acct".to_string(),
        name: format!("{id} canary"),
        enabled: true,
        hosts: vec!["host1".to_string(), "host2".to_string(), "host3".to_string()],
        collector_url: None,
        alert_enabled: true,
        alert_threshold: 0.5,
        tolerance: Tolerance::Medium,
        baseline_start: None,
        baseline_end: None,
    }
}

/// One raw log line for config `cfg`.
pub fn raw_line(host: &str, minute: i64, text: &str) -> LogSample {
    LogSample {
        config_id: "cfg".to_string(),
        host: host.to_string(),
        minute,
        level: ClusterLevel::HostRaw,
        cluster_label: cluster_label(text),
        text: text.to_string(),
        count: 1,
        tags: Default::default(),
    }
}

/// A host's heartbeat plus its lines for one minute.
pub fn raw_batch(host: &str, minute: i64, lines: &[&str]) -> Vec<LogSample> {
    let mut batch = vec![LogSample::heartbeat("cfg", host, minute, ClusterLevel::HostRaw)];
    batch.extend(lines.iter().map(|text| raw_line(host, minute, text)));
    batch
}

pub fn test_task(config_id: &str, minute: i64) -> AnalysisTask {
    let id = Uuid::new_v4();
    AnalysisTask {
        id,
        account_id: "acct".to_string(),
        key: TaskKey::new(TaskPhase::ClusterL2, config_id, minute),
        control_input: "control".to_string(),
        test_input: Some("test".to_string()),
        save_url: format!("http://127.0.0.1:8080/api/tasks/{id}/result"),
        tolerance: Tolerance::Medium,
        status: TaskStatus::Queued,
        retry_count: 0,
        backoff_count: 0,
        error: None,
        created_at: ts(0),
        last_updated: ts(0),
    }
}

/// An open warning for config `cfg`.
pub fn test_alert(minute: i64, category: AlertCategory, fingerprint: Option<&str>) -> Alert {
    Alert {
        id: Uuid::new_v4(),
        config_id: "cfg".to_string(),
        minute,
        category,
        severity: AlertSeverity::Warning,
        fingerprint: fingerprint.map(str::to_string),
        risk_score: 0.9,
        text: fingerprint.map(|fingerprint| format!("message {fingerprint}")),
        hosts: vec!["host1".to_string()],
        status: AlertStatus::Open,
        created_at: ts(0),
        closed_at: None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaisedAlert {
    pub config_id: String,
    pub minute: i64,
    pub category: AlertCategory,
    pub severity: AlertSeverity,
    pub payload: JsonValue,
}

#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    raised: Mutex<Vec<RaisedAlert>>,
}

impl RecordingAlertSink {
    pub async fn raised(&self) -> Vec<RaisedAlert> {
        self.raised.lock().await.clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn raise(
        &self,
        config_id: &str,
        minute: i64,
        category: AlertCategory,
        severity: AlertSeverity,
        payload: &JsonValue,
    ) -> anyhow::Result<()> {
        self.raised.lock().await.push(RaisedAlert {
            config_id: config_id.to_string(),
            minute,
            category,
            severity,
            payload: payload.clone(),
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingCollector {
    requests: Mutex<Vec<(String, MinuteRange)>>,
    failing: AtomicBool,
}

impl RecordingCollector {
    pub async fn requests(&self) -> Vec<(String, MinuteRange)> {
        self.requests.lock().await.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataCollector for RecordingCollector {
    async fn request(
        &self,
        config: &VerificationConfig,
        interval: MinuteRange,
    ) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("collector unavailable");
        }
        self.requests.lock().await.push((config.id.clone(), interval));
        Ok(())
    }
}

/// Every service wired over in-memory stores and a manual clock.
pub struct TestPipeline {
    pub clock: Arc<ManualClock>,
    pub records: Arc<MemoryRecordStore>,
    pub configs: Arc<MemoryConfigStore>,
    pub tasks: Arc<MemoryTaskStore>,
    pub alerts: Arc<MemoryAlertStore>,
    pub sink: Arc<RecordingAlertSink>,
    pub collector: Arc<RecordingCollector>,
    pub promoter: Arc<ClusterPromoter>,
    pub baseline: Arc<BaselineManager>,
    pub scheduler: Arc<TaskScheduler>,
    pub risk: Arc<RiskEvaluator>,
    pub ingest: Arc<IngestService>,
    pub state: AppState,
}

impl TestPipeline {
    pub async fn new() -> Self {
        Self::with_poll_interval(15).await
    }

    pub async fn with_poll_interval(poll_interval_minutes: i64) -> Self {
        let clock = Arc::new(ManualClock::at_minute(0));
        let records = Arc::new(MemoryRecordStore::new());
        let configs = Arc::new(MemoryConfigStore::new());
        let tasks = Arc::new(MemoryTaskStore::new());
        let alerts = Arc::new(MemoryAlertStore::new());
        let sink = Arc::new(RecordingAlertSink::default());
        let state = AppState::build(
            test_pipeline_config(poll_interval_minutes),
            clock.clone(),
            Stores {
                records: records.clone(),
                configs: configs.clone(),
                tasks: tasks.clone(),
                alerts: alerts.clone(),
            },
            sink.clone(),
        );

        Self {
            clock,
            records,
            configs,
            tasks,
            alerts,
            sink,
            collector: Arc::new(RecordingCollector::default()),
            promoter: state.promoter.clone(),
            baseline: state.baseline.clone(),
            scheduler: state.scheduler.clone(),
            risk: state.risk.clone(),
            ingest: state.ingest.clone(),
            state,
        }
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        let scheduler = Arc::new(TaskScheduler::new(
            self.tasks.clone(),
            self.records.clone(),
            self.configs.clone(),
            self.risk.clone(),
            policy,
            self.state.config.task_liveness(),
            WorkerUrls::new(self.state.config.worker_base_url.clone()),
        ));
        self.scheduler = scheduler.clone();
        self.state.scheduler = scheduler;
    }

    pub async fn add_config(&self, id: &str) -> anyhow::Result<VerificationConfig> {
        let config = test_verification_config(id);
        self.configs.upsert(config.clone()).await?;
        Ok(config)
    }
}
