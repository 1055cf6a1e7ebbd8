use crate::config::PipelineConfig;
use crate::services::baseline::BaselineManager;
use crate::services::configs::ConfigStore;
use crate::services::ingest::IngestService;
use crate::services::promoter::ClusterPromoter;
use crate::services::records::RecordStore;
use crate::services::risk::{AlertSink, AlertStore, RiskEvaluator};
use crate::services::tasks::{RetryPolicy, TaskScheduler, TaskStore, WorkerUrls};
use crate::time::Clock;
use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Duration;

/// Storage backends shared by every service.
#[derive(Clone)]
pub struct Stores {
    pub records: Arc<dyn RecordStore>,
    pub configs: Arc<dyn ConfigStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub alerts: Arc<dyn AlertStore>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PipelineConfig>,
    pub clock: Arc<dyn Clock>,
    pub records: Arc<dyn RecordStore>,
    pub configs: Arc<dyn ConfigStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub promoter: Arc<ClusterPromoter>,
    pub baseline: Arc<BaselineManager>,
    pub scheduler: Arc<TaskScheduler>,
    pub risk: Arc<RiskEvaluator>,
    pub ingest: Arc<IngestService>,
}

impl AppState {
    pub fn build(
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
        stores: Stores,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        let Stores {
            records,
            configs,
            tasks,
            alerts,
        } = stores;
        let poll = config.poll_interval_minutes;
        let promoter = Arc::new(ClusterPromoter::new(records.clone(), poll));
        let baseline = Arc::new(BaselineManager::new(
            records.clone(),
            configs.clone(),
            tasks.clone(),
            poll,
        ));
        let risk = Arc::new(RiskEvaluator::new(alerts, sink));
        let policy = RetryPolicy::new(
            config.max_retries,
            Duration::from_secs(config.backoff_base_seconds),
            Duration::from_secs(config.backoff_cap_seconds),
        );
        let scheduler = Arc::new(TaskScheduler::new(
            tasks.clone(),
            records.clone(),
            configs.clone(),
            risk.clone(),
            policy,
            config.task_liveness(),
            WorkerUrls::new(config.worker_base_url.clone()),
        ));
        let ingest = Arc::new(IngestService::new(
            records.clone(),
            configs.clone(),
            config.stale_window_minutes,
        ));

        Self {
            config: Arc::new(config),
            clock,
            records,
            configs,
            tasks,
            promoter,
            baseline,
            scheduler,
            risk,
            ingest,
        }
    }
}

impl FromRef<AppState> for Arc<TaskScheduler> {
    fn from_ref(state: &AppState) -> Arc<TaskScheduler> {
        state.scheduler.clone()
    }
}

impl FromRef<AppState> for Arc<RiskEvaluator> {
    fn from_ref(state: &AppState) -> Arc<RiskEvaluator> {
        state.risk.clone()
    }
}
