//! Drives every enabled verification configuration forward once per tick.
//!
//! One supervisor keeps a ticking task per account; each account tick walks its
//! configurations concurrently through collection, promotion and scheduling.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::services::collector::DataCollector;
use crate::services::configs::VerificationConfig;
use crate::services::promoter::PromotionResult;
use crate::services::records::{ClusterLevel, MinuteRange};
use crate::services::tasks::{Scheduled, TaskInputs};
use crate::state::AppState;
use crate::time::epoch_minute;

/// Levels whose leftovers are dropped once they fall behind the stale horizon.
const TRANSIENT_LEVELS: [ClusterLevel; 3] = [
    ClusterLevel::HostRaw,
    ClusterLevel::HostClustered,
    ClusterLevel::CrossHostRaw,
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub collection: Option<MinuteRange>,
    pub dropped_stale: u64,
    pub promoted: usize,
    pub windows_closed: usize,
    pub scheduled: usize,
    pub requeued: usize,
}

struct AccountWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct VerificationLoop {
    state: AppState,
    collector: Arc<dyn DataCollector>,
    workers: Mutex<HashMap<String, AccountWorker>>,
}

impl VerificationLoop {
    pub fn new(state: AppState, collector: Arc<dyn DataCollector>) -> Self {
        Self {
            state,
            collector,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        let reaper = self.clone();
        let reaper_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reaper.state.config.reaper_interval());
            loop {
                tokio::select! {
                    _ = reaper_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match reaper.state.scheduler.reap_stuck(reaper.state.clock.now()).await {
                            Ok(0) => {}
                            Ok(reaped) => tracing::info!(reaped, "reaped stuck analysis tasks"),
                            Err(err) => tracing::warn!(error = %err, "task reaper failed"),
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.state.config.tick_interval());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = self.supervise(&cancel).await {
                            tracing::warn!(error = %err, "verification supervisor tick failed");
                        }
                    }
                }
            }
            for (_, worker) in self.workers.lock().await.drain() {
                worker.cancel.cancel();
            }
        });
    }

    /// Starts a worker for every account with enabled configurations and stops the rest.
    async fn supervise(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let accounts: HashSet<String> = self
            .state
            .configs
            .list_accounts()
            .await
            .context("failed to list accounts")?
            .into_iter()
            .collect();

        let mut workers = self.workers.lock().await;
        workers.retain(|account_id, worker| {
            let keep = accounts.contains(account_id) && !worker.handle.is_finished();
            if !keep {
                worker.cancel.cancel();
                tracing::info!(account_id = %account_id, "stopped account worker");
            }
            keep
        });
        for account_id in accounts {
            if workers.contains_key(&account_id) {
                continue;
            }
            let child = cancel.child_token();
            let handle = self.clone().spawn_account(account_id.clone(), child.clone());
            tracing::info!(account_id = %account_id, "started account worker");
            workers.insert(
                account_id,
                AccountWorker {
                    cancel: child,
                    handle,
                },
            );
        }
        Ok(())
    }

    fn spawn_account(
        self: Arc<Self>,
        account_id: String,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.state.config.tick_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = self.tick_account(&account_id).await {
                            tracing::warn!(account_id = %account_id, error = %err, "account tick failed");
                        }
                    }
                }
            }
        })
    }

    /// Ticks every enabled configuration of `account_id`; one failing configuration
    /// does not hold back the others.
    pub async fn tick_account(&self, account_id: &str) -> Result<()> {
        let lock = self.state.baseline.account_lock(account_id).await;
        let _guard = lock.lock().await;

        let configs = self.state.configs.list_enabled(account_id).await?;
        let outcomes = join_all(configs.into_iter().map(|config| async move {
            let config_id = config.id.clone();
            (config_id, self.tick_config(config).await)
        }))
        .await;
        for (config_id, outcome) in outcomes {
            match outcome {
                Ok(summary) if summary != TickSummary::default() => {
                    tracing::debug!(config_id = %config_id, summary = ?summary, "configuration ticked");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(
                    account_id = %account_id,
                    config_id = %config_id,
                    error = %format!("{err:#}"),
                    "configuration tick failed"
                ),
            }
        }
        Ok(())
    }

    pub async fn tick_config(&self, mut config: VerificationConfig) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        if !self.state.configs.is_run_valid(&config.id).await? {
            return Ok(summary);
        }
        let now = self.state.clock.now();
        let now_minute = epoch_minute(now);
        self.state.baseline.set_default_baseline(&mut config).await?;

        if let Some(interval) = self
            .state
            .baseline
            .claim_due_interval(&config, now_minute)
            .await?
        {
            match self.collector.request(&config, interval).await {
                Ok(()) => summary.collection = Some(interval),
                Err(err) => {
                    self.state.baseline.release_interval(&config.id, interval).await;
                    tracing::warn!(
                        config_id = %config.id,
                        start = interval.start,
                        end = interval.end,
                        error = %format!("{err:#}"),
                        "collection request failed"
                    );
                }
            }
        }

        let horizon = self.stale_horizon(&config.id).await?;
        if let Some(horizon) = horizon {
            summary.dropped_stale = self
                .state
                .records
                .delete_up_to(&config.id, &TRANSIENT_LEVELS, horizon - 1)
                .await?;
            if summary.dropped_stale > 0 {
                tracing::warn!(
                    config_id = %config.id,
                    horizon,
                    dropped = summary.dropped_stale,
                    "dropped samples that never completed promotion"
                );
            }
        }

        for level in TRANSIENT_LEVELS {
            let minutes = self
                .state
                .records
                .pending_minutes(&config.id, level, now_minute)
                .await?;
            for minute in minutes {
                let result = self
                    .state
                    .promoter
                    .try_promote(&config.id, level, minute, &config.hosts)
                    .await?;
                if result.is_promoted() {
                    summary.promoted += 1;
                }
            }
        }

        let l1_minutes = self
            .state
            .records
            .pending_minutes(&config.id, ClusterLevel::CrossHostClustered, now_minute)
            .await?;
        for &minute in &l1_minutes {
            let inputs = TaskInputs {
                control_input: self.state.scheduler.urls().records_url(
                    &config.id,
                    ClusterLevel::CrossHostClustered,
                    MinuteRange::single(minute),
                ),
                test_input: None,
            };
            self.schedule(&config, ClusterLevel::CrossHostClustered, minute, inputs, &mut summary)
                .await?;
        }

        let anchor = config.window_anchor();
        let windows: BTreeSet<i64> = l1_minutes
            .iter()
            .map(|minute| self.state.promoter.window_end_for(anchor, *minute))
            .filter(|end| *end <= now_minute)
            .collect();
        for end in windows {
            let range = self.state.promoter.window_range(end);
            if !self.state.scheduler.window_settled(&config.id, range).await? {
                continue;
            }
            let mut result = self
                .state
                .promoter
                .try_promote(&config.id, ClusterLevel::CrossHostClustered, end, &config.hosts)
                .await?;
            let below_horizon = horizon.is_some_and(|horizon| end < horizon);
            if result == PromotionResult::Incomplete && below_horizon {
                result = self.state.promoter.close_window(&config.id, end).await?;
                if result.is_promoted() {
                    summary.windows_closed += 1;
                    tracing::warn!(
                        config_id = %config.id,
                        start = range.start,
                        end,
                        "closed window with missing minutes"
                    );
                }
            }
            if result.is_promoted() {
                summary.promoted += 1;
                let inputs = self.window_inputs(&config, end);
                self.schedule(&config, ClusterLevel::WindowClustered, end, inputs, &mut summary)
                    .await?;
            }
        }

        // Windows promoted on an earlier tick whose task never got created.
        let l2_minutes = self
            .state
            .records
            .pending_minutes(&config.id, ClusterLevel::WindowClustered, now_minute)
            .await?;
        for end in l2_minutes
            .into_iter()
            .filter(|end| horizon.map_or(true, |horizon| *end >= horizon))
        {
            let inputs = self.window_inputs(&config, end);
            self.schedule(&config, ClusterLevel::WindowClustered, end, inputs, &mut summary)
                .await?;
        }

        summary.requeued = self.state.scheduler.retry_failed(&config.id, now).await?;
        Ok(summary)
    }

    async fn schedule(
        &self,
        config: &VerificationConfig,
        level: ClusterLevel,
        minute: i64,
        inputs: TaskInputs,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let scheduled = self
            .state
            .scheduler
            .schedule_if_ready(config, level, minute, inputs, self.state.clock.now())
            .await?;
        if matches!(scheduled, Scheduled::Created(_)) {
            summary.scheduled += 1;
        }
        Ok(())
    }

    /// Control reads the baseline windows; test reads the window itself once it is
    /// past the baseline.
    fn window_inputs(&self, config: &VerificationConfig, end: i64) -> TaskInputs {
        let urls = self.state.scheduler.urls();
        let level = ClusterLevel::WindowClustered;
        let baseline = match (config.baseline_start, config.baseline_end) {
            (Some(start), Some(end)) if config.has_baseline() => Some(MinuteRange::new(start, end)),
            _ => None,
        };
        match baseline {
            Some(baseline) if end > baseline.end => TaskInputs {
                control_input: urls.records_url(&config.id, level, baseline),
                test_input: Some(urls.records_url(&config.id, level, MinuteRange::single(end))),
            },
            Some(baseline) => TaskInputs {
                control_input: urls.records_url(&config.id, level, baseline),
                test_input: None,
            },
            None => TaskInputs {
                control_input: urls.records_url(&config.id, level, MinuteRange::single(end)),
                test_input: None,
            },
        }
    }

    /// Minutes before this are past saving; `None` until anything was collected.
    async fn stale_horizon(&self, config_id: &str) -> Result<Option<i64>> {
        let latest = self.state.records.latest_minute(config_id).await?;
        Ok(latest.map(|latest| latest - self.state.config.stale_window_minutes))
    }
}
