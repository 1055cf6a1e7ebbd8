use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::time::Duration;
use url::Url;

pub const DEFAULT_POLL_INTERVAL_MINUTES: i64 = 15;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_SECONDS: u64 = 5 * 60;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub tick_seconds: u64,
    pub reaper_interval_seconds: u64,
    pub poll_interval_minutes: i64,
    pub max_retries: u32,
    pub backoff_base_seconds: u64,
    pub backoff_cap_seconds: u64,
    pub task_liveness_seconds: u64,
    pub stale_window_minutes: i64,
    pub worker_base_url: Url,
    pub alert_webhook_url: Option<Url>,
    pub collector_timeout_seconds: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env_optional_string("CV_DATABASE_URL")
            .or_else(|| env_optional_string("DATABASE_URL"));
        let poll_interval_minutes =
            env_i64("CV_POLL_INTERVAL_MINUTES", DEFAULT_POLL_INTERVAL_MINUTES).clamp(1, 24 * 60);
        let backoff_base_seconds =
            env_u64("CV_BACKOFF_BASE_SECONDS", DEFAULT_BACKOFF_BASE_SECONDS).clamp(1, 24 * 3600);
        // Default cap never binds before the backoff counter saturates.
        let backoff_cap_seconds = env_u64(
            "CV_BACKOFF_CAP_SECONDS",
            backoff_base_seconds.saturating_mul(1 << crate::services::tasks::BACKOFF_LIMIT),
        )
        .max(backoff_base_seconds);
        let stale_window_minutes = env_i64("CV_STALE_WINDOW_MINUTES", 8 * poll_interval_minutes)
            .max(2 * poll_interval_minutes);

        let worker_base_url = env_string("CV_WORKER_BASE_URL", "http://127.0.0.1:8080");
        let worker_base_url = Url::parse(&worker_base_url)
            .with_context(|| format!("CV_WORKER_BASE_URL is not a valid URL: {worker_base_url}"))?;
        let alert_webhook_url = env_optional_string("CV_ALERT_WEBHOOK_URL")
            .map(|value| {
                Url::parse(&value)
                    .with_context(|| format!("CV_ALERT_WEBHOOK_URL is not a valid URL: {value}"))
            })
            .transpose()?;

        Ok(Self {
            database_url,
            tick_seconds: env_u64("CV_TICK_SECONDS", 60).clamp(1, 3600),
            reaper_interval_seconds: env_u64("CV_REAPER_INTERVAL_SECONDS", 30).clamp(1, 3600),
            poll_interval_minutes,
            max_retries: env_u32("CV_MAX_RETRIES", DEFAULT_MAX_RETRIES).clamp(1, 100),
            backoff_base_seconds,
            backoff_cap_seconds,
            task_liveness_seconds: env_u64("CV_TASK_LIVENESS_SECONDS", 15 * 60).max(30),
            stale_window_minutes,
            worker_base_url,
            alert_webhook_url,
            collector_timeout_seconds: env_u64("CV_COLLECTOR_TIMEOUT_SECONDS", 10).clamp(1, 300),
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }

    pub fn task_liveness(&self) -> Duration {
        Duration::from_secs(self.task_liveness_seconds)
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("CV_DATABASE_URL or DATABASE_URL is required unless --in-memory is set")
    }
}

fn env_string(key: &str, default: &str) -> String {
    env_optional_string(key).unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(default)
}
