use anyhow::{Context, Result};
use clap::Parser;
use cv_pipeline_rs::services::collector::HttpCollector;
use cv_pipeline_rs::services::configs::{MemoryConfigStore, PgConfigStore};
use cv_pipeline_rs::services::records::{MemoryRecordStore, PgRecordStore};
use cv_pipeline_rs::services::risk::{
    AlertSink, MemoryAlertStore, PgAlertStore, TracingAlertSink, WebhookAlertSink,
};
use cv_pipeline_rs::services::tasks::{MemoryTaskStore, PgTaskStore};
use cv_pipeline_rs::services::verification_loop::VerificationLoop;
use cv_pipeline_rs::{cli, config, db, routes, state, time};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind cv-pipeline-rs listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind cv-pipeline-rs listener on {addr}"))
        }
    }
}

async fn build_stores(args: &cli::Args, config: &config::PipelineConfig) -> Result<state::Stores> {
    if args.in_memory {
        tracing::warn!("running with in-memory stores; state is lost on restart");
        return Ok(state::Stores {
            records: Arc::new(MemoryRecordStore::new()),
            configs: Arc::new(MemoryConfigStore::new()),
            tasks: Arc::new(MemoryTaskStore::new()),
            alerts: Arc::new(MemoryAlertStore::new()),
        });
    }
    let pool = db::connect_lazy(config.require_database_url()?)?;
    if args.migrate {
        db::ensure_schema(&pool).await?;
        tracing::info!("verification schema applied");
    }
    Ok(state::Stores {
        records: Arc::new(PgRecordStore::new(pool.clone())),
        configs: Arc::new(PgConfigStore::new(pool.clone())),
        tasks: Arc::new(PgTaskStore::new(pool.clone())),
        alerts: Arc::new(PgAlertStore::new(pool)),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::PipelineConfig::from_env()?;
    let stores = build_stores(&args, &config).await?;

    let http = reqwest::Client::new();
    let sink: Arc<dyn AlertSink> = match config.alert_webhook_url.clone() {
        Some(url) => Arc::new(WebhookAlertSink::new(http.clone(), url)),
        None => Arc::new(TracingAlertSink),
    };
    let collector = Arc::new(HttpCollector::new(
        http,
        Duration::from_secs(config.collector_timeout_seconds),
    ));

    let state = state::AppState::build(config, Arc::new(time::SystemClock), stores, sink);

    let cancel = CancellationToken::new();
    Arc::new(VerificationLoop::new(state.clone(), collector)).start(cancel.clone());

    let app = routes::router(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(addr = %addr, "cv-pipeline-rs listening");
    axum::serve(listener, app).await?;
    cancel.cancel();
    Ok(())
}
