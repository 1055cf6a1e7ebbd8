use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::error::{map_service_error, map_store_error};
use crate::services::ingest::{IngestOutcome, RawSample};
use crate::services::records::{ClusterLevel, LogSample, MinuteRange};
use crate::state::AppState;

const MAX_RANGE_MINUTES: i64 = 7 * 24 * 60;

#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct RangeQuery {
    from: i64,
    to: i64,
    /// Comma separated host filter.
    #[serde(default)]
    hosts: Option<String>,
}

pub(crate) async fn ingest_batch(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Json(samples): Json<Vec<RawSample>>,
) -> Result<Json<IngestOutcome>, (StatusCode, String)> {
    let outcome = state
        .ingest
        .ingest_raw(&config_id, samples)
        .await
        .map_err(map_service_error)?;
    Ok(Json(outcome))
}

/// Samples a worker analyzes; heartbeats stay internal.
pub(crate) async fn list_samples(
    State(state): State<AppState>,
    Path((config_id, level)): Path<(String, String)>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<LogSample>>, (StatusCode, String)> {
    let level = ClusterLevel::parse(&level)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown level {level}")))?;
    if query.to < query.from {
        return Err((StatusCode::BAD_REQUEST, "to must not precede from".to_string()));
    }
    if query.to - query.from >= MAX_RANGE_MINUTES {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("range exceeds {MAX_RANGE_MINUTES} minutes"),
        ));
    }
    let hosts: Vec<String> = query
        .hosts
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect();
    let rows = state
        .records
        .query(&config_id, level, MinuteRange::new(query.from, query.to), &hosts)
        .await
        .map_err(map_store_error)?;
    Ok(Json(
        rows.into_iter()
            .filter(|sample| !sample.is_heartbeat())
            .collect(),
    ))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/records/{config_id}", post(ingest_batch))
        .route("/records/{config_id}/{level}", get(list_samples))
}
