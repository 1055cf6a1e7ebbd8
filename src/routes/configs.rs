use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::error::{map_service_error, map_store_error};
use crate::services::configs::VerificationConfig;
use crate::services::records::MinuteRange;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct BaselineRequest {
    start: i64,
    end: i64,
}

pub(crate) async fn put_config(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Json(config): Json<VerificationConfig>,
) -> Result<Json<VerificationConfig>, (StatusCode, String)> {
    if config.id != config_id {
        return Err((
            StatusCode::BAD_REQUEST,
            "config id does not match the path".to_string(),
        ));
    }
    if config.account_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "account_id is required".to_string()));
    }
    if !config.alert_threshold.is_finite() || config.alert_threshold < 0.0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "alert_threshold must be a non-negative number".to_string(),
        ));
    }
    state
        .configs
        .upsert(config.clone())
        .await
        .map_err(map_store_error)?;
    tracing::info!(config_id = %config.id, account_id = %config.account_id, "saved verification config");
    Ok(Json(config))
}

pub(crate) async fn get_config(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> Result<Json<VerificationConfig>, (StatusCode, String)> {
    let config = state
        .configs
        .get(&config_id)
        .await
        .map_err(map_store_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("config {config_id} not found")))?;
    Ok(Json(config))
}

pub(crate) async fn set_baseline(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Json(body): Json<BaselineRequest>,
) -> Result<Json<MinuteRange>, (StatusCode, String)> {
    let range = state
        .baseline
        .rebaseline(&config_id, body.start, body.end)
        .await
        .map_err(map_service_error)?;
    Ok(Json(range))
}

/// Stops the run; in-flight results for it are discarded on arrival.
pub(crate) async fn cancel_run(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .configs
        .set_enabled(&config_id, false)
        .await
        .map_err(map_store_error)?;
    tracing::info!(config_id = %config_id, "verification run cancelled");
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/configs/{config_id}", get(get_config).put(put_config))
        .route("/configs/{config_id}/baseline", post(set_baseline))
        .route("/configs/{config_id}/cancel", post(cancel_run))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_helpers::{get, post_empty, post_json, put_json, send};
    use crate::services::configs::ConfigStore;
    use crate::test_support::{test_verification_config, TestPipeline};
    use anyhow::Result;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_round_trips_the_config() -> Result<()> {
        let pipeline = TestPipeline::new().await;
        let app = crate::routes::router(pipeline.state.clone());
        let body = serde_json::to_value(test_verification_config("cfg"))?;

        let (status, _) = send(&app, put_json("/api/configs/cfg", body)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, get("/api/configs/cfg")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["account_id"], "acct");
        assert_eq!(body["hosts"].as_array().map(Vec::len), Some(3));

        let (status, _) = send(&app, get("/api/configs/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_id_is_rejected() -> Result<()> {
        let pipeline = TestPipeline::new().await;
        let app = crate::routes::router(pipeline.state.clone());
        let body = serde_json::to_value(test_verification_config("other"))?;
        let (status, _) = send(&app, put_json("/api/configs/cfg", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn baseline_is_validated_and_saved() -> Result<()> {
        let pipeline = TestPipeline::new().await;
        pipeline.add_config("cfg").await?;
        let app = crate::routes::router(pipeline.state.clone());

        let (status, _) = send(
            &app,
            post_json("/api/configs/cfg/baseline", json!({"start": 100, "end": 105})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            post_json("/api/configs/cfg/baseline", json!({"start": 100, "end": 129})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["start"], 100);
        assert_eq!(body["end"], 129);
        let saved = pipeline.configs.get("cfg").await?.expect("config");
        assert_eq!(saved.baseline_start, Some(100));
        Ok(())
    }

    #[tokio::test]
    async fn cancel_invalidates_the_run() -> Result<()> {
        let pipeline = TestPipeline::new().await;
        pipeline.add_config("cfg").await?;
        let app = crate::routes::router(pipeline.state.clone());
        let (status, _) = send(&app, post_empty("/api/configs/cfg/cancel")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!pipeline.configs.is_run_valid("cfg").await?);

        let (status, _) = send(&app, post_empty("/api/configs/missing/cancel")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        Ok(())
    }
}
