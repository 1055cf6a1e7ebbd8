use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::map_service_error;
use crate::services::risk::AlertDecision;
use crate::services::tasks::{AnalysisResult, ResultDisposition, TaskOutcome};
use crate::state::AppState;

#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct FailureRequest {
    reason: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub(crate) struct TaskResultResponse {
    disposition: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    alert_ids: Vec<Uuid>,
}

impl From<ResultDisposition> for TaskResultResponse {
    fn from(disposition: ResultDisposition) -> Self {
        let (name, retryable, alert_ids) = match disposition {
            ResultDisposition::Ignored => ("ignored", None, Vec::new()),
            ResultDisposition::Discarded => ("discarded", None, Vec::new()),
            ResultDisposition::Completed(Some(AlertDecision::Raised(ids))) => {
                ("completed", None, ids)
            }
            ResultDisposition::Completed(_) => ("completed", None, Vec::new()),
            ResultDisposition::Failed { retryable } => ("failed", Some(retryable), Vec::new()),
        };
        Self {
            disposition: name,
            retryable,
            alert_ids,
        }
    }
}

pub(crate) async fn claim_task(
    State(state): State<AppState>,
) -> Result<Response, (StatusCode, String)> {
    let claimed = state
        .scheduler
        .claim_next(state.clock.now())
        .await
        .map_err(map_service_error)?;
    Ok(match claimed {
        Some(descriptor) => Json(descriptor).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// Takes the raw JSON so an unparseable result still counts against the task.
pub(crate) async fn post_result(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(body): Json<JsonValue>,
) -> Result<Json<TaskResultResponse>, (StatusCode, String)> {
    let outcome = match serde_json::from_value::<AnalysisResult>(body) {
        Ok(result) => TaskOutcome::Success(result),
        Err(err) => TaskOutcome::Failure {
            reason: format!("malformed_result: {err}"),
        },
    };
    let disposition = state
        .scheduler
        .on_task_result(task_id, outcome, state.clock.now())
        .await
        .map_err(map_service_error)?;
    Ok(Json(disposition.into()))
}

pub(crate) async fn post_failure(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(body): Json<FailureRequest>,
) -> Result<Json<TaskResultResponse>, (StatusCode, String)> {
    let reason = body.reason.trim();
    let reason = if reason.is_empty() { "failed" } else { reason };
    let disposition = state
        .scheduler
        .on_task_result(
            task_id,
            TaskOutcome::Failure {
                reason: reason.to_string(),
            },
            state.clock.now(),
        )
        .await
        .map_err(map_service_error)?;
    Ok(Json(disposition.into()))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks/claim", post(claim_task))
        .route("/tasks/{task_id}/result", post(post_result))
        .route("/tasks/{task_id}/failure", post(post_failure))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_helpers::{post_empty, post_json, send};
    use crate::services::configs::{ConfigStore, Tolerance};
    use crate::services::records::ClusterLevel;
    use crate::services::tasks::TaskInputs;
    use crate::test_support::{test_verification_config, TestPipeline};
    use anyhow::Result;
    use axum::http::StatusCode;
    use serde_json::json;

    async fn pipeline_with_task() -> Result<TestPipeline> {
        let pipeline = TestPipeline::new().await;
        let mut config = test_verification_config("cfg");
        config.tolerance = Tolerance::High;
        pipeline.configs.upsert(config.clone()).await?;
        pipeline
            .scheduler
            .schedule_if_ready(
                &config,
                ClusterLevel::WindowClustered,
                109,
                TaskInputs {
                    control_input: "http://127.0.0.1:8080/api/records/cfg/L2?from=95&to=109"
                        .to_string(),
                    test_input: None,
                },
                crate::test_support::ts(0),
            )
            .await?;
        Ok(pipeline)
    }

    #[tokio::test]
    async fn claim_returns_a_descriptor_then_no_content() -> Result<()> {
        let pipeline = pipeline_with_task().await?;
        let app = crate::routes::router(pipeline.state.clone());

        let (status, body) = send(&app, post_empty("/api/tasks/claim")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["level"], "L2");
        assert_eq!(body["key"], "LOGS_CLUSTER_L2_cfg_109");
        assert_eq!(body["analysis_type"], "LOG_ML");
        assert_eq!(body["tolerance"], "high");
        let task_id = body["task_id"].as_str().unwrap_or_default().to_string();
        assert!(body["save_url"]
            .as_str()
            .is_some_and(|url| url.ends_with(&format!("/api/tasks/{task_id}/result"))));

        let (status, _) = send(&app, post_empty("/api/tasks/claim")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        Ok(())
    }

    #[tokio::test]
    async fn result_callback_raises_the_alert_once() -> Result<()> {
        let pipeline = pipeline_with_task().await?;
        let app = crate::routes::router(pipeline.state.clone());
        let (_, claimed) = send(&app, post_empty("/api/tasks/claim")).await;
        let uri = format!("/api/tasks/{}/result", claimed["task_id"].as_str().unwrap_or_default());

        let (status, body) = send(&app, post_json(&uri, json!({"risk_score": 0.6}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["disposition"], "completed");
        assert_eq!(body["alert_ids"].as_array().map(Vec::len), Some(1));

        let (status, body) = send(&app, post_json(&uri, json!({"risk_score": 0.6}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["disposition"], "ignored");
        Ok(())
    }

    #[tokio::test]
    async fn unparseable_result_is_a_failure() -> Result<()> {
        let pipeline = pipeline_with_task().await?;
        let app = crate::routes::router(pipeline.state.clone());
        let (_, claimed) = send(&app, post_empty("/api/tasks/claim")).await;
        let uri = format!("/api/tasks/{}/result", claimed["task_id"].as_str().unwrap_or_default());

        let (status, body) = send(&app, post_json(&uri, json!({"unknown": "nope"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["disposition"], "failed");
        assert_eq!(body["retryable"], true);
        Ok(())
    }

    #[tokio::test]
    async fn failure_for_unknown_task_is_not_found() -> Result<()> {
        let pipeline = TestPipeline::new().await;
        let app = crate::routes::router(pipeline.state.clone());
        let uri = format!("/api/tasks/{}/failure", uuid::Uuid::new_v4());
        let (status, _) = send(&app, post_json(&uri, json!({"reason": "oom"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        Ok(())
    }
}
