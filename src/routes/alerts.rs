use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::{map_service_error, map_store_error};
use crate::ids::message_fingerprint;
use crate::services::risk::{Alert, DataGap, Feedback, FeedbackKind};
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize)]
pub(crate) struct CloseResponse {
    closed: bool,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct FeedbackRequest {
    config_id: String,
    #[serde(default)]
    fingerprint: Option<String>,
    /// Message text; fingerprinted when no fingerprint is given.
    #[serde(default)]
    text: Option<String>,
    kind: FeedbackKind,
    #[serde(default)]
    comment: Option<String>,
}

pub(crate) async fn list_alerts(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> Result<Json<Vec<Alert>>, (StatusCode, String)> {
    let alerts = state
        .risk
        .alerts()
        .list_for_config(&config_id)
        .await
        .map_err(map_store_error)?;
    Ok(Json(alerts))
}

pub(crate) async fn list_gaps(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> Result<Json<Vec<DataGap>>, (StatusCode, String)> {
    let gaps = state
        .risk
        .alerts()
        .list_gaps(&config_id)
        .await
        .map_err(map_store_error)?;
    Ok(Json(gaps))
}

pub(crate) async fn close_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<Uuid>,
) -> Result<Json<CloseResponse>, (StatusCode, String)> {
    let closed = state
        .risk
        .close_alert(alert_id, state.clock.now())
        .await
        .map_err(map_service_error)?;
    Ok(Json(CloseResponse { closed }))
}

pub(crate) async fn post_feedback(
    State(state): State<AppState>,
    Json(body): Json<FeedbackRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let fingerprint = match (body.fingerprint, body.text) {
        (Some(fingerprint), _) if !fingerprint.trim().is_empty() => fingerprint,
        (_, Some(text)) if !text.trim().is_empty() => message_fingerprint(&text),
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "fingerprint or text is required".to_string(),
            ))
        }
    };
    state
        .risk
        .record_feedback(Feedback {
            config_id: body.config_id,
            fingerprint,
            kind: body.kind,
            comment: body.comment,
            created_at: state.clock.now(),
        })
        .await
        .map_err(map_service_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/configs/{config_id}/alerts", get(list_alerts))
        .route("/configs/{config_id}/gaps", get(list_gaps))
        .route("/alerts/{alert_id}/close", post(close_alert))
        .route("/feedback", post(post_feedback))
}
