use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

pub(crate) async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_helpers::{get as get_request, send};
    use crate::test_support::TestPipeline;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn healthz_is_served_outside_the_api_prefix() {
        let pipeline = TestPipeline::new().await;
        let app = crate::routes::router(pipeline.state.clone());
        let (status, body) = send(&app, get_request("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
