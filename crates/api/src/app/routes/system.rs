use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use docflow_infra::jobs::JobService;

use crate::app::{dto, errors};

/// Liveness plus job counts; fails when the job store cannot be read.
pub async fn health(Extension(jobs): Extension<JobService>) -> axum::response::Response {
    match jobs.store().count_by_status().await {
        Ok(stats) => Json(dto::HealthResponse {
            status: "ok",
            jobs: stats,
        })
        .into_response(),
        Err(e) => errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string()),
    }
}
