use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use docflow_infra::jobs::{JobStoreError, SubmitError};

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Publish { job_id, source } => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "error": "queue_unavailable",
                "message": source.to_string(),
                "id": job_id,
            })),
        )
            .into_response(),
        SubmitError::Blob(e) => {
            error!(error = %e, "storing document failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "blob_error", e.to_string())
        }
        SubmitError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        JobStoreError::Invalid(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        e @ (JobStoreError::Conflict { .. }
        | JobStoreError::InvalidTransition { .. }
        | JobStoreError::AlreadyExists(_)) => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
        JobStoreError::Storage(msg) => {
            error!(error = %msg, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
