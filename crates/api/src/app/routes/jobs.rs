use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::debug;

use docflow_core::JobId;
use docflow_infra::jobs::JobService;

use crate::app::{dto, errors};
use crate::context::OwnerContext;

/// `POST /jobs`: the raw body is the document.
pub async fn submit(
    Extension(jobs): Extension<JobService>,
    Extension(caller): Extension<OwnerContext>,
    body: Bytes,
) -> axum::response::Response {
    if body.is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "empty_document", "request body is empty");
    }

    match jobs.submit(caller.owner().clone(), body.to_vec()).await {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(dto::SubmitResponse {
                id: job.id,
                status: job.status,
            }),
        )
            .into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// `GET /jobs/:id`: other owners' jobs are reported as missing.
pub async fn get_job(
    Extension(jobs): Extension<JobService>,
    Extension(caller): Extension<OwnerContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "job id must be a UUID"),
    };

    match jobs.get_status(id).await {
        Ok(job) if &job.owner == caller.owner() => Json(dto::JobResponse::from(job)).into_response(),
        Ok(_) => {
            debug!(job_id = %id, "job belongs to another owner");
            errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found")
        }
        Err(e) => errors::store_error_to_response(e),
    }
}
