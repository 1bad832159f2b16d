use axum::{
    routing::{get, post},
    Router,
};

pub mod jobs;
pub mod system;

/// Router for all authenticated (owner-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit))
        .route("/jobs/:id", get(jobs::get_job))
}
