//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (store, broker, blobs, engine, pool)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, routing::get, Extension, Router};
use tower::ServiceBuilder;

use docflow_auth::OwnerResolver;
use docflow_infra::jobs::JobService;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// `max_document_bytes` caps submitted bodies; larger uploads are refused
/// before a job is created.
pub fn build_app(jobs: JobService, resolver: Arc<dyn OwnerResolver>, max_document_bytes: usize) -> Router {
    let auth_state = middleware::AuthState { resolver };

    // Protected routes: require a bearer token that resolves to an owner.
    let protected = routes::router()
        .layer(DefaultBodyLimit::max(max_document_bytes))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new().layer(Extension(jobs)))
}
