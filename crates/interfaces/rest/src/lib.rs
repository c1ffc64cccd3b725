//! Thin HTTP/WebSocket glue over the job plane. All policy lives in the
//! core crates; this layer verifies tokens, maps error kinds to statuses,
//! and moves JSON.

pub mod auth;
pub mod routers;

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use valet_notify::Fabric;
use valet_queue::{QueueError, Scheduler};

use crate::auth::TokenVerifier;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub fabric: Arc<Fabric>,
    pub verifier: Arc<dyn TokenVerifier>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routers::queues::router())
        .merge(routers::websocket::router())
        .with_state(state)
}

/// Error kinds become statuses only here, at the outermost boundary.
pub fn error_response(err: QueueError) -> Response {
    let (status, detail) = match &err {
        QueueError::Validation(detail) => (StatusCode::BAD_REQUEST, detail.clone()),
        QueueError::Forbidden(detail) => (StatusCode::FORBIDDEN, detail.clone()),
        QueueError::NotFound(detail) => (StatusCode::NOT_FOUND, detail.clone()),
        QueueError::Internal(inner) => (StatusCode::INTERNAL_SERVER_ERROR, inner.to_string()),
    };
    (status, axum::Json(json!({ "detail": detail }))).into_response()
}

pub fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(json!({ "detail": "missing or invalid token" })),
    )
        .into_response()
}
