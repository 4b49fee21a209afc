//! Health check route

use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
};

/// Health check endpoint
///
/// GET <health-check>
///
/// Plain-text `OK` while the process is serving.
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        "OK",
    )
}
