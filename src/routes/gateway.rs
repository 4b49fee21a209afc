//! Gateway Routes
//!
//! Builds the router from configuration:
//! - per-service webhook paths, guarded by signature middleware
//! - per-service OAuth redirect paths
//! - shared tool endpoints (QR, user, sns, short url), health and metrics

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{non_empty, AppState};
use crate::handlers::{tools, webhook};
use crate::metrics;
use crate::middleware::verify_signature;
use super::health;

/// Create the gateway router
pub fn create_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let mut router = Router::new();

    for service in state.registry.entries() {
        // Signature middleware wraps only this service's webhook route
        let webhook_routes = Router::new()
            .route(
                &service.service_path,
                get(webhook::echo).post(webhook::receive),
            )
            .route_layer(middleware::from_fn_with_state(
                service.clone(),
                verify_signature,
            ));
        router = router.merge(webhook_routes);

        if let Some(path) = &service.redirect_path {
            router = router.route(
                path,
                get(webhook::redirect).layer(Extension(service.clone())),
            );
        }
    }

    let endpoints = &state.config.endpoints;
    if let Some(path) = non_empty(&endpoints.health_check) {
        router = router.route(path, get(health::health_check));
    }
    if let Some(path) = non_empty(&endpoints.wx_qr) {
        router = router.route(path, get(tools::create_qr));
    }
    if let Some(path) = non_empty(&endpoints.wx_user) {
        router = router.route(path, get(tools::user_info));
    }
    if let Some(path) = non_empty(&endpoints.sns_api) {
        router = router.route(path, get(tools::sns_api));
    }
    if let Some(path) = non_empty(&endpoints.short_url) {
        router = router.route(path, post(tools::short_url));
    }
    if let Some(path) = non_empty(&endpoints.metrics) {
        router = router.route(path, get(metrics::metrics_handler));
    }

    router
}

/// Full application with global middleware, ready to serve
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    create_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
