//! Webhook Signature Middleware
//!
//! Rejects webhook calls whose signature does not match the service token
//! secret, and injects the service entry into request extensions for handlers.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AppError;
use crate::metrics;
use crate::services::{ServiceEntry, SignatureParams};

/// Parse the query string of `req` into a map, last value wins
pub fn query_params(req: &Request<Body>) -> HashMap<String, String> {
    url::form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
        .into_owned()
        .collect()
}

/// Signature middleware, bound to one service's webhook route
pub async fn verify_signature(
    State(service): State<Arc<ServiceEntry>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let params = query_params(&req);
    let field = |name: &str| params.get(name).map(String::as_str).unwrap_or("");

    let signature = SignatureParams {
        signature: field("signature"),
        timestamp: field("timestamp"),
        nonce: field("nonce"),
    };

    if !service.verifier.verify(&signature) {
        tracing::warn!(
            service = %service.name(),
            method = %req.method(),
            timestamp = %signature.timestamp,
            "Webhook signature mismatch"
        );
        metrics::record_webhook(service.name(), req.method().as_str(), "rejected");
        return AppError::SignatureMismatch.into_response();
    }

    req.extensions_mut().insert(service);
    next.run(req).await
}
