//! Webhook Handlers
//!
//! Endpoints the platform calls for each service:
//! - ownership verification (GET, echoes `echostr`)
//! - message delivery (POST)
//! - OAuth menu redirect entry point

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use super::require;
use crate::config::AppState;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::RedirectResponse;
use crate::services::{InboundMessage, ServiceEntry};

/// Ownership verification
///
/// GET <service-path>?signature=..&timestamp=..&nonce=..&echostr=..
///
/// Echoes `echostr` back verbatim.
pub async fn echo(
    Extension(service): Extension<Arc<ServiceEntry>>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let echostr = params
        .get("echostr")
        .cloned()
        .ok_or(AppError::MissingParam("echostr"))?;

    tracing::info!(service = %service.name(), "Webhook ownership verified");
    metrics::record_webhook(service.name(), "GET", "ok");

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], echostr).into_response())
}

/// Message delivery
///
/// POST <service-path>?signature=..&timestamp=..&nonce=..[&openid=..]
pub async fn receive(
    Extension(service): Extension<Arc<ServiceEntry>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let _permit = service.acquire_worker().await?;

    let message = InboundMessage {
        open_id: params.get("openid").cloned(),
        timestamp: params.get("timestamp").cloned(),
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    };

    let reply = service.handler.handle(&service, message).await;
    metrics::record_webhook(service.name(), "POST", "ok");

    let mut response = Response::new(Body::from(reply.body));
    if let Some(content_type) = reply
        .content_type
        .and_then(|ct| HeaderValue::from_str(&ct).ok())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    Ok(response)
}

/// OAuth redirect entry point
///
/// GET <redirect-path>?code=..&state=..
///
/// Resolves the user behind `code`, then hands the identity to the service's
/// redirect URL and relays its answer. Without a redirect URL the identity is
/// returned as JSON.
pub async fn redirect(
    State(state): State<Arc<AppState>>,
    Extension(service): Extension<Arc<ServiceEntry>>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let code = require(&params, "code", "code")?;
    let menu_state = params.get("state").cloned().unwrap_or_default();

    let sns = service.client.exchange_code(code).await?;
    tracing::debug!(service = %service.name(), "Redirect code exchanged");

    let Some(target) = &service.redirect_url else {
        return Ok(Json(RedirectResponse {
            code: StatusCode::OK.as_u16(),
            msg: "OK".to_string(),
            open_id: sns.openid,
            state: menu_state,
        })
        .into_response());
    };

    let user_info = if service.redirect_userinfo {
        match service.client.sns_user_info(&sns).await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(service = %service.name(), "Redirecting without user info: {}", e);
                None
            }
        }
    } else {
        None
    };

    let upstream = state
        .relay_client
        .post(target.clone())
        .timeout(service.client.timeout())
        .json(&json!({
            "appId": service.credentials.app_id,
            "openId": sns.openid,
            "state": menu_state,
            "userInfo": user_info,
        }))
        .send()
        .await?;

    let mut response = Response::builder().status(upstream.status());
    for name in [header::CONTENT_TYPE, header::LOCATION, header::SET_COOKIE] {
        for value in upstream.headers().get_all(&name) {
            response = response.header(&name, value.clone());
        }
    }
    let body = upstream.bytes().await?;

    response
        .body(Body::from(body))
        .map_err(|e| AppError::Internal(format!("Failed to build redirect response: {}", e)))
}
