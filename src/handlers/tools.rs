//! Tool Handlers
//!
//! Auxiliary REST endpoints proxied to the platform on behalf of a service:
//! QR tickets, user info, OAuth code exchange and URL shortening.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use super::{optional, require};
use crate::config::AppState;
use crate::error::{AppError, AppResult};
use crate::models::{
    QrKind, QrResponse, ShortUrlResponse, SnsResponse, SnsScope, UserInfoResponse,
    DEFAULT_SCENE_ID,
};
use crate::services::ServiceEntry;

fn resolve_service(
    state: &AppState,
    params: &HashMap<String, String>,
) -> AppResult<Arc<ServiceEntry>> {
    let name = require(params, "s", "s(ervice)")?;
    state.registry.resolve(name)
}

/// Create a QR code ticket
///
/// GET <wx-qr>?s=<service>&t=temp|forever[&sceneid=..][&e=<expire-secs>]
pub async fn create_qr(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Json<QrResponse>> {
    let service = resolve_service(&state, &params)?;

    let kind = require(&params, "t", "t(ype)")?;
    let kind = QrKind::parse(kind, optional(&params, "e")).ok_or_else(|| {
        AppError::BadRequest(r#"t(ype) value must be "temp" or "forever""#.to_string())
    })?;
    let scene = optional(&params, "sceneid").unwrap_or(DEFAULT_SCENE_ID);

    let result = service.client.create_qr(kind, scene).await?;

    Ok(Json(QrResponse {
        code: StatusCode::OK.as_u16(),
        msg: "OK".to_string(),
        result,
    }))
}

/// Look up a subscriber
///
/// GET <wx-user>?s=<service>&o=<openId>
pub async fn user_info(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Json<UserInfoResponse>> {
    let service = resolve_service(&state, &params)?;
    let open_id = require(&params, "o", "o(penId)")?;

    let user_info = service.client.user_info(open_id).await?;

    Ok(Json(UserInfoResponse {
        code: StatusCode::OK.as_u16(),
        msg: "OK".to_string(),
        user_info,
    }))
}

/// Exchange an OAuth code
///
/// GET <sns-api>?s=<service>&code=<code>[&scope=base|userinfo]
///
/// A failed user info lookup after a successful exchange is reported in
/// `error`, not as a failed request.
pub async fn sns_api(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Json<SnsResponse>> {
    let service = resolve_service(&state, &params)?;

    let scope = SnsScope::parse(params.get("scope").map(String::as_str)).ok_or_else(|| {
        AppError::BadRequest(
            r#"scope must be "userinfo", "base", "snsapi_userinfo" or "snsapi_base""#.to_string(),
        )
    })?;
    let code = require(&params, "code", "code")?;

    let sns = service.client.exchange_code(code).await?;

    let user_info = match scope {
        SnsScope::Base => service.client.user_info(&sns.openid).await,
        SnsScope::UserInfo => service.client.sns_user_info(&sns).await,
    };
    let (user_info, error) = match user_info {
        Ok(info) => (Some(info), String::new()),
        Err(e) => {
            tracing::warn!(service = %service.name(), ?scope, "User info after code exchange failed: {}", e);
            (None, e.to_string())
        }
    };

    Ok(Json(SnsResponse {
        code: StatusCode::OK.as_u16(),
        msg: "OK".to_string(),
        open_id: sns.openid,
        user_info,
        error,
    }))
}

/// Shorten a URL
///
/// POST <short-url> with s=<service>&u=<long-url>, as form fields or in the
/// query string. The body is read as url-encoded whatever its content type,
/// and its fields win over the query.
pub async fn short_url(
    State(state): State<Arc<AppState>>,
    Query(mut params): Query<HashMap<String, String>>,
    body: Bytes,
) -> AppResult<Json<ShortUrlResponse>> {
    params.extend(url::form_urlencoded::parse(&body).into_owned());

    let service = resolve_service(&state, &params)?;
    let long_url = require(&params, "u", "u(rl)")?;

    let valid = Url::parse(long_url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false);
    if !valid {
        return Err(AppError::BadRequest(
            "u(rl) must be an absolute http(s) URL".to_string(),
        ));
    }

    let short_url = service.client.short_url(long_url).await?;

    Ok(Json(ShortUrlResponse {
        code: StatusCode::OK.as_u16(),
        msg: "OK".to_string(),
        short_url,
    }))
}
