//! Error types and handling for the WX Gateway
//!
//! Provides a unified error type that converts to the gateway's JSON envelope
//! `{code, msg}` with a matching HTTP status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::TokenError;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} parameter expected")]
    MissingParam(&'static str),

    #[error("unknown service name {0}")]
    UnknownService(String),

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("failed to get access token: {0}")]
    TokenRefresh(#[from] TokenError),

    #[error("{message}")]
    Upstream { code: i64, message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status this error maps to
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::MissingParam(_) | AppError::UnknownService(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::SignatureMismatch => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::BadRequest(_)
            | AppError::MissingParam(_)
            | AppError::UnknownService(_)
            | AppError::SignatureMismatch => self.to_string(),
            AppError::TokenRefresh(e) => {
                tracing::error!("Token refresh error: {}", e);
                self.to_string()
            }
            AppError::Upstream { code, message } => {
                tracing::warn!(errcode = code, "Upstream error: {}", message);
                message.clone()
            }
            AppError::HttpClient(e) => {
                tracing::error!("HTTP client error: {}", e);
                if e.is_timeout() {
                    "upstream request timed out".to_string()
                } else {
                    "failed to communicate with upstream server".to_string()
                }
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                "failed to process upstream response".to_string()
            }
            AppError::Config(msg) => {
                tracing::error!("Config error: {}", msg);
                "server configuration error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "an internal error occurred".to_string()
            }
        };

        let body = Json(json!({
            "code": status.as_u16(),
            "msg": message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias for handlers
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_map_to_bad_request() {
        assert_eq!(AppError::MissingParam("s(ervice)").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::UnknownService("nope".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::MissingParam("o(penId)").to_string(),
            "o(penId) parameter expected"
        );
    }

    #[test]
    fn test_upstream_errors_map_to_internal() {
        let err = AppError::Upstream {
            code: 40013,
            message: "40013: invalid appid".into(),
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            AppError::TokenRefresh(TokenError::Timeout).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_envelope_carries_status_code() {
        let response = AppError::UnknownService("ghost".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], 400);
        assert_eq!(json["msg"], "unknown service name ghost");
    }
}
