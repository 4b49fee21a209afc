//! Message Handlers
//!
//! Inbound platform messages go either to a configured proxy URL or to the
//! built-in default, which accepts the message without a reply.

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use url::Url;
use uuid::Uuid;

use super::registry::ServiceEntry;
use crate::error::{AppError, AppResult};

/// Body the platform understands as "received, nothing to reply"
pub const NO_REPLY: &str = "success";

/// Header carrying the url-encoded JSON user info of the message sender
pub const USER_INFO_HEADER: &str = "x-wx-user-info";

/// Strategy chosen per service at registration time
#[derive(Debug, Clone)]
pub enum MessageHandler {
    /// POST the raw payload to `url` and reply with whatever it answers
    ForwardToProxy { url: Url, append_user_info: bool },
    /// Acknowledge without replying
    LocalDefault,
}

/// A message delivered to a webhook path
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub open_id: Option<String>,
    pub timestamp: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Reply written back to the platform
#[derive(Debug, Clone)]
pub struct Reply {
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl Reply {
    pub fn no_reply() -> Self {
        Self {
            content_type: Some("text/plain; charset=utf-8".to_string()),
            body: Bytes::from_static(NO_REPLY.as_bytes()),
        }
    }
}

impl MessageHandler {
    /// Handle one message. Never fails: errors are logged and answered with [`NO_REPLY`].
    pub async fn handle(&self, service: &ServiceEntry, message: InboundMessage) -> Reply {
        match self {
            MessageHandler::LocalDefault => {
                tracing::debug!(
                    service = %service.name(),
                    bytes = message.body.len(),
                    "Message accepted by default handler"
                );
                Reply::no_reply()
            }
            MessageHandler::ForwardToProxy {
                url,
                append_user_info,
            } => match forward(service, url, *append_user_info, message).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(service = %service.name(), proxy = %url, "Message forwarding failed: {}", e);
                    Reply::no_reply()
                }
            },
        }
    }
}

async fn forward(
    service: &ServiceEntry,
    url: &Url,
    append_user_info: bool,
    message: InboundMessage,
) -> AppResult<Reply> {
    let request_id = Uuid::new_v4().to_string();
    let mut request = service
        .client
        .http()
        .post(url.clone())
        .query(&[("service", service.name())])
        .header("x-request-id", &request_id)
        .timeout(service.client.timeout());

    if let Some(open_id) = &message.open_id {
        request = request.query(&[("openid", open_id)]);

        if append_user_info {
            match service.client.user_info(open_id).await {
                Ok(info) => {
                    request = request.header(
                        USER_INFO_HEADER,
                        urlencoding::encode(&info.to_string()).into_owned(),
                    );
                }
                Err(e) => {
                    tracing::warn!(service = %service.name(), "Forwarding without user info: {}", e);
                }
            }
        }
    }
    if let Some(timestamp) = &message.timestamp {
        request = request.query(&[("timestamp", timestamp)]);
    }
    if let Some(content_type) = &message.content_type {
        request = request.header(CONTENT_TYPE, content_type);
    }

    tracing::debug!(service = %service.name(), request_id = %request_id, "Forwarding message");
    let response = request.body(message.body).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(AppError::Upstream {
            code: i64::from(status.as_u16()),
            message: format!("message proxy returned HTTP {}", status.as_u16()),
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.bytes().await?;

    if body.is_empty() {
        return Ok(Reply::no_reply());
    }
    Ok(Reply { content_type, body })
}
