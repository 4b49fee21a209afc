//! Data types for the WX Gateway
//!
//! Defines structures for service credentials, access tokens, and API responses.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Default lifetime of a temporary QR code, in seconds
pub const DEFAULT_QR_EXPIRE_SECONDS: i64 = 30;

/// Scene id used when the caller does not provide one
pub const DEFAULT_SCENE_ID: &str = "0";

/// Static app credentials of one service, immutable after load
#[derive(Clone)]
pub struct ServiceCredentials {
    /// Unique service name
    pub name: String,
    /// Shared secret used to sign webhook calls
    pub token_secret: String,
    pub app_id: String,
    pub app_secret: String,
    /// Decoded message encryption key (32 bytes) if the service uses encrypted mode
    pub encryption_key: Option<Vec<u8>>,
}

impl fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("name", &self.name)
            .field("app_id", &self.app_id)
            .field("token_secret", &"<redacted>")
            .field("app_secret", &"<redacted>")
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Bearer token for the upstream REST API
///
/// Superseded on refresh, never mutated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Stamp `value` with an expiry `ttl_seconds` after `now`.
    ///
    /// `None` when the lifetime is not positive or the expiry is out of range.
    pub fn new(value: impl Into<String>, ttl_seconds: i64, now: DateTime<Utc>) -> Option<Self> {
        if ttl_seconds <= 0 {
            return None;
        }
        let expires_at = Duration::try_seconds(ttl_seconds).and_then(|ttl| now.checked_add_signed(ttl))?;
        Some(Self {
            value: value.into(),
            expires_at,
        })
    }

    /// True while `now` is earlier than the expiry minus the safety margin
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at
            .checked_sub_signed(margin)
            .is_some_and(|stale_at| now < stale_at)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// QR code flavor requested through the QR endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrKind {
    Temporary { expire_seconds: i64 },
    Permanent,
}

impl QrKind {
    /// Parse the `t` and `e` parameters.
    ///
    /// Returns `None` for an unknown type. A missing, unparsable or non-positive
    /// expiry falls back to [`DEFAULT_QR_EXPIRE_SECONDS`].
    pub fn parse(kind: &str, expire: Option<&str>) -> Option<Self> {
        match kind {
            "temp" | "temporary" => {
                let expire_seconds = expire
                    .and_then(|e| e.trim().parse::<i64>().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(DEFAULT_QR_EXPIRE_SECONDS);
                Some(QrKind::Temporary { expire_seconds })
            }
            "forever" | "permanent" => Some(QrKind::Permanent),
            _ => None,
        }
    }
}

/// Scope of the OAuth code exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnsScope {
    Base,
    UserInfo,
}

impl SnsScope {
    /// Normalize a scope value, accepting the platform's legacy names
    pub fn parse(scope: Option<&str>) -> Option<Self> {
        match scope.unwrap_or("") {
            "" | "base" | "snsapi_base" => Some(SnsScope::Base),
            "userinfo" | "snsapi_userinfo" => Some(SnsScope::UserInfo),
            _ => None,
        }
    }
}

/// Result of a QR ticket request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrResult {
    #[serde(rename = "ticketURL2ShowQrCode")]
    pub ticket_url_to_show_qr_code: String,
    #[serde(rename = "urlIncluedInQrcode")]
    pub url_included_in_qr_code: String,
}

/// QR endpoint response
#[derive(Debug, Serialize)]
pub struct QrResponse {
    pub code: u16,
    pub msg: String,
    pub result: QrResult,
}

/// User info endpoint response
#[derive(Debug, Serialize)]
pub struct UserInfoResponse {
    pub code: u16,
    pub msg: String,
    #[serde(rename = "userInfo")]
    pub user_info: Value,
}

/// OAuth code exchange response
#[derive(Debug, Serialize)]
pub struct SnsResponse {
    pub code: u16,
    pub msg: String,
    #[serde(rename = "openId")]
    pub open_id: String,
    #[serde(rename = "userInfo")]
    pub user_info: Option<Value>,
    pub error: String,
}

/// Short URL endpoint response
#[derive(Debug, Serialize)]
pub struct ShortUrlResponse {
    pub code: u16,
    pub msg: String,
    #[serde(rename = "short-url")]
    pub short_url: String,
}

/// Redirect endpoint response when no redirect URL is registered
#[derive(Debug, Serialize)]
pub struct RedirectResponse {
    pub code: u16,
    pub msg: String,
    #[serde(rename = "openId")]
    pub open_id: String,
    pub state: String,
}

/// Outcome of an OAuth code exchange with the platform
#[derive(Debug, Clone, Deserialize)]
pub struct SnsToken {
    pub access_token: String,
    pub openid: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub scope: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_qr_defaults_expire_seconds() {
        assert_eq!(
            QrKind::parse("temp", None),
            Some(QrKind::Temporary { expire_seconds: 30 })
        );
        assert_eq!(
            QrKind::parse("temp", Some("-5")),
            Some(QrKind::Temporary { expire_seconds: 30 })
        );
        assert_eq!(
            QrKind::parse("temp", Some("abc")),
            Some(QrKind::Temporary { expire_seconds: 30 })
        );
        assert_eq!(
            QrKind::parse("temp", Some("0")),
            Some(QrKind::Temporary { expire_seconds: 30 })
        );
    }

    #[test]
    fn test_temp_qr_parses_expire_seconds() {
        assert_eq!(
            QrKind::parse("temp", Some("600")),
            Some(QrKind::Temporary { expire_seconds: 600 })
        );
    }

    #[test]
    fn test_qr_kind_rejects_unknown_type() {
        assert_eq!(QrKind::parse("forever", Some("600")), Some(QrKind::Permanent));
        assert_eq!(QrKind::parse("sometimes", None), None);
    }

    #[test]
    fn test_sns_scope_normalizes_legacy_names() {
        assert_eq!(SnsScope::parse(None), Some(SnsScope::Base));
        assert_eq!(SnsScope::parse(Some("snsapi_base")), Some(SnsScope::Base));
        assert_eq!(SnsScope::parse(Some("snsapi_userinfo")), Some(SnsScope::UserInfo));
        assert_eq!(SnsScope::parse(Some("userinfo")), Some(SnsScope::UserInfo));
        assert_eq!(SnsScope::parse(Some("everything")), None);
    }

    #[test]
    fn test_access_token_freshness_honors_margin() {
        let now = Utc::now();
        let token = AccessToken::new("t", 7200, now).unwrap();
        assert!(token.is_fresh_at(now, Duration::seconds(60)));

        let short = AccessToken::new("t", 30, now).unwrap();
        assert!(!short.is_fresh_at(now, Duration::seconds(60)));
        assert!(short.is_fresh_at(now, Duration::zero()));
    }

    #[test]
    fn test_access_token_rejects_unusable_lifetime() {
        let now = Utc::now();
        assert!(AccessToken::new("t", i64::MAX, now).is_none());
        assert!(AccessToken::new("t", 0, now).is_none());
        assert!(AccessToken::new("t", -7200, now).is_none());
    }

    #[test]
    fn test_debug_output_hides_secrets() {
        let creds = ServiceCredentials {
            name: "svc".into(),
            token_secret: "topsecret".into(),
            app_id: "wx123".into(),
            app_secret: "appsecret".into(),
            encryption_key: None,
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("topsecret"));
        assert!(!printed.contains("appsecret"));

        let token = AccessToken::new("bearer-value", 10, Utc::now()).unwrap();
        assert!(!format!("{:?}", token).contains("bearer-value"));
    }
}
