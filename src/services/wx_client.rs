//! WX Platform Client
//!
//! Thin client for the platform's REST API. Every call that needs the service
//! access token obtains it through the [`AccessTokenCache`]; calls rejected for an
//! invalid token drop the cached token so the next request refreshes it.

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::token_cache::{AccessTokenCache, IssuedToken, TokenError, TokenFetcher};
use crate::config::UpstreamConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{QrKind, QrResult, ServiceCredentials, SnsToken};

/// errcodes the platform returns for a missing, invalid or expired access token
const INVALID_TOKEN_CODES: [i64; 3] = [40001, 40014, 42001];

/// Extract `(errcode, "errcode: errmsg")` from a body reporting failure
pub fn upstream_error(body: &Value) -> Option<(i64, String)> {
    let code = body.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return None;
    }
    let message = body
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Some((code, format!("{}: {}", code, message)))
}

/// Fetches service access tokens with the client-credential grant
pub struct WxTokenFetcher {
    http: reqwest::Client,
    url: String,
    app_id: String,
    app_secret: String,
    timeout: Duration,
}

impl WxTokenFetcher {
    pub fn new(
        http: reqwest::Client,
        upstream: &UpstreamConfig,
        credentials: &ServiceCredentials,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            url: format!("{}/cgi-bin/token", upstream.api_base_url.trim_end_matches('/')),
            app_id: credentials.app_id.clone(),
            app_secret: credentials.app_secret.clone(),
            timeout,
        }
    }
}

impl TokenFetcher for WxTokenFetcher {
    fn fetch(&self) -> BoxFuture<'static, Result<IssuedToken, TokenError>> {
        let request = self
            .http
            .get(&self.url)
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", self.app_id.as_str()),
                ("secret", self.app_secret.as_str()),
            ])
            .timeout(self.timeout);

        async move {
            let started = Instant::now();
            let response = request.send().await;
            metrics::record_upstream_call("token", started.elapsed().as_secs_f64());

            let response = response.map_err(|e| {
                if e.is_timeout() {
                    TokenError::Timeout
                } else {
                    TokenError::Transport(e.without_url().to_string())
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                return Err(TokenError::Upstream {
                    code: i64::from(status.as_u16()),
                    message: format!("token endpoint returned HTTP {}", status.as_u16()),
                });
            }

            let body: Value = response
                .json()
                .await
                .map_err(|e| TokenError::Malformed(e.without_url().to_string()))?;
            if let Some((code, message)) = upstream_error(&body) {
                return Err(TokenError::Upstream { code, message });
            }

            let value = body["access_token"]
                .as_str()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| TokenError::Malformed("no access_token in response".into()))?;
            let ttl_seconds = body["expires_in"]
                .as_i64()
                .ok_or_else(|| TokenError::Malformed("no expires_in in response".into()))?;
            if ttl_seconds <= 0 {
                return Err(TokenError::Malformed(format!("expires_in {} is not positive", ttl_seconds)));
            }

            Ok(IssuedToken {
                value: value.to_string(),
                ttl_seconds,
            })
        }
        .boxed()
    }
}

/// Platform REST client bound to one service
#[derive(Clone)]
pub struct WxClient {
    http: reqwest::Client,
    upstream: Arc<UpstreamConfig>,
    credentials: Arc<ServiceCredentials>,
    tokens: Arc<AccessTokenCache>,
    timeout: Duration,
}

impl WxClient {
    pub fn new(
        http: reqwest::Client,
        upstream: Arc<UpstreamConfig>,
        credentials: Arc<ServiceCredentials>,
        tokens: Arc<AccessTokenCache>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            upstream,
            credentials,
            tokens,
            timeout,
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn tokens(&self) -> &Arc<AccessTokenCache> {
        &self.tokens
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.upstream.api_base_url.trim_end_matches('/'), path)
    }

    /// Create a QR ticket carrying `scene`
    pub async fn create_qr(&self, kind: QrKind, scene: &str) -> AppResult<QrResult> {
        let token = self.tokens.get_valid_token().await?.value;

        let payload = match kind {
            QrKind::Temporary { expire_seconds } => json!({
                "expire_seconds": expire_seconds,
                "action_name": "QR_STR_SCENE",
                "action_info": { "scene": { "scene_str": scene } },
            }),
            QrKind::Permanent => json!({
                "action_name": "QR_LIMIT_STR_SCENE",
                "action_info": { "scene": { "scene_str": scene } },
            }),
        };

        let request = self
            .http
            .post(self.api_url("/cgi-bin/qrcode/create"))
            .query(&[("access_token", token.as_str())])
            .json(&payload);
        let body = self.send("qrcode", request, Some(&token)).await?;

        let ticket = body["ticket"]
            .as_str()
            .ok_or_else(|| AppError::Internal("no ticket in QR response".into()))?;
        let url = body["url"].as_str().unwrap_or_default();

        Ok(QrResult {
            ticket_url_to_show_qr_code: format!(
                "{}?ticket={}",
                self.upstream.qr_show_url,
                urlencoding::encode(ticket)
            ),
            url_included_in_qr_code: url.to_string(),
        })
    }

    /// Look up a subscriber by open id using the service token
    pub async fn user_info(&self, open_id: &str) -> AppResult<Value> {
        let token = self.tokens.get_valid_token().await?.value;

        let request = self.http.get(self.api_url("/cgi-bin/user/info")).query(&[
            ("access_token", token.as_str()),
            ("openid", open_id),
            ("lang", "zh_CN"),
        ]);
        self.send("user_info", request, Some(&token)).await
    }

    /// Exchange an OAuth code for the user's open id and sns token
    pub async fn exchange_code(&self, code: &str) -> AppResult<SnsToken> {
        let request = self
            .http
            .get(self.api_url("/sns/oauth2/access_token"))
            .query(&[
                ("appid", self.credentials.app_id.as_str()),
                ("secret", self.credentials.app_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
            ]);
        let body = self.send("sns_token", request, None).await?;

        Ok(serde_json::from_value(body)?)
    }

    /// Fetch user info with the user's own sns token
    pub async fn sns_user_info(&self, sns: &SnsToken) -> AppResult<Value> {
        let request = self.http.get(self.api_url("/sns/userinfo")).query(&[
            ("access_token", sns.access_token.as_str()),
            ("openid", sns.openid.as_str()),
            ("lang", "zh_CN"),
        ]);
        self.send("sns_userinfo", request, None).await
    }

    /// Shorten `long_url`
    pub async fn short_url(&self, long_url: &str) -> AppResult<String> {
        let token = self.tokens.get_valid_token().await?.value;

        let request = self
            .http
            .post(self.api_url("/cgi-bin/shorturl"))
            .query(&[("access_token", token.as_str())])
            .json(&json!({ "action": "long2short", "long_url": long_url }));
        let body = self.send("shorturl", request, Some(&token)).await?;

        body["short_url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::Internal("no short_url in response".into()))
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
        token: Option<&str>,
    ) -> AppResult<Value> {
        let started = Instant::now();
        let response = request.timeout(self.timeout).send().await;
        metrics::record_upstream_call(operation, started.elapsed().as_secs_f64());
        let response = response.map_err(reqwest::Error::without_url)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream {
                code: i64::from(status.as_u16()),
                message: format!("upstream {} returned HTTP {}", operation, status.as_u16()),
            });
        }

        let body: Value = response.json().await.map_err(reqwest::Error::without_url)?;
        if let Some((code, message)) = upstream_error(&body) {
            if let Some(token) = token.filter(|_| INVALID_TOKEN_CODES.contains(&code)) {
                self.tokens.invalidate(token);
            }
            return Err(AppError::Upstream { code, message });
        }

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_error_reads_errcode() {
        assert_eq!(upstream_error(&json!({"errcode": 0, "errmsg": "ok"})), None);
        assert_eq!(upstream_error(&json!({"ticket": "x"})), None);
        assert_eq!(
            upstream_error(&json!({"errcode": 40013, "errmsg": "invalid appid"})),
            Some((40013, "40013: invalid appid".to_string()))
        );
    }
}
