//! Configuration module for the WX Gateway
//!
//! Handles loading configuration from environment variables and config files.

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::services::ServiceRegistry;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Optional gateway-wide endpoints
    #[serde(default)]
    pub endpoints: CommonEndpoints,
    /// Upstream platform addresses
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Directory where access tokens are persisted across restarts
    #[serde(default)]
    pub token_cache_dir: Option<PathBuf>,
    /// Never attach user info to forwarded messages, whatever the service says
    #[serde(default)]
    pub dont_append_user_info: bool,
    /// Configured services (tenants)
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerConfig {
    /// Address to bind; the host must be an IP literal
    pub fn socket_addr(&self) -> AppResult<SocketAddr> {
        let host: IpAddr = self.host.trim().parse().map_err(|_| {
            AppError::Config(format!("server.host {:?} is not an IP address", self.host))
        })?;
        Ok(SocketAddr::from((host, self.port)))
    }
}

/// Paths of the endpoints shared by all services; unset ones are not routed
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommonEndpoints {
    pub health_check: Option<String>,
    pub wx_qr: Option<String>,
    pub wx_user: Option<String>,
    pub sns_api: Option<String>,
    pub short_url: Option<String>,
    pub metrics: Option<String>,
}

impl CommonEndpoints {
    /// Configured (name, path) pairs
    pub fn configured(&self) -> Vec<(&'static str, &str)> {
        [
            ("health_check", &self.health_check),
            ("wx_qr", &self.wx_qr),
            ("wx_user", &self.wx_user),
            ("sns_api", &self.sns_api),
            ("short_url", &self.short_url),
            ("metrics", &self.metrics),
        ]
        .into_iter()
        .filter_map(|(name, path)| non_empty(path).map(|p| (name, p)))
        .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the platform REST API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Page that renders a QR code from its ticket
    #[serde(default = "default_qr_show_url")]
    pub qr_show_url: String,
    /// Seconds before expiry at which a cached token is refreshed
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: i64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            qr_show_url: default_qr_show_url(),
            refresh_margin_secs: default_refresh_margin(),
        }
    }
}

/// One service (tenant)
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub credentials: CredentialsConfig,
    pub endpoints: ServiceEndpoints,
    /// Maximum number of messages handled concurrently
    #[serde(default = "default_worker_num")]
    pub worker_num: usize,
    /// Timeout for every upstream call made on behalf of this service
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Allowed clock distance of webhook timestamps; 0 disables the check
    #[serde(default)]
    pub signature_window_secs: u64,
    /// URL that receives forwarded messages; local default handling when unset
    #[serde(default)]
    pub msg_proxy_pass: Option<String>,
    /// URL the OAuth redirect entry point hands users to
    #[serde(default)]
    pub redirect_url: Option<String>,
    /// Fetch full user info before redirecting
    #[serde(default)]
    pub redirect_userinfo: bool,
}

#[derive(Clone, Deserialize)]
pub struct CredentialsConfig {
    pub token: String,
    pub app_id: String,
    pub app_secret: String,
    #[serde(default)]
    pub aes_key: Option<String>,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEndpoints {
    /// Webhook path the platform calls
    pub service_path: String,
    /// OAuth redirect entry point
    #[serde(default)]
    pub redirect_path: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7080
}

fn default_api_base_url() -> String {
    "https://api.weixin.qq.com".to_string()
}

fn default_qr_show_url() -> String {
    "https://mp.weixin.qq.com/cgi-bin/showqrcode".to_string()
}

fn default_refresh_margin() -> i64 {
    crate::services::DEFAULT_REFRESH_MARGIN_SECS
}

fn default_worker_num() -> usize {
    5
}

fn default_timeout_secs() -> u64 {
    10
}

/// Treat empty strings in config as unset
pub fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl AppConfig {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            // Set defaults
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            // Load from config file if exists
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
            )
            // Override with environment variables (WX_GATEWAY_ prefix)
            .add_source(
                config::Environment::with_prefix("WX_GATEWAY")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Client that does not follow redirects, for relaying redirect answers
    pub relay_client: reqwest::Client,
    pub registry: Arc<ServiceRegistry>,
}

impl AppState {
    /// Build the registry from `config` and restore persisted tokens.
    ///
    /// Fails on any configuration error, before anything is served.
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        // Shared by every service's platform client and message forwarding
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("wx-gateway/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        let relay_client = reqwest::Client::builder()
            .user_agent(concat!("wx-gateway/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let registry = ServiceRegistry::from_config(&config, http_client)?;
        registry.restore_tokens().await;

        Ok(Self {
            config: Arc::new(config),
            relay_client,
            registry: Arc::new(registry),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(host: &str) -> ServerConfig {
        ServerConfig {
            host: host.to_string(),
            port: 7080,
        }
    }

    #[test]
    fn test_socket_addr_parses_ip_hosts() {
        assert_eq!(
            server("0.0.0.0").socket_addr().unwrap(),
            SocketAddr::from(([0, 0, 0, 0], 7080))
        );
        assert_eq!(server("::1").socket_addr().unwrap().port(), 7080);
    }

    #[test]
    fn test_socket_addr_rejects_host_names() {
        let err = server("localhost").socket_addr().unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("localhost")));
    }
}
