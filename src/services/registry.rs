//! Service Registry
//!
//! Maps a service name to its credentials, token cache and message handler.
//! Built once at startup and read-only afterwards, so lookups take no lock.

use base64::Engine;
use chrono::Duration;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use super::forward::MessageHandler;
use super::signature::SignatureVerifier;
use super::token_cache::{token_file_path, AccessTokenCache};
use super::wx_client::{WxClient, WxTokenFetcher};
use crate::config::{non_empty, AppConfig, ServiceConfig, UpstreamConfig};
use crate::error::{AppError, AppResult};
use crate::models::ServiceCredentials;

/// Length of the platform's base64 message encryption key, without padding
const AES_KEY_LEN: usize = 43;

/// Everything the gateway knows about one service
pub struct ServiceEntry {
    pub credentials: Arc<ServiceCredentials>,
    pub service_path: String,
    pub redirect_path: Option<String>,
    pub redirect_url: Option<Url>,
    pub redirect_userinfo: bool,
    pub client: WxClient,
    pub verifier: SignatureVerifier,
    pub handler: MessageHandler,
    workers: Arc<Semaphore>,
}

impl ServiceEntry {
    pub fn name(&self) -> &str {
        &self.credentials.name
    }

    pub fn tokens(&self) -> &Arc<AccessTokenCache> {
        self.client.tokens()
    }

    /// Wait for a free message worker slot
    pub async fn acquire_worker(&self) -> AppResult<OwnedSemaphorePermit> {
        self.workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Internal(format!("worker pool of {} closed", self.name())))
    }
}

impl std::fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("credentials", &self.credentials)
            .field("service_path", &self.service_path)
            .field("redirect_path", &self.redirect_path)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

/// Read-only lookup from service name to [`ServiceEntry`]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceEntry>>,
    claimed_paths: HashSet<String>,
    http: reqwest::Client,
    upstream: Arc<UpstreamConfig>,
    token_cache_dir: Option<PathBuf>,
    dont_append_user_info: bool,
}

impl ServiceRegistry {
    pub fn new(
        http: reqwest::Client,
        upstream: UpstreamConfig,
        token_cache_dir: Option<PathBuf>,
        dont_append_user_info: bool,
    ) -> Self {
        Self {
            services: HashMap::new(),
            claimed_paths: HashSet::new(),
            http,
            upstream: Arc::new(upstream),
            token_cache_dir,
            dont_append_user_info,
        }
    }

    /// Build the registry for every configured service
    pub fn from_config(config: &AppConfig, http: reqwest::Client) -> AppResult<Self> {
        let mut registry = Self::new(
            http,
            config.upstream.clone(),
            config.token_cache_dir.clone(),
            config.dont_append_user_info,
        );

        for (name, path) in config.endpoints.configured() {
            registry.claim_path(path, name)?;
        }
        for service in &config.services {
            registry.register(service)?;
        }

        tracing::info!(services = registry.services.len(), "Service registry built");
        Ok(registry)
    }

    /// Validate `config` and add it as a new service
    pub fn register(&mut self, config: &ServiceConfig) -> AppResult<Arc<ServiceEntry>> {
        let name = config.name.trim();
        if name.is_empty() {
            return Err(AppError::Config("service name must not be empty".into()));
        }
        if self.services.contains_key(name) {
            return Err(AppError::Config(format!("duplicate service name {}", name)));
        }

        let credentials = Arc::new(build_credentials(name, config)?);

        let redirect_path = non_empty(&config.endpoints.redirect_path).map(str::to_string);
        let redirect_url = non_empty(&config.redirect_url)
            .map(|raw| parse_url(name, "redirect-url", raw))
            .transpose()?;
        if redirect_url.is_some() && redirect_path.is_none() {
            return Err(AppError::Config(format!(
                "endpoints.redirect_path in service {} must be specified if you want to use redirect_url",
                name
            )));
        }
        let proxy_url = non_empty(&config.msg_proxy_pass)
            .map(|raw| parse_url(name, "msg-proxy-pass", raw))
            .transpose()?;

        if config.worker_num == 0 {
            return Err(AppError::Config(format!("worker_num of service {} must be positive", name)));
        }
        if config.timeout_secs == 0 {
            return Err(AppError::Config(format!("timeout_secs of service {} must be positive", name)));
        }

        let service_path = config.endpoints.service_path.trim().to_string();
        let mut paths = vec![service_path.clone()];
        paths.extend(redirect_path.clone());
        let mut seen = HashSet::new();
        for path in &paths {
            validate_path(path, name)?;
            if self.claimed_paths.contains(path) || !seen.insert(path) {
                return Err(AppError::Config(format!(
                    "path {} of service {} is already in use",
                    path, name
                )));
            }
        }

        let margin = Duration::try_seconds(self.upstream.refresh_margin_secs.max(0)).ok_or_else(|| {
            AppError::Config(format!(
                "upstream.refresh_margin_secs {} is out of range",
                self.upstream.refresh_margin_secs
            ))
        })?;
        let timeout = std::time::Duration::from_secs(config.timeout_secs);
        let fetcher = WxTokenFetcher::new(self.http.clone(), &self.upstream, &credentials, timeout);
        let mut tokens = AccessTokenCache::new(
            name,
            Arc::new(fetcher),
            margin,
            timeout,
        );
        if let Some(dir) = &self.token_cache_dir {
            tokens = tokens.with_store(token_file_path(dir, &credentials.app_id));
        }

        let handler = match proxy_url {
            Some(url) => MessageHandler::ForwardToProxy {
                url,
                append_user_info: !self.dont_append_user_info,
            },
            None => MessageHandler::LocalDefault,
        };

        let entry = Arc::new(ServiceEntry {
            client: WxClient::new(
                self.http.clone(),
                self.upstream.clone(),
                credentials.clone(),
                Arc::new(tokens),
                timeout,
            ),
            verifier: SignatureVerifier::new(
                credentials.token_secret.clone(),
                config.signature_window_secs,
            ),
            credentials,
            service_path,
            redirect_path,
            redirect_url,
            redirect_userinfo: config.redirect_userinfo,
            handler,
            workers: Arc::new(Semaphore::new(config.worker_num)),
        });

        self.claimed_paths.extend(paths);
        self.services.insert(name.to_string(), entry.clone());
        tracing::info!(service = %name, path = %entry.service_path, handler = ?entry.handler, "Service registered");

        Ok(entry)
    }

    /// Look up a service by name
    pub fn resolve(&self, name: &str) -> AppResult<Arc<ServiceEntry>> {
        self.services
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::UnknownService(name.to_string()))
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<ServiceEntry>> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Load persisted tokens for every service
    pub async fn restore_tokens(&self) {
        for entry in self.services.values() {
            entry.tokens().restore().await;
        }
    }

    fn claim_path(&mut self, path: &str, owner: &str) -> AppResult<()> {
        validate_path(path, owner)?;
        if !self.claimed_paths.insert(path.to_string()) {
            return Err(AppError::Config(format!("path {} of {} is already in use", path, owner)));
        }
        Ok(())
    }
}

fn build_credentials(name: &str, config: &ServiceConfig) -> AppResult<ServiceCredentials> {
    let creds = &config.credentials;

    let token = creds.token.trim();
    if !(3..=32).contains(&token.len()) || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::Config(format!(
            "token of service {} must be 3-32 letters or digits",
            name
        )));
    }
    if creds.app_id.trim().is_empty() || creds.app_secret.trim().is_empty() {
        return Err(AppError::Config(format!(
            "app_id and app_secret of service {} are required",
            name
        )));
    }

    let encryption_key = non_empty(&creds.aes_key)
        .map(|key| decode_aes_key(name, key))
        .transpose()?;

    Ok(ServiceCredentials {
        name: name.to_string(),
        token_secret: token.to_string(),
        app_id: creds.app_id.trim().to_string(),
        app_secret: creds.app_secret.trim().to_string(),
        encryption_key,
    })
}

/// Decode the 43-character base64 key into its 32 bytes
fn decode_aes_key(name: &str, key: &str) -> AppResult<Vec<u8>> {
    let invalid = || AppError::Config(format!("aes_key of service {} is invalid", name));

    if key.len() != AES_KEY_LEN {
        return Err(invalid());
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(format!("{}=", key))
        .map_err(|_| invalid())?;
    if bytes.len() != 32 {
        return Err(invalid());
    }
    Ok(bytes)
}

fn parse_url(name: &str, field: &str, raw: &str) -> AppResult<Url> {
    let url = Url::parse(raw)
        .map_err(|e| AppError::Config(format!("{} of service {} is invalid: {}", field, name, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Config(format!(
            "{} of service {} must be an http(s) URL",
            field, name
        )));
    }
    Ok(url)
}

fn validate_path(path: &str, owner: &str) -> AppResult<()> {
    let literal = path.starts_with('/')
        && !path.chars().any(|c| c.is_whitespace() || matches!(c, ':' | '*' | '{' | '}' | '?' | '#'));
    if !literal {
        return Err(AppError::Config(format!(
            "path {:?} of {} must be a literal path starting with '/'",
            path, owner
        )));
    }
    Ok(())
}
