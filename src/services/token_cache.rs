//! Access Token Cache
//!
//! Caches one bearer token per service and refreshes it from the platform on
//! demand. At most one refresh is in flight per service: callers arriving while
//! a refresh runs await that refresh and receive its outcome, success or error.

use chrono::{Duration, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::metrics;
use crate::models::AccessToken;

/// Default safety margin before expiry at which a token is considered stale
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 60;

/// Why a token refresh failed
///
/// `Clone` so a single failed refresh can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Transport(String),

    #[error("token request timed out")]
    Timeout,

    #[error("{code}: {message}")]
    Upstream { code: i64, message: String },

    #[error("malformed token response: {0}")]
    Malformed(String),
}

/// A token as issued by the authority, before it is stamped with an expiry
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub value: String,
    pub ttl_seconds: i64,
}

/// Source of fresh tokens for one service
pub trait TokenFetcher: Send + Sync {
    fn fetch(&self) -> BoxFuture<'static, Result<IssuedToken, TokenError>>;
}

type RefreshFuture = Shared<BoxFuture<'static, Result<AccessToken, TokenError>>>;

/// Per-service access token cache with a single-refresher discipline
pub struct AccessTokenCache {
    service: String,
    fetcher: Arc<dyn TokenFetcher>,
    margin: Duration,
    timeout: std::time::Duration,
    current: RwLock<Option<AccessToken>>,
    pending: Mutex<Option<RefreshFuture>>,
    store: Option<TokenFile>,
}

impl AccessTokenCache {
    pub fn new(
        service: impl Into<String>,
        fetcher: Arc<dyn TokenFetcher>,
        margin: Duration,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            service: service.into(),
            fetcher,
            margin,
            timeout,
            current: RwLock::new(None),
            pending: Mutex::new(None),
            store: None,
        }
    }

    /// Persist refreshed tokens to `path` and restore from it on [`Self::restore`]
    pub fn with_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.store = Some(TokenFile::new(path));
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Return a token that is valid for at least the safety margin.
    ///
    /// A fresh cached token is returned without any network call. Otherwise the
    /// caller joins the in-flight refresh, starting one if none is running.
    pub async fn get_valid_token(self: &Arc<Self>) -> Result<AccessToken, TokenError> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let refresh = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(inflight) => inflight.clone(),
                None => {
                    // A refresh may have completed between the first check and the lock.
                    if let Some(token) = self.cached() {
                        return Ok(token);
                    }
                    let inflight = Arc::clone(self).refresh().boxed().shared();
                    *pending = Some(inflight.clone());
                    inflight
                }
            }
        };

        refresh.await
    }

    /// Drop the cached token if it is still `value`.
    ///
    /// Called when the platform rejects the token before its expiry.
    pub fn invalidate(&self, value: &str) {
        let mut current = self.current.write();
        if current.as_ref().is_some_and(|t| t.value == value) {
            tracing::info!(service = %self.service, "Dropping access token rejected by upstream");
            *current = None;
        }
    }

    /// Load a persisted token, if one exists and is still fresh
    pub async fn restore(&self) {
        let Some(store) = &self.store else {
            return;
        };

        match store.load().await {
            Ok(Some(token)) if token.is_fresh_at(Utc::now(), self.margin) => {
                tracing::info!(
                    service = %self.service,
                    expires_at = %token.expires_at,
                    "Restored access token from cache dir"
                );
                *self.current.write() = Some(token);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(service = %self.service, "Failed to restore access token: {}", e);
            }
        }
    }

    fn cached(&self) -> Option<AccessToken> {
        let now = Utc::now();
        self.current
            .read()
            .as_ref()
            .filter(|token| token.is_fresh_at(now, self.margin))
            .cloned()
    }

    async fn refresh(self: Arc<Self>) -> Result<AccessToken, TokenError> {
        tracing::debug!(service = %self.service, "Refreshing access token");

        // Released on every exit, including a panic while polling
        let pending = ClearPending(&self.pending);

        let result = match tokio::time::timeout(self.timeout, self.fetcher.fetch()).await {
            Ok(Ok(issued)) => {
                AccessToken::new(issued.value, issued.ttl_seconds, Utc::now()).ok_or_else(|| {
                    TokenError::Malformed(format!("unusable expires_in {}", issued.ttl_seconds))
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TokenError::Timeout),
        };

        match &result {
            Ok(token) => {
                *self.current.write() = Some(token.clone());
                tracing::info!(
                    service = %self.service,
                    expires_at = %token.expires_at,
                    "Access token refreshed"
                );
            }
            Err(e) => {
                tracing::warn!(service = %self.service, "Access token refresh failed: {}", e);
            }
        }
        metrics::record_token_refresh(&self.service, result.is_ok());

        drop(pending);

        if let (Ok(token), Some(store)) = (&result, &self.store) {
            if let Err(e) = store.save(token).await {
                tracing::warn!(service = %self.service, "Failed to persist access token: {}", e);
            }
        }

        result
    }
}

/// Empties the in-flight slot when dropped
struct ClearPending<'a>(&'a Mutex<Option<RefreshFuture>>);

impl Drop for ClearPending<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

/// JSON file holding one service's token
#[derive(Debug, Clone)]
struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> std::io::Result<Option<AccessToken>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if bytes.is_empty() {
            return Ok(None);
        }

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    async fn save(&self, token: &AccessToken) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let serialized = serde_json::to_vec_pretty(token)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp_path = self.path.with_extension("tmp");

        tokio::fs::write(&tmp_path, serialized).await?;
        tokio::fs::rename(&tmp_path, &self.path).await
    }
}

/// Path of a service's persisted token inside the cache dir
pub fn token_file_path(dir: &Path, app_id: &str) -> PathBuf {
    dir.join(format!("{}.json", app_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: Arc<AtomicUsize>,
        ttl_seconds: i64,
        delay: std::time::Duration,
        fail: bool,
    }

    impl TokenFetcher for CountingFetcher {
        fn fetch(&self) -> BoxFuture<'static, Result<IssuedToken, TokenError>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let ttl_seconds = self.ttl_seconds;
            let delay = self.delay;
            let fail = self.fail;
            async move {
                tokio::time::sleep(delay).await;
                if fail {
                    Err(TokenError::Upstream {
                        code: -1,
                        message: "system busy".into(),
                    })
                } else {
                    Ok(IssuedToken {
                        value: format!("token-{}", n),
                        ttl_seconds,
                    })
                }
            }
            .boxed()
        }
    }

    fn cache(ttl_seconds: i64, fail: bool) -> (Arc<AccessTokenCache>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = Arc::new(CountingFetcher {
            calls: calls.clone(),
            ttl_seconds,
            delay: std::time::Duration::from_millis(50),
            fail,
        });
        let cache = AccessTokenCache::new(
            "svc",
            fetcher,
            Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            std::time::Duration::from_secs(5),
        );
        (Arc::new(cache), calls)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let (cache, calls) = cache(7200, false);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_valid_token().await })
            })
            .collect();

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap().unwrap().value);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| v == "token-1"));
    }

    #[tokio::test]
    async fn test_fresh_token_is_served_without_refetch() {
        let (cache, calls) = cache(7200, false);

        let first = cache.get_valid_token().await.unwrap();
        let second = cache.get_valid_token().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_inside_margin_is_refreshed() {
        // ttl shorter than the margin: every call sees a stale token
        let (cache, calls) = cache(30, false);

        assert_eq!(cache.get_valid_token().await.unwrap().value, "token-1");
        assert_eq!(cache.get_valid_token().await.unwrap().value, "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter_and_allows_retry() {
        let (cache, calls) = cache(7200, true);

        let (a, b) = tokio::join!(cache.get_valid_token(), cache.get_valid_token());
        assert!(matches!(a, Err(TokenError::Upstream { code: -1, .. })));
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // the pending slot is released, so the next caller retries
        assert!(cache.get_valid_token().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let (cache, calls) = cache(7200, false);

        let token = cache.get_valid_token().await.unwrap();
        cache.invalidate("some-other-token");
        assert_eq!(cache.get_valid_token().await.unwrap(), token);

        cache.invalidate(&token.value);
        assert_eq!(cache.get_valid_token().await.unwrap().value, "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Misbehaves on the first call, then issues a normal token
    struct FlakyFetcher {
        calls: Arc<AtomicUsize>,
        first_ttl: Option<i64>,
    }

    impl TokenFetcher for FlakyFetcher {
        fn fetch(&self) -> BoxFuture<'static, Result<IssuedToken, TokenError>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                match self.first_ttl {
                    Some(ttl_seconds) => {
                        return futures_util::future::ready(Ok(IssuedToken {
                            value: "token-1".into(),
                            ttl_seconds,
                        }))
                        .boxed()
                    }
                    None => panic!("authority client crashed"),
                }
            }
            futures_util::future::ready(Ok(IssuedToken {
                value: format!("token-{}", n),
                ttl_seconds: 7200,
            }))
            .boxed()
        }
    }

    fn flaky_cache(first_ttl: Option<i64>) -> (Arc<AccessTokenCache>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = Arc::new(FlakyFetcher {
            calls: calls.clone(),
            first_ttl,
        });
        let cache = AccessTokenCache::new(
            "svc",
            fetcher,
            Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            std::time::Duration::from_secs(5),
        );
        (Arc::new(cache), calls)
    }

    #[tokio::test]
    async fn test_out_of_range_lifetime_is_malformed_and_retried() {
        let (cache, calls) = flaky_cache(Some(i64::MAX));

        assert!(matches!(
            cache.get_valid_token().await,
            Err(TokenError::Malformed(_))
        ));

        assert_eq!(cache.get_valid_token().await.unwrap().value, "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_refresh_releases_in_flight_slot() {
        let (cache, calls) = flaky_cache(None);

        let crashed = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_valid_token().await }).await
        };
        assert!(crashed.unwrap_err().is_panic());

        assert_eq!(cache.get_valid_token().await.unwrap().value, "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_authority_times_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = Arc::new(CountingFetcher {
            calls: calls.clone(),
            ttl_seconds: 7200,
            delay: std::time::Duration::from_secs(3600),
            fail: false,
        });
        let cache = Arc::new(AccessTokenCache::new(
            "svc",
            fetcher,
            Duration::seconds(60),
            std::time::Duration::from_secs(5),
        ));

        assert_eq!(cache.get_valid_token().await, Err(TokenError::Timeout));
    }

    #[tokio::test]
    async fn test_token_survives_restart_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = token_file_path(dir.path(), "wx123");

        let (calls, first) = {
            let calls = Arc::new(AtomicUsize::new(0));
            let fetcher = Arc::new(CountingFetcher {
                calls: calls.clone(),
                ttl_seconds: 7200,
                delay: std::time::Duration::ZERO,
                fail: false,
            });
            let cache = Arc::new(
                AccessTokenCache::new("svc", fetcher.clone(), Duration::seconds(60), std::time::Duration::from_secs(5))
                    .with_store(&path),
            );
            let token = cache.get_valid_token().await.unwrap();
            (calls, token)
        };
        assert!(path.exists());

        let fetcher = Arc::new(CountingFetcher {
            calls: calls.clone(),
            ttl_seconds: 7200,
            delay: std::time::Duration::ZERO,
            fail: false,
        });
        let restarted = Arc::new(
            AccessTokenCache::new("svc", fetcher, Duration::seconds(60), std::time::Duration::from_secs(5))
                .with_store(&path),
        );
        restarted.restore().await;

        assert_eq!(restarted.get_valid_token().await.unwrap(), first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
