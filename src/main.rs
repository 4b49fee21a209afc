//! WX Gateway - multi-tenant webhook gateway for the WeChat platform
//!
//! For every configured service (official account) this gateway:
//!
//! - Verifies webhook signatures and answers ownership checks
//! - Forwards inbound messages to a proxy URL, or acknowledges them locally
//! - Caches the service access token and refreshes it once per expiry
//! - Exposes QR, user info, OAuth code exchange and short URL endpoints

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wx_gateway::{config, metrics, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wx_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting WX Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let app_config = config::AppConfig::load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    tracing::info!(
        "Configuration loaded. Server will listen on {}:{}",
        app_config.server.host,
        app_config.server.port
    );

    let addr = app_config.server.socket_addr().map_err(|e| {
        tracing::error!("Invalid listen address: {}", e);
        anyhow::anyhow!("{}", e)
    })?;

    metrics::register_metrics();

    // Initialize application state; any invalid service aborts startup
    let state = Arc::new(config::AppState::new(app_config.clone()).await.map_err(|e| {
        tracing::error!("Failed to initialize services: {}", e);
        anyhow::anyhow!("{}", e)
    })?);

    if state.registry.is_empty() {
        tracing::warn!("No services configured; only common endpoints will be served");
    }

    let app = routes::build_app(state);

    // Start the server
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
