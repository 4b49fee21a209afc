//! Prometheus Metrics for the WX Gateway
//!
//! Provides token refresh, webhook and upstream call metrics.

use lazy_static::lazy_static;
use prometheus::{self, CounterVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Token Metrics
    pub static ref TOKEN_REFRESHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("wx_gateway_token_refreshes_total", "Total access token refresh attempts"),
        &["service", "status"]
    ).unwrap();

    // Webhook Metrics
    pub static ref WEBHOOK_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("wx_gateway_webhook_requests_total", "Total webhook requests"),
        &["service", "verb", "status"]
    ).unwrap();

    // Upstream Metrics
    pub static ref UPSTREAM_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "wx_gateway_upstream_duration_seconds",
            "Upstream platform call duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["operation"]
    ).unwrap();
}

/// Register all metrics with the registry
pub fn register_metrics() {
    let collectors: [Box<dyn prometheus::core::Collector>; 3] = [
        Box::new(TOKEN_REFRESHES_TOTAL.clone()),
        Box::new(WEBHOOK_REQUESTS_TOTAL.clone()),
        Box::new(UPSTREAM_DURATION.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::warn!("Failed to register metric: {}", e);
        }
    }
}

/// Handler for the metrics endpoint - returns Prometheus text format
pub async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

/// Record a token refresh attempt
pub fn record_token_refresh(service: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    TOKEN_REFRESHES_TOTAL.with_label_values(&[service, status]).inc();
}

/// Record a webhook request outcome
pub fn record_webhook(service: &str, verb: &str, status: &str) {
    WEBHOOK_REQUESTS_TOTAL
        .with_label_values(&[service, verb, status])
        .inc();
}

/// Record an upstream call duration
pub fn record_upstream_call(operation: &str, duration_secs: f64) {
    UPSTREAM_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}
