//! Topic Aggregator: binary entrypoint
//! Boots the Axum HTTP server: config, fallback store, extractors, cache, routes.

use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use topic_aggregator::metrics::Metrics;
use topic_aggregator::AggregatorConfig;

/// Compact logs by default; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("topic_aggregator=info,aggregator=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // The platform may already have installed a subscriber; keep theirs then.
    let _ = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AggregatorConfig::load_default()?;
    tracing::info!(
        providers = cfg.providers.len(),
        ttl_secs = cfg.ttl_secs,
        deadline_ms = cfg.global_deadline_ms,
        "aggregator config loaded"
    );

    let (mut router, cache) = topic_aggregator::app(&cfg)?;

    match Metrics::init(cfg.ttl_secs) {
        Ok(m) => router = router.merge(m.router()),
        Err(e) => tracing::warn!(error = %e, "metrics recorder not installed; /metrics disabled"),
    }

    // Warm the cache in the background so the first reader finds data.
    tokio::spawn(async move {
        if let Some(report) = cache.force_refresh().await {
            tracing::info!(elapsed_ms = report.elapsed_ms, "startup refresh done");
        }
    });

    Ok(router.into())
}
