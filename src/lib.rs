// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod fallback;
pub mod metrics;
pub mod record;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::cache::{CacheEntry, CacheManager, CacheSnapshot};
pub use crate::config::AggregatorConfig;
pub use crate::coordinator::{RefreshCoordinator, RefreshPolicy, RefreshReport};
pub use crate::extract::{Extractor, ExtractorRegistry, FetchContext};
pub use crate::fallback::FallbackStore;
pub use crate::record::{FetchStatus, ProviderResult, Record, Tier};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::extract::feed::FeedExtractor;
use crate::extract::relevance::{AcceptAll, KeywordFilter, RelevanceFilter};

/// Register one feed extractor per configured provider, all sharing the
/// HTTP client and the relevance filter.
pub fn registry_from_config(
    cfg: &AggregatorConfig,
    client: reqwest::Client,
) -> anyhow::Result<ExtractorRegistry> {
    let filter: Arc<dyn RelevanceFilter> =
        if cfg.relevance.anchors.is_empty() && cfg.relevance.blockers.is_empty() {
            Arc::new(AcceptAll)
        } else {
            Arc::new(KeywordFilter::new(&cfg.relevance).context("building relevance filter")?)
        };

    let mut registry = ExtractorRegistry::new();
    for p in &cfg.providers {
        let ex = FeedExtractor::from_spec(p.id.clone(), p.feed_spec(), filter.clone(), client.clone());
        registry.register(p.id.clone(), Arc::new(ex))?;
    }
    Ok(registry)
}

pub fn build_cache_manager(
    cfg: &AggregatorConfig,
    registry: ExtractorRegistry,
    fallback: FallbackStore,
) -> CacheManager {
    let coordinator = RefreshCoordinator::new(registry, Arc::new(fallback), cfg.refresh_policy());
    CacheManager::new(coordinator, cfg.ttl())
}

/// Build the full in-process app (HTTP extractors, fallback from disk).
pub fn app(cfg: &AggregatorConfig) -> anyhow::Result<(axum::Router, Arc<CacheManager>)> {
    let client = reqwest::Client::builder()
        .user_agent("topic-aggregator/0.1")
        .connect_timeout(Duration::from_secs(4))
        .build()
        .context("building http client")?;
    let registry = registry_from_config(cfg, client)?;
    let fallback = FallbackStore::load_or_empty(&cfg.fallback_path);
    let cache = Arc::new(build_cache_manager(cfg, registry, fallback));
    let router = api::router(api::AppState::new(cache.clone()));
    Ok((router, cache))
}
