use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "aggregator_refresh_cycles_total",
            "Completed refresh cycles."
        );
        describe_counter!(
            "aggregator_cache_reads_total",
            "Cache reads by path (fresh, stale, in_flight)."
        );
        describe_counter!(
            "aggregator_provider_results_total",
            "Per-provider settlements by status."
        );
        describe_counter!(
            "aggregator_fallback_applied_total",
            "Times a provider slot was set from the fallback store."
        );
        describe_counter!(
            "aggregator_dedup_dropped_total",
            "Records removed by per-provider deduplication."
        );
        describe_histogram!(
            "aggregator_refresh_duration_ms",
            "Refresh cycle wall time in milliseconds."
        );
        describe_gauge!(
            "aggregator_last_refresh_ts",
            "Unix ts when the last refresh cycle concluded."
        );
        describe_gauge!("aggregator_cache_ttl_secs", "Configured cache TTL.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and expose a static gauge for the cache TTL.
    pub fn init(ttl_secs: u64) -> anyhow::Result<Self> {
        // Use default buckets to avoid API differences across crate versions.
        let handle = PrometheusBuilder::new().install_recorder()?;

        ensure_metrics_described();
        gauge!("aggregator_cache_ttl_secs").set(ttl_secs as f64);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
