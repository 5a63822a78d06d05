// tests/app_wiring.rs
// Config file + fallback file -> app(): no network involved, providers have
// no candidate URLs so every slot ends up on its fallback floor.

use std::fs;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use topic_aggregator::api::ArticlesResponse;
use topic_aggregator::{registry_from_config, AggregatorConfig};

fn write_fixture(dir: &std::path::Path) -> AggregatorConfig {
    let fallback = dir.join("fallback.json");
    fs::write(
        &fallback,
        r#"{
            "wire": [{"title": "Drought deepens", "url": "https://wire.example/1"}],
            "local": [
                {"title": "Reservoir low", "url": "https://local.example/1"},
                {"title": "Reservoir low (dup)", "url": "https://local.example/1"}
            ]
        }"#,
    )
    .unwrap();

    let toml = format!(
        r#"
ttl_secs = 600
global_deadline_ms = 2000
fallback_path = "{}"

[relevance]
anchors = ["drought"]

[[providers]]
id = "wire"
tier = "fast"

[[providers]]
id = "local"
tier = "slow"
sub_deadline_ms = 500
"#,
        fallback.display().to_string().replace('\\', "/")
    );
    AggregatorConfig::from_toml_str(&toml).unwrap()
}

#[test]
fn registry_has_one_extractor_per_provider() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_fixture(dir.path());
    let reg = registry_from_config(&cfg, reqwest::Client::new()).unwrap();
    assert_eq!(reg.len(), 2);
    assert_eq!(reg.ids().collect::<Vec<_>>(), vec!["local", "wire"]);
}

#[tokio::test]
async fn app_serves_fallback_floor_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_fixture(dir.path());
    let (app, cache) = topic_aggregator::app(&cfg).unwrap();

    let resp = app
        .oneshot(Request::get("/articles").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
    let out: ArticlesResponse = serde_json::from_slice(&bytes).unwrap();

    // Fallback is deduplicated at load; config order is wire, local.
    let urls: Vec<_> = out.data.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(urls, vec!["https://wire.example/1", "https://local.example/1"]);
    assert!(out.last_updated.is_some());

    let report = cache.last_report().unwrap();
    assert!(report.outcomes.iter().all(|o| o.fallback_applied));
}
