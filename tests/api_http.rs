// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - GET /articles (all, ?source=, /articles/{source})
// - GET /debug/last-refresh

mod common;

use std::collections::HashMap;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use common::{harness, policy, recs, secs, Harness, Step};
use topic_aggregator::api::{self, AppState, ArticlesResponse};

const BODY_LIMIT: usize = 1024 * 1024; // 1MB, safe for tests

fn test_app() -> (Router, Harness) {
    let h = harness(
        policy(&["A", "B"], &[]),
        secs(600),
        vec![
            ("A", vec![Step::Ok(secs(0), recs("A", &["a1", "a2"]))]),
            ("B", vec![Step::Fail(secs(0))]),
        ],
        HashMap::from([("B".to_string(), recs("B", &["fb"]))]),
    );
    let router = api::router(AppState::new(h.cache.clone()));
    (router, h)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Json) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build GET");
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    let json = serde_json::from_slice(&bytes).unwrap_or(Json::Null);
    (status, json)
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _h) = test_app();
    let req = Request::get("/health").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap().trim(), "OK");
}

#[tokio::test]
async fn articles_all_has_boundary_shape() {
    let (app, h) = test_app();
    let (status, v) = get_json(&app, "/articles").await;
    assert_eq!(status, StatusCode::OK);

    let obj = v.as_object().expect("json object");
    assert_eq!(obj.len(), 3, "only data, last_updated, source: {v}");
    assert_eq!(v["source"], "all");
    let ts = v["last_updated"].as_str().expect("last_updated string");
    assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok(), "not ISO-8601: {ts}");

    let resp: ArticlesResponse = serde_json::from_value(v).unwrap();
    assert_eq!(resp.data.len(), 3);
    assert_eq!(h.ex("A").calls(), 1);
}

#[tokio::test]
async fn articles_filtered_by_path_and_query() {
    let (app, _h) = test_app();

    let (_, by_path) = get_json(&app, "/articles/A").await;
    assert_eq!(by_path["source"], "A");
    let data = by_path["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert!(data.iter().all(|r| r["provider"] == "A"));

    let (_, by_query) = get_json(&app, "/articles?source=B").await;
    assert_eq!(by_query["source"], "B");
    let data = by_query["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["url"], "https://B.example/fb");

    let (_, all) = get_json(&app, "/articles?source=all").await;
    assert_eq!(all["source"], "all");
    assert_eq!(all["data"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn debug_last_refresh_reports_outcomes() {
    let (app, _h) = test_app();

    let (_, before) = get_json(&app, "/debug/last-refresh").await;
    assert!(before.is_null());

    get_json(&app, "/articles").await;
    let (status, report) = get_json(&app, "/debug/last-refresh").await;
    assert_eq!(status, StatusCode::OK);
    let outcomes = report["outcomes"].as_array().unwrap();
    assert_eq!(outcomes.len(), 2);
    let b = outcomes.iter().find(|o| o["provider"] == "B").unwrap();
    assert_eq!(b["status"], "failed");
    assert_eq!(b["fallback_applied"], true);
}
