use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::cache::{CacheManager, CacheSnapshot};
use crate::coordinator::RefreshReport;
use crate::error::AggregatorError;
use crate::record::Record;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheManager>,
}

impl AppState {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self { cache }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/articles", get(articles))
        .route("/articles/{source}", get(articles_for_source))
        .route("/debug/last-refresh", get(debug_last_refresh))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Boundary response shape.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ArticlesResponse {
    pub data: Vec<Record>,
    /// ISO-8601; null until the first refresh cycle has concluded.
    pub last_updated: Option<String>,
    /// Provider id or "all".
    pub source: String,
}

impl ArticlesResponse {
    fn from_snapshot(snap: CacheSnapshot, source: Option<&str>) -> Self {
        Self {
            data: snap.records,
            last_updated: snap
                .last_refreshed_at
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
            source: source.unwrap_or("all").to_string(),
        }
    }
}

/// Any core failure maps to a generic 500; details stay in the logs.
pub struct ApiError(AggregatorError);

impl From<AggregatorError> for ApiError {
    fn from(e: AggregatorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "read failed at boundary");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "articles unavailable" })),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct ArticlesQuery {
    #[serde(default)]
    source: Option<String>,
}

/// `None` and "all" both mean every provider.
fn provider_filter(source: Option<&str>) -> Option<&str> {
    source
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("all"))
}

async fn serve(state: &AppState, source: Option<&str>) -> Result<Json<ArticlesResponse>, ApiError> {
    let filter = provider_filter(source);
    let snap = state.cache.read(filter).await?;
    Ok(Json(ArticlesResponse::from_snapshot(snap, filter)))
}

async fn articles(
    State(state): State<AppState>,
    Query(q): Query<ArticlesQuery>,
) -> Result<Json<ArticlesResponse>, ApiError> {
    serve(&state, q.source.as_deref()).await
}

async fn articles_for_source(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<ArticlesResponse>, ApiError> {
    serve(&state, Some(&source)).await
}

async fn debug_last_refresh(State(state): State<AppState>) -> Json<Option<RefreshReport>> {
    Json(state.cache.last_report())
}
