use crate::cache::{Cache, to_base64, to_json, to_raw};
use crate::refresh::{RefreshEngine, RefreshHandle};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<Cache>,
    pub engine: Arc<RefreshEngine>,
    pub refresh: RefreshHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/servers/live", get(servers_live))
        .route("/cache", get(cache_top))
        .route("/cache/raw", get(cache_raw))
        .route("/cache/base64", get(cache_base64))
        .route("/cache/all/base64", get(cache_all_base64))
        .route("/subscription/site-specific", get(site_specific))
        .with_state(state)
}

fn no_snapshot() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "no snapshot available yet").into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Trigger a refresh (or join the one already running) and serve whatever
/// the cache holds afterwards.
async fn servers_live(State(state): State<AppState>) -> Response {
    match state.refresh.request_refresh().await {
        Some(summary) => log::debug!(
            "Live refresh answered: {}/{} working",
            summary.working,
            summary.tested
        ),
        None => log::error!("Refresh loop is gone; serving current snapshot"),
    }

    match state.cache.load() {
        Some(generation) => Json(to_json(&generation.top_k)).into_response(),
        None => no_snapshot(),
    }
}

async fn cache_top(State(state): State<AppState>) -> Response {
    match state.cache.load() {
        Some(generation) => Json(to_json(&generation.top_k)).into_response(),
        None => no_snapshot(),
    }
}

async fn cache_raw(State(state): State<AppState>) -> Response {
    match state.cache.load() {
        Some(generation) => to_raw(&generation.top_k).into_response(),
        None => no_snapshot(),
    }
}

async fn cache_base64(State(state): State<AppState>) -> Response {
    match state.cache.load() {
        Some(generation) => to_base64(&generation.top_k).into_response(),
        None => no_snapshot(),
    }
}

async fn cache_all_base64(State(state): State<AppState>) -> Response {
    match state.cache.load() {
        Some(generation) => to_base64(&generation.all_working).into_response(),
        None => no_snapshot(),
    }
}

#[derive(Debug, Deserialize)]
struct SiteQuery {
    url: Option<String>,
}

async fn site_specific(
    State(state): State<AppState>,
    Query(query): Query<SiteQuery>,
) -> Response {
    let Some(url) = query.url else {
        return (StatusCode::BAD_REQUEST, "missing 'url' query parameter").into_response();
    };

    let valid = url::Url::parse(&url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false);
    if !valid {
        return (StatusCode::BAD_REQUEST, "invalid 'url' query parameter").into_response();
    }

    match state.engine.site_refresh(&url).await {
        Some(snapshot) => to_base64(&snapshot).into_response(),
        None => no_snapshot(),
    }
}
