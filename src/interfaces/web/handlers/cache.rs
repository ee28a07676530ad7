use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;

/// GET /api/cache/stats
pub(crate) async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.cache.stats().await;
    (StatusCode::OK, Json(json!({ "success": true, "stats": stats })))
}

/// POST /api/cache/reset-stats
pub(crate) async fn reset_stats(State(state): State<AppState>) -> impl IntoResponse {
    state.cache.reset_stats().await;
    (StatusCode::OK, Json(json!({ "success": true })))
}

/// POST /api/cache/clear
pub(crate) async fn clear(State(state): State<AppState>) -> impl IntoResponse {
    state.cache.clear_all().await;
    state.events.info("Cache cleared via admin API");
    (StatusCode::OK, Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub(crate) struct InvalidateRequest {
    tag: Option<String>,
    prefix: Option<String>,
}

/// POST /api/cache/invalidate
pub(crate) async fn invalidate(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> impl IntoResponse {
    let mut removed = 0;
    if let Some(tag) = &request.tag {
        removed += state.cache.invalidate_by_tag(tag).await;
    }
    if let Some(prefix) = &request.prefix {
        removed += state.cache.invalidate_by_prefix(prefix).await;
    }
    if request.tag.is_none() && request.prefix.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "tag or prefix is required" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "success": true, "removed": removed })),
    )
}
