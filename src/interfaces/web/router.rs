use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{agent, cache};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/agent/trigger", post(agent::trigger))
        .route("/api/agent/status", get(agent::status))
        .route(
            "/api/agent/settings",
            get(agent::get_settings).post(agent::update_settings),
        )
        .route("/api/agent/runs", get(agent::runs))
        .route("/api/agent/logs", get(agent::logs))
        .route("/api/agent/logs/stream", get(super::sse_agent_events))
        .route("/api/logs/stream", get(super::sse_process_log))
        .route("/api/cache/stats", get(cache::stats))
        .route("/api/cache/reset-stats", post(cache::reset_stats))
        .route("/api/cache/clear", post(cache::clear))
        .route("/api/cache/invalidate", post(cache::invalidate))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state)
}
