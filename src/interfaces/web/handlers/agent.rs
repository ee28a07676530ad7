use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::super::AppState;
use crate::core::worker::TriggerOutcome;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TriggerRequest {
    #[serde(default)]
    execute_now: bool,
}

/// POST /api/agent/trigger
pub(crate) async fn trigger(
    State(state): State<AppState>,
    body: Option<Json<TriggerRequest>>,
) -> impl IntoResponse {
    if state.store.ping().await.is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "success": false, "error": "Job store is unreachable" })),
        );
    }

    let request = body.map(|Json(r)| r).unwrap_or_default();
    match state.worker.trigger_manual("admin").await {
        Ok(TriggerOutcome::Disabled) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Agent is disabled in settings" })),
        ),
        Ok(TriggerOutcome::CoolingDown { remaining_secs }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "success": false,
                "error": format!("Trigger cooldown active, retry in {remaining_secs}s"),
                "retryAfterSeconds": remaining_secs,
            })),
        ),
        Ok(TriggerOutcome::Enqueued { job }) => {
            let next_run = state.store.next_run().await.ok().flatten();
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "jobId": job.job_id,
                    "nextRun": next_run,
                    "executionMode": if request.execute_now { "immediate" } else { "queued" },
                })),
            )
        }
        Err(e) => {
            error!("Manual trigger failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
        }
    }
}

/// GET /api/agent/status
pub(crate) async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let queue = state.store.queue_counts().await;
    let pending = state.store.pending_jobs().await;
    let stats = state.store.run_stats().await;
    let settings = state.store.settings_snapshot().await;

    match (queue, pending, stats, settings) {
        (Ok(queue), Ok(pending), Ok(stats), Ok(settings)) => {
            let pending: Vec<_> = pending
                .iter()
                .map(|j| {
                    json!({
                        "jobId": j.job_id,
                        "state": j.state,
                        "runAtMs": j.run_at_ms,
                        "progress": j.progress,
                        "attemptsMade": j.attempts_made,
                    })
                })
                .collect();
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "queue": queue,
                    "pendingJobs": pending,
                    "stats": stats,
                    "settings": settings,
                })),
            )
        }
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "Status read failed" })),
        ),
    }
}

/// GET /api/agent/settings
pub(crate) async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.settings_snapshot().await {
        Ok(settings) => (
            StatusCode::OK,
            Json(json!({ "success": true, "settings": settings })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": e.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SettingsRequest {
    enabled: Option<bool>,
    interval_hours: Option<i64>,
}

/// POST /api/agent/settings. Writes are followed by a schedule
/// reconciliation so an enable or interval change takes effect without a
/// restart.
pub(crate) async fn update_settings(
    State(state): State<AppState>,
    Json(request): Json<SettingsRequest>,
) -> impl IntoResponse {
    if let Some(enabled) = request.enabled
        && let Err(e) = state.store.set_agent_enabled(enabled).await
    {
        return settings_error(e);
    }
    if let Some(hours) = request.interval_hours
        && let Err(e) = state.store.set_interval_hours(hours).await
    {
        return settings_error(e);
    }

    if let Err(e) = state.worker.reconcile().await {
        error!("Post-settings reconcile failed: {}", e);
    }

    match state.store.settings_snapshot().await {
        Ok(settings) => (
            StatusCode::OK,
            Json(json!({ "success": true, "settings": settings })),
        ),
        Err(e) => settings_error(e),
    }
}

fn settings_error(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    error!("Settings update failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": e.to_string() })),
    )
}

/// GET /api/agent/runs
pub(crate) async fn runs(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.recent_runs(20).await {
        Ok(runs) => (
            StatusCode::OK,
            Json(json!({ "success": true, "runs": runs })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": e.to_string() })),
        ),
    }
}

/// GET /api/agent/logs
pub(crate) async fn logs(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.recent_events(100).await {
        Ok(events) => (
            StatusCode::OK,
            Json(json!({ "success": true, "events": events })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": e.to_string() })),
        ),
    }
}
