mod handlers;
mod router;

use anyhow::Result;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::cache::CacheManager;
use crate::core::events::EventSink;
use crate::core::store::Store;
use crate::core::worker::Worker;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<Store>,
    pub(crate) cache: Arc<CacheManager>,
    pub(crate) worker: Arc<Worker>,
    pub(crate) events: EventSink,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
    pub(crate) api_port: u16,
}

pub struct ApiServer {
    state: AppState,
    api_host: String,
}

impl ApiServer {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<CacheManager>,
        worker: Arc<Worker>,
        events: EventSink,
        log_tx: tokio::sync::broadcast::Sender<String>,
        api_host: String,
        api_port: u16,
    ) -> Self {
        Self {
            state: AppState {
                store,
                cache,
                worker,
                events,
                log_tx,
                api_port,
            },
            api_host,
        }
    }

    /// Bind and serve in a background task until the shutdown token fires.
    pub fn start(self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.api_host, self.state.api_port);
        let app = router::build_api_router(self.state);

        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!("API server running at http://{addr}");
                    let serve = axum::serve(listener, app)
                        .with_graceful_shutdown(async move { shutdown.cancelled().await });
                    if let Err(e) = serve.await {
                        error!("API server crashed: {}", e);
                    }
                }
                Err(e) => error!("API server failed to bind {}: {}", addr, e),
            }
        });
        Ok(())
    }
}

// --- SSE endpoints (used by router) ---

/// Raw process log lines, as mirrored by the tracing writer.
async fn sse_process_log(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream)
}

/// Structured agent events: the buffered backlog first, then live.
async fn sse_agent_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let backlog = state.store.recent_events(100).await.unwrap_or_default();
    let receiver = state.events.subscribe();

    let replay = tokio_stream::iter(backlog).map(event_payload);
    let live = BroadcastStream::new(receiver)
        .filter_map(|msg| msg.ok())
        .map(event_payload);

    Sse::new(replay.chain(live))
}

fn event_payload(event: crate::core::events::AgentEvent) -> Result<Event, Infallible> {
    let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().data(data))
}
