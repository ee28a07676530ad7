mod config;
mod core;
mod interfaces;
mod logging;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::core::cache::CacheManager;
use crate::core::events::EventSink;
use crate::core::pipeline::{DraftGenerator, Pipeline, RssSource};
use crate::core::store::Store;
use crate::core::trend::{TrendRanker, providers};
use crate::core::worker::Worker;
use crate::interfaces::web::ApiServer;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::from_env();

    let (log_tx, _) = tokio::sync::broadcast::channel::<String>(1024);
    logging::init(log_tx.clone());

    info!("trendwire starting, data dir {}", config.data_dir.display());

    // The worker is useless without durable state; exhausting the retries
    // is fatal.
    let store = match Store::open_with_retry(
        &config.data_dir,
        config.startup_retries,
        Duration::from_secs(config.startup_retry_delay_secs),
    )
    .await
    {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Store unavailable, aborting startup: {:#}", e);
            std::process::exit(1);
        }
    };

    let cache = Arc::new(CacheManager::new(Some(store.get_db())));
    let events = EventSink::new(256);
    let shutdown = CancellationToken::new();

    // Mirror structured events into the store's replay buffer for the
    // admin log endpoints.
    spawn_event_persister(events.clone(), store.clone(), shutdown.clone());

    let client = reqwest::Client::builder()
        .user_agent(concat!("trendwire/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let chain = providers::build_chain(&config, &client);
    let ranker = Arc::new(TrendRanker::new(&config, chain, cache.clone()));
    let source = Arc::new(RssSource::new(client, config.feed_urls.clone()));
    let pipeline = Arc::new(Pipeline::new(
        &config,
        source,
        Arc::new(DraftGenerator),
        ranker,
        store.clone(),
        events.clone(),
    ));
    let worker = Arc::new(Worker::new(
        config.clone(),
        store.clone(),
        pipeline,
        events.clone(),
        shutdown.clone(),
    ));

    ApiServer::new(
        store.clone(),
        cache,
        worker.clone(),
        events,
        log_tx,
        config.api_host.clone(),
        config.api_port,
    )
    .start(shutdown.clone())?;

    worker.reconcile().await?;

    let worker_handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    match tokio::time::timeout(SHUTDOWN_GRACE, worker_handle).await {
        Ok(Ok(Ok(()))) => info!("Worker stopped cleanly"),
        Ok(Ok(Err(e))) => warn!("Worker stopped with error: {}", e),
        Ok(Err(e)) => warn!("Worker task join failed: {}", e),
        Err(_) => {
            error!("Graceful shutdown timed out after {:?}, exiting hard", SHUTDOWN_GRACE);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn spawn_event_persister(events: EventSink, store: Arc<Store>, shutdown: CancellationToken) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Ok(event) => {
                        if let Err(e) = store.push_event(&event).await {
                            warn!("Event buffer write failed: {}", e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event persister lagged, {} event(s) dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}
