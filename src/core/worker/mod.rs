use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::core::events::EventSink;
use crate::core::pipeline::Pipeline;
use crate::core::store::Store;
use crate::core::store::types::{JobRecord, RunResult};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_PROGRESS_STEP: u8 = 5;
const HEARTBEAT_PROGRESS_CAP: u8 = 80;

/// Outcome of a manual trigger request; the web layer maps these to
/// status codes.
#[derive(Debug)]
pub enum TriggerOutcome {
    Disabled,
    CoolingDown { remaining_secs: i64 },
    Enqueued { job: JobRecord },
}

/// Single-flight job worker: claims at most one job at a time, runs the
/// pipeline to completion, and keeps exactly one future scheduled run
/// pending while the agent is enabled.
pub struct Worker {
    config: AgentConfig,
    store: Arc<Store>,
    pipeline: Arc<Pipeline>,
    events: EventSink,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        config: AgentConfig,
        store: Arc<Store>,
        pipeline: Arc<Pipeline>,
        events: EventSink,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            pipeline,
            events,
            shutdown,
        }
    }

    /// Startup reconciliation. Idempotent; safe to run on every boot.
    ///
    /// Disabled agent: nothing to do. Missed or unset `nextRun`: drop any
    /// stale scheduled job and enqueue an immediate catch-up run. Future
    /// `nextRun` with no matching queued job: the queue was lost, so the
    /// schedule is re-derived from the configured interval instead of
    /// trusting the stale value.
    pub async fn reconcile(&self) -> Result<()> {
        if !self.store.agent_enabled().await? {
            info!("Agent disabled, skipping schedule reconciliation");
            return Ok(());
        }

        let next_run = self
            .store
            .next_run()
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        match next_run {
            Some(at) if at > Utc::now() => {
                if self.store.has_pending_scheduled().await? {
                    info!("Schedule intact, next run at {}", at.to_rfc3339());
                } else {
                    warn!("nextRun is set but no queued job exists, re-deriving schedule");
                    self.schedule_next_run().await?;
                }
            }
            _ => {
                info!("nextRun missing or already past, enqueueing catch-up run");
                self.store.remove_pending_scheduled().await?;
                self.store
                    .enqueue_scheduled(0, self.config.max_attempts, self.config.max_stalled_count)
                    .await?;
                self.store.set_next_run(&Utc::now().to_rfc3339()).await?;
            }
        }
        Ok(())
    }

    /// Main loop: watchdog pass, claim, process. Returns when the shutdown
    /// token fires.
    pub async fn run(&self) -> Result<()> {
        info!("Worker started, polling every {:?}", POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Worker shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            match self.store.requeue_stalled().await {
                Ok((0, 0)) => {}
                Ok((requeued, failed)) => {
                    warn!("Watchdog: {} job(s) requeued, {} failed", requeued, failed);
                }
                Err(e) => warn!("Watchdog pass failed: {}", e),
            }

            match self.store.claim_next(self.config.lock_duration_ms).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {}
                Err(e) => warn!("Job claim failed: {}", e),
            }
        }
    }

    /// Run one claimed job end to end. The settle step (record, ack,
    /// reschedule) runs regardless of the pipeline outcome.
    pub async fn process(&self, job: JobRecord) {
        info!(
            "Processing job {} (attempt {}/{})",
            job.job_id, job.attempts_made, job.max_attempts
        );
        self.events
            .report_progress(10, format!("Job {} started", job.job_id));
        if let Err(e) = self.store.update_progress(job.seq, 10).await {
            warn!("Progress update failed: {}", e);
        }

        let heartbeat = self.spawn_heartbeat(job.seq);
        let started_at = crate::core::store::now_ms();
        let timeout = Duration::from_secs(self.config.execution_timeout_secs);

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => {
                warn!("Shutdown during job {}, marking failed", job.job_id);
                RunResult::failed("worker shut down mid-run", 0.0)
            }
            outcome = tokio::time::timeout(timeout, self.pipeline.execute(job.seq)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        error!("Job {} exceeded the {}s execution timeout", job.job_id, timeout.as_secs());
                        RunResult::failed(
                            format!("execution exceeded {}s timeout", timeout.as_secs()),
                            timeout.as_secs_f64(),
                        )
                    }
                }
            }
        };

        heartbeat.abort();
        self.events
            .report_progress(90, format!("Job {} finishing", job.job_id));
        if let Err(e) = self.store.update_progress(job.seq, 90).await {
            warn!("Progress update failed: {}", e);
        }

        self.settle(&job, result, started_at).await;
    }

    async fn settle(&self, job: &JobRecord, result: RunResult, started_at_ms: i64) {
        let finished_at = crate::core::store::now_ms();
        if let Err(e) = self.store.record_run(&result, started_at_ms, finished_at).await {
            warn!("Run log write failed: {}", e);
        }

        let result_json = serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string());
        let ack = if result.success {
            self.events.success(format!("Job {} completed", job.job_id));
            self.store.complete_job(job.seq, &result_json).await
        } else {
            let summary = result.errors.join("; ");
            self.events
                .error(format!("Job {} failed: {}", job.job_id, summary));
            self.store.fail_job(job.seq, &summary, Some(&result_json)).await
        };
        if let Err(e) = ack {
            warn!("Job acknowledgement failed: {}", e);
        }

        // Unconditional on settle, conditional only on `enabled`: a failed
        // run must never stall the schedule.
        match self.reschedule_after_settle().await {
            Ok(Some(at)) => info!("Next run scheduled for {}", at),
            Ok(None) => {}
            Err(e) => error!("Reschedule after settle failed: {}", e),
        }
    }

    /// Re-derive the recurring schedule after a run settles. Returns the
    /// next-run time when a new job was created.
    async fn reschedule_after_settle(&self) -> Result<Option<String>> {
        self.store.set_last_run(&Utc::now().to_rfc3339()).await?;

        if !self.store.agent_enabled().await? {
            info!("Agent disabled, not rescheduling");
            return Ok(None);
        }
        // Two settles racing: check-before-create, with the queue's
        // pending-unique index as the structural backstop.
        if self.store.has_pending_scheduled().await? {
            return Ok(None);
        }
        let at = self.schedule_next_run().await?;
        Ok(Some(at))
    }

    async fn schedule_next_run(&self) -> Result<String> {
        let interval_hours = self.store.interval_hours().await?;
        let next = Utc::now() + ChronoDuration::hours(interval_hours);
        self.store
            .enqueue_scheduled(
                interval_hours * 3_600_000,
                self.config.max_attempts,
                self.config.max_stalled_count,
            )
            .await?;
        let rfc3339 = next.to_rfc3339();
        self.store.set_next_run(&rfc3339).await?;
        Ok(rfc3339)
    }

    /// Handle a manual trigger request from the web layer.
    pub async fn trigger_manual(&self, principal: &str) -> Result<TriggerOutcome> {
        if !self.store.agent_enabled().await? {
            return Ok(TriggerOutcome::Disabled);
        }

        let cooldown_key = format!("trigger:{principal}");
        if let Some(remaining_secs) = self
            .store
            .check_cooldown(&cooldown_key, self.config.trigger_cooldown_secs)
            .await?
        {
            return Ok(TriggerOutcome::CoolingDown { remaining_secs });
        }

        let job = self
            .store
            .enqueue_manual(self.config.max_attempts, self.config.max_stalled_count)
            .await?;
        self.events
            .info(format!("Manual run queued as {}", job.job_id));
        Ok(TriggerOutcome::Enqueued { job })
    }

    fn spawn_heartbeat(&self, seq: i64) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let lock_duration_ms = self.config.lock_duration_ms;
        tokio::spawn(async move {
            let mut progress = 10u8;
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if let Err(e) = store.renew_lock(seq, lock_duration_ms).await {
                    warn!("Lock renewal failed: {}", e);
                }
                if progress < HEARTBEAT_PROGRESS_CAP {
                    progress = (progress + HEARTBEAT_PROGRESS_STEP).min(HEARTBEAT_PROGRESS_CAP);
                    if let Err(e) = store.update_progress(seq, progress).await {
                        warn!("Progress update failed: {}", e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::CacheManager;
    use crate::core::pipeline::{ContentSource, DraftGenerator, Stage, StageError};
    use crate::core::store::test_store;
    use crate::core::store::types::JobState;
    use crate::core::trend::providers::{SearchHit, SearchProvider};
    use crate::core::trend::{Candidate, TrendRanker};
    use async_trait::async_trait;

    struct NoopSource;

    #[async_trait]
    impl ContentSource for NoopSource {
        async fn discover(&self) -> Result<Vec<Candidate>, StageError> {
            Ok(Vec::new())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl ContentSource for BrokenSource {
        async fn discover(&self) -> Result<Vec<Candidate>, StageError> {
            Err(StageError::new(Stage::Discover, "feed unreachable"))
        }
    }

    struct SilentProvider;

    #[async_trait]
    impl SearchProvider for SilentProvider {
        fn name(&self) -> &'static str {
            "silent"
        }

        async fn search(&self, _query: &str, _max_results: u8) -> Result<Vec<SearchHit>> {
            Ok(Vec::new())
        }
    }

    async fn worker_with(source: Arc<dyn ContentSource>) -> (Worker, Arc<Store>) {
        let store = Arc::new(test_store().await);
        let config = AgentConfig::for_tests(store.data_dir());
        let cache = Arc::new(CacheManager::new(Some(store.get_db())));
        let ranker = Arc::new(TrendRanker::new(
            &config,
            vec![Arc::new(SilentProvider) as Arc<dyn SearchProvider>],
            cache,
        ));
        let events = EventSink::new(64);
        let pipeline = Arc::new(Pipeline::new(
            &config,
            source,
            Arc::new(DraftGenerator),
            ranker,
            store.clone(),
            events.clone(),
        ));
        let worker = Worker::new(
            config,
            store.clone(),
            pipeline,
            events,
            CancellationToken::new(),
        );
        (worker, store)
    }

    async fn claim(store: &Store) -> JobRecord {
        store
            .claim_next(60_000)
            .await
            .unwrap()
            .expect("a claimable job")
    }

    #[tokio::test]
    async fn successful_settle_leaves_exactly_one_scheduled_job() {
        let (worker, store) = worker_with(Arc::new(NoopSource)).await;
        store.enqueue_manual(3, 2).await.unwrap();
        let job = claim(&store).await;

        worker.process(job).await;

        let counts = store.queue_counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.delayed + counts.waiting, 1);
        assert!(store.has_pending_scheduled().await.unwrap());
        assert!(store.next_run().await.unwrap().is_some());
        assert!(store.last_run().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_settle_still_reschedules() {
        let (worker, store) = worker_with(Arc::new(BrokenSource)).await;
        store.enqueue_manual(3, 2).await.unwrap();
        let job = claim(&store).await;

        worker.process(job).await;

        let counts = store.queue_counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert!(store.has_pending_scheduled().await.unwrap());

        // nextRun honors the configured interval.
        let next = store.next_run().await.unwrap().unwrap();
        let next = DateTime::parse_from_rfc3339(&next).unwrap().with_timezone(&Utc);
        let expected = Utc::now() + ChronoDuration::hours(6);
        assert!((expected - next).num_seconds().abs() < 10);

        let runs = store.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].result.success);
    }

    #[tokio::test]
    async fn settle_does_not_duplicate_an_existing_schedule() {
        let (worker, store) = worker_with(Arc::new(NoopSource)).await;
        store.enqueue_scheduled(3_600_000, 3, 2).await.unwrap();
        store.enqueue_manual(3, 2).await.unwrap();
        let job = claim(&store).await;

        worker.process(job).await;

        let pending = store.pending_jobs().await.unwrap();
        let scheduled: Vec<_> = pending
            .iter()
            .filter(|j| j.job_id == crate::core::store::SCHEDULED_JOB_ID)
            .collect();
        assert_eq!(scheduled.len(), 1);
    }

    #[tokio::test]
    async fn disabled_agent_settles_without_rescheduling() {
        let (worker, store) = worker_with(Arc::new(NoopSource)).await;
        store.set_agent_enabled(false).await.unwrap();
        store.enqueue_manual(3, 2).await.unwrap();
        let job = claim(&store).await;

        worker.process(job).await;

        assert!(!store.has_pending_scheduled().await.unwrap());
    }

    #[tokio::test]
    async fn reconcile_skips_when_disabled() {
        let (worker, store) = worker_with(Arc::new(NoopSource)).await;
        store.set_agent_enabled(false).await.unwrap();
        worker.reconcile().await.unwrap();
        assert!(!store.has_pending_scheduled().await.unwrap());
    }

    #[tokio::test]
    async fn reconcile_enqueues_catch_up_for_missed_run() {
        let (worker, store) = worker_with(Arc::new(NoopSource)).await;
        let past = (Utc::now() - ChronoDuration::hours(1)).to_rfc3339();
        store.set_next_run(&past).await.unwrap();
        // A stale delayed job from the previous process lifetime.
        store.enqueue_scheduled(7_200_000, 3, 2).await.unwrap();

        worker.reconcile().await.unwrap();

        let pending = store.pending_jobs().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, JobState::Waiting); // immediate
    }

    #[tokio::test]
    async fn reconcile_rederives_schedule_when_queue_was_lost() {
        let (worker, store) = worker_with(Arc::new(NoopSource)).await;
        let future = (Utc::now() + ChronoDuration::hours(2)).to_rfc3339();
        store.set_next_run(&future).await.unwrap();

        worker.reconcile().await.unwrap();

        assert!(store.has_pending_scheduled().await.unwrap());
        // nextRun was re-derived from the interval, not kept as-is.
        let next = store.next_run().await.unwrap().unwrap();
        assert_ne!(next, future);
    }

    #[tokio::test]
    async fn reconcile_trusts_an_intact_schedule() {
        let (worker, store) = worker_with(Arc::new(NoopSource)).await;
        let future = (Utc::now() + ChronoDuration::hours(2)).to_rfc3339();
        store.set_next_run(&future).await.unwrap();
        store.enqueue_scheduled(7_200_000, 3, 2).await.unwrap();

        worker.reconcile().await.unwrap();

        assert_eq!(store.next_run().await.unwrap().unwrap(), future);
        let counts = store.queue_counts().await.unwrap();
        assert_eq!(counts.delayed, 1);
    }

    #[tokio::test]
    async fn manual_trigger_respects_cooldown() {
        let (worker, store) = worker_with(Arc::new(NoopSource)).await;

        let first = worker.trigger_manual("admin").await.unwrap();
        assert!(matches!(first, TriggerOutcome::Enqueued { .. }));

        let second = worker.trigger_manual("admin").await.unwrap();
        match second {
            TriggerOutcome::CoolingDown { remaining_secs } => {
                assert!(remaining_secs > 0 && remaining_secs <= 30);
            }
            other => panic!("expected cooldown, got {other:?}"),
        }

        // No second job was enqueued.
        let counts = store.queue_counts().await.unwrap();
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn manual_trigger_refused_when_disabled() {
        let (worker, store) = worker_with(Arc::new(NoopSource)).await;
        store.set_agent_enabled(false).await.unwrap();
        let outcome = worker.trigger_manual("admin").await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Disabled));
    }
}
