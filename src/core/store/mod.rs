mod queue;
mod runs;
mod settings;
pub mod types;

pub use queue::SCHEDULED_JOB_ID;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Durable state backing the agent: settings rows, the job queue, the run
/// log, the published-article index, the event replay buffer, and the
/// tier-2 cache tables. One SQLite connection behind a mutex; the single
/// worker process is the only writer.
pub struct Store {
    db: Arc<Mutex<Connection>>,
    data_dir: PathBuf,
}

impl Store {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).await?;
        }

        let db_path = data_dir.join("agent.db");
        let db = Connection::open(&db_path)
            .with_context(|| format!("open store at {}", db_path.display()))?;
        init_schema(&db)?;

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            data_dir,
        })
    }

    /// Startup helper: keep retrying `open` with a fixed backoff. The worker
    /// is useless without durable state, so exhausting the retries is fatal
    /// to the process.
    pub async fn open_with_retry<P: AsRef<Path>>(
        data_dir: P,
        max_retries: u32,
        delay: std::time::Duration,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let mut last_err = None;
        for attempt in 1..=max_retries.max(1) {
            info!("Store connection attempt {}/{}", attempt, max_retries.max(1));
            match Self::open(data_dir).await {
                Ok(store) => match store.ping().await {
                    Ok(()) => return Ok(store),
                    Err(e) => last_err = Some(e),
                },
                Err(e) => last_err = Some(e),
            }
            if attempt < max_retries {
                warn!("Store not ready, retrying in {:?}...", delay);
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("store unavailable")))
            .context("store unreachable after all retries")
    }

    /// Cheap liveness check used at startup and by the trigger endpoint.
    pub async fn ping(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    pub fn get_db(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn init_schema(db: &Connection) -> Result<()> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS jobs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            name TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL,
            run_at_ms INTEGER NOT NULL,
            attempts_made INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            stall_count INTEGER NOT NULL DEFAULT 0,
            max_stalled INTEGER NOT NULL DEFAULT 2,
            progress INTEGER NOT NULL DEFAULT 0,
            lock_expires_at_ms INTEGER,
            result_json TEXT,
            error TEXT,
            created_at_ms INTEGER NOT NULL,
            finished_at_ms INTEGER
        )",
        [],
    )?;

    // Structural guard: at most one pending job per job_id. This is what
    // makes the deterministic scheduled id race-proof even if two settle
    // paths pass the check-before-create at the same time.
    db.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_pending_unique
         ON jobs(job_id) WHERE state IN ('waiting', 'delayed')",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_state_runat ON jobs(state, run_at_ms)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS cooldowns (
            key TEXT PRIMARY KEY,
            expires_at_ms INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS run_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            articles_scraped INTEGER NOT NULL,
            articles_created INTEGER NOT NULL,
            duration_seconds REAL NOT NULL,
            success INTEGER NOT NULL,
            errors_json TEXT NOT NULL,
            started_at_ms INTEGER NOT NULL,
            finished_at_ms INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS published_articles (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            content_hash TEXT NOT NULL UNIQUE,
            trend_score REAL NOT NULL DEFAULT 0,
            run_id INTEGER,
            created_at_ms INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS event_buffer (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL
        )",
        [],
    )?;
    db.execute(
        "CREATE TABLE IF NOT EXISTS cache_tags (
            tag TEXT NOT NULL,
            key TEXT NOT NULL,
            PRIMARY KEY (tag, key)
        )",
        [],
    )?;

    Ok(())
}

/// Create a Store in a fresh temp directory for tests.
#[cfg(test)]
pub async fn test_store() -> Store {
    let tmpdir = std::env::temp_dir().join(format!("trendwire-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&tmpdir).expect("create temp dir");
    Store::open(&tmpdir).await.expect("open test store")
}
