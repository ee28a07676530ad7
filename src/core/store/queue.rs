use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};

use super::types::{JobRecord, JobState, QueueCounts};
use super::{Store, now_ms};

/// Deterministic id for the recurring run. At most one job with this id may
/// sit in `waiting`/`delayed` at any time; `enqueue_scheduled` removes the
/// old one first and a partial unique index backstops the invariant.
pub const SCHEDULED_JOB_ID: &str = "trendwire-scheduled-run";

/// The only job name the worker processes.
pub const JOB_NAME: &str = "scrape-and-publish";

const MANUAL_PRIORITY: i64 = 10;
const SCHEDULED_PRIORITY: i64 = 0;

fn map_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let state_str: String = row.get("state")?;
    Ok(JobRecord {
        seq: row.get("seq")?,
        job_id: row.get("job_id")?,
        name: row.get("name")?,
        priority: row.get("priority")?,
        state: JobState::parse(&state_str).unwrap_or(JobState::Failed),
        run_at_ms: row.get("run_at_ms")?,
        attempts_made: row.get("attempts_made")?,
        max_attempts: row.get("max_attempts")?,
        stall_count: row.get("stall_count")?,
        max_stalled: row.get("max_stalled")?,
        progress: row.get::<_, i64>("progress")?.clamp(0, 100) as u8,
        lock_expires_at_ms: row.get("lock_expires_at_ms")?,
        error: row.get("error")?,
        created_at_ms: row.get("created_at_ms")?,
        finished_at_ms: row.get("finished_at_ms")?,
    })
}

const JOB_COLUMNS: &str = "seq, job_id, name, priority, state, run_at_ms, attempts_made, \
     max_attempts, stall_count, max_stalled, progress, lock_expires_at_ms, error, \
     created_at_ms, finished_at_ms";

impl Store {
    /// Enqueue the recurring run, `delay_ms` in the future. Any previously
    /// pending scheduled job is removed in the same transaction so the
    /// queue never holds two.
    pub async fn enqueue_scheduled(
        &self,
        delay_ms: i64,
        max_attempts: u32,
        max_stalled: u32,
    ) -> Result<JobRecord> {
        let mut db = self.db.lock().await;
        let now = now_ms();
        let run_at = now + delay_ms.max(0);
        let state = if delay_ms > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM jobs WHERE job_id = ?1 AND state IN ('waiting', 'delayed')",
            params![SCHEDULED_JOB_ID],
        )?;
        tx.execute(
            "INSERT INTO jobs (job_id, name, priority, state, run_at_ms, max_attempts, \
             max_stalled, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                SCHEDULED_JOB_ID,
                JOB_NAME,
                SCHEDULED_PRIORITY,
                state.as_str(),
                run_at,
                max_attempts,
                max_stalled,
                now
            ],
        )?;
        let seq = tx.last_insert_rowid();
        let job = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE seq = ?1"),
            params![seq],
            map_job,
        )?;
        tx.commit()?;
        Ok(job)
    }

    /// Enqueue an immediate manual run with a unique timestamped id and
    /// higher priority than scheduled runs.
    pub async fn enqueue_manual(&self, max_attempts: u32, max_stalled: u32) -> Result<JobRecord> {
        let db = self.db.lock().await;
        let now = now_ms();
        let job_id = format!("manual-{}-{}", now, uuid::Uuid::new_v4());
        db.execute(
            "INSERT INTO jobs (job_id, name, priority, state, run_at_ms, max_attempts, \
             max_stalled, created_at_ms) VALUES (?1, ?2, ?3, 'waiting', ?4, ?5, ?6, ?4)",
            params![job_id, JOB_NAME, MANUAL_PRIORITY, now, max_attempts, max_stalled],
        )?;
        let seq = db.last_insert_rowid();
        let job = db.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE seq = ?1"),
            params![seq],
            map_job,
        )?;
        Ok(job)
    }

    pub async fn has_pending_scheduled(&self) -> Result<bool> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM jobs WHERE job_id = ?1 AND state IN ('waiting', 'delayed')",
            params![SCHEDULED_JOB_ID],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Drop any pending scheduled job (used when reconciling a missed run).
    pub async fn remove_pending_scheduled(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let removed = db.execute(
            "DELETE FROM jobs WHERE job_id = ?1 AND state IN ('waiting', 'delayed')",
            params![SCHEDULED_JOB_ID],
        )?;
        Ok(removed)
    }

    /// Atomically promote the best runnable job to `active` and take its
    /// lock. Returns None while another job is active (concurrency is 1)
    /// or nothing is due.
    pub async fn claim_next(&self, lock_duration_ms: i64) -> Result<Option<JobRecord>> {
        let mut db = self.db.lock().await;
        let now = now_ms();

        let tx = db.transaction()?;
        let active: i64 =
            tx.query_row("SELECT COUNT(*) FROM jobs WHERE state = 'active'", [], |r| {
                r.get(0)
            })?;
        if active > 0 {
            return Ok(None);
        }

        let candidate = tx
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE state = 'waiting' OR (state = 'delayed' AND run_at_ms <= ?1) \
                     ORDER BY priority DESC, run_at_ms ASC, seq ASC LIMIT 1"
                ),
                params![now],
                map_job,
            )
            .optional()?;

        let Some(mut job) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET state = 'active', attempts_made = attempts_made + 1, \
             lock_expires_at_ms = ?2, progress = 0 WHERE seq = ?1",
            params![job.seq, now + lock_duration_ms],
        )?;
        tx.commit()?;

        job.state = JobState::Active;
        job.attempts_made += 1;
        job.lock_expires_at_ms = Some(now + lock_duration_ms);
        job.progress = 0;
        Ok(Some(job))
    }

    /// Extend an active job's lock. A no-op if the job already left `active`.
    pub async fn renew_lock(&self, seq: i64, lock_duration_ms: i64) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE jobs SET lock_expires_at_ms = ?2 WHERE seq = ?1 AND state = 'active'",
            params![seq, now_ms() + lock_duration_ms],
        )?;
        Ok(())
    }

    pub async fn update_progress(&self, seq: i64, progress: u8) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE jobs SET progress = ?2 WHERE seq = ?1 AND state = 'active'",
            params![seq, progress.min(100) as i64],
        )?;
        Ok(())
    }

    pub async fn complete_job(&self, seq: i64, result_json: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE jobs SET state = 'completed', progress = 100, result_json = ?2, \
             lock_expires_at_ms = NULL, finished_at_ms = ?3 WHERE seq = ?1",
            params![seq, result_json, now_ms()],
        )?;
        Ok(())
    }

    pub async fn fail_job(&self, seq: i64, error: &str, result_json: Option<&str>) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE jobs SET state = 'failed', error = ?2, result_json = ?3, \
             lock_expires_at_ms = NULL, finished_at_ms = ?4 WHERE seq = ?1",
            params![seq, error, result_json, now_ms()],
        )?;
        Ok(())
    }

    /// Watchdog pass: any active job whose lock expired is presumed dead.
    /// It is requeued to `waiting` while it has stalls left, otherwise
    /// failed. A stalled scheduled job that already has a pending twin is
    /// failed as superseded rather than requeued, so the pending-unique
    /// invariant holds. Returns (requeued, failed).
    pub async fn requeue_stalled(&self) -> Result<(usize, usize)> {
        let mut db = self.db.lock().await;
        let now = now_ms();

        let tx = db.transaction()?;
        tx.execute(
            "UPDATE jobs SET state = 'stalled', stall_count = stall_count + 1, \
             lock_expires_at_ms = NULL \
             WHERE state = 'active' AND lock_expires_at_ms IS NOT NULL \
             AND lock_expires_at_ms < ?1",
            params![now],
        )?;
        let requeued = tx.execute(
            "UPDATE jobs SET state = 'waiting' \
             WHERE state = 'stalled' AND stall_count <= max_stalled \
             AND NOT EXISTS (SELECT 1 FROM jobs twin WHERE twin.job_id = jobs.job_id \
                             AND twin.state IN ('waiting', 'delayed'))",
            [],
        )?;
        let failed = tx.execute(
            "UPDATE jobs SET state = 'failed', finished_at_ms = ?1, \
             error = COALESCE(error, 'job stalled and exceeded max stall count') \
             WHERE state = 'stalled'",
            params![now],
        )?;
        tx.commit()?;
        Ok((requeued, failed))
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let (state, n) = row?;
            match state.as_str() {
                "waiting" => counts.waiting = n,
                "delayed" => counts.delayed = n,
                "active" => counts.active = n,
                "completed" => counts.completed = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Jobs that have not settled yet, soonest first.
    pub async fn pending_jobs(&self) -> Result<Vec<JobRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE state IN ('waiting', 'delayed', 'active') \
             ORDER BY run_at_ms ASC"
        ))?;
        let rows = stmt.query_map([], map_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Most recent row for a job id (any state).
    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let db = self.db.lock().await;
        let job = db
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1 \
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![job_id],
                map_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Cooldown gate for manual triggers. Returns `Some(remaining_seconds)`
    /// while the window is active; otherwise arms the window and returns
    /// None. Check and arm happen under the connection lock, so two
    /// concurrent triggers cannot both pass.
    pub async fn check_cooldown(&self, key: &str, window_secs: i64) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        let now = now_ms();
        let existing: Option<i64> = db
            .query_row(
                "SELECT expires_at_ms FROM cooldowns WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(expires) = existing
            && expires > now
        {
            return Ok(Some(((expires - now) + 999) / 1000));
        }

        db.execute(
            "INSERT OR REPLACE INTO cooldowns (key, expires_at_ms) VALUES (?1, ?2)",
            params![key, now + window_secs * 1000],
        )?;
        Ok(None)
    }
}
