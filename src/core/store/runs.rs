use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::types::{ArticleDraft, RunRecord, RunResult, RunStats};
use super::{Store, now_ms};
use crate::core::events::AgentEvent;

/// Replay buffer depth for the admin log endpoint.
const EVENT_BUFFER_MAX: i64 = 100;

impl Store {
    pub async fn record_run(
        &self,
        result: &RunResult,
        started_at_ms: i64,
        finished_at_ms: i64,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO run_log (articles_scraped, articles_created, duration_seconds, \
             success, errors_json, started_at_ms, finished_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                result.articles_scraped,
                result.articles_created,
                result.duration_seconds,
                result.success as i64,
                serde_json::to_string(&result.errors)?,
                started_at_ms,
                finished_at_ms
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, articles_scraped, articles_created, duration_seconds, success, \
             errors_json, started_at_ms, finished_at_ms \
             FROM run_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let errors_json: String = row.get(5)?;
            Ok(RunRecord {
                id: row.get(0)?,
                result: RunResult {
                    articles_scraped: row.get(1)?,
                    articles_created: row.get(2)?,
                    duration_seconds: row.get(3)?,
                    success: row.get::<_, i64>(4)? != 0,
                    errors: serde_json::from_str(&errors_json).unwrap_or_default(),
                },
                started_at_ms: row.get(6)?,
                finished_at_ms: row.get(7)?,
            })
        })?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    pub async fn run_stats(&self) -> Result<RunStats> {
        let db = self.db.lock().await;
        let (total, successful): (i64, i64) = db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM run_log",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let last: Option<(i64, i64)> = db
            .query_row(
                "SELECT finished_at_ms, success FROM run_log ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(RunStats {
            total_executions: total,
            successful_executions: successful,
            success_rate_pct: if total > 0 {
                (successful * 100) / total
            } else {
                0
            },
            last_finished_at_ms: last.map(|(ts, _)| ts),
            last_success: last.map(|(_, ok)| ok != 0),
        })
    }

    /// Append an event to the replay buffer, trimming the oldest rows past
    /// the cap in the same transaction.
    pub async fn push_event(&self, event: &AgentEvent) -> Result<()> {
        let mut db = self.db.lock().await;
        let payload = serde_json::to_string(event)?;

        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO event_buffer (payload_json, created_at_ms) VALUES (?1, ?2)",
            params![payload, now_ms()],
        )?;
        tx.execute(
            "DELETE FROM event_buffer WHERE id <= (
                SELECT id FROM event_buffer ORDER BY id DESC LIMIT 1 OFFSET ?1
            )",
            params![EVENT_BUFFER_MAX],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Buffered events, oldest first.
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<AgentEvent>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT payload_json FROM (
                SELECT id, payload_json FROM event_buffer ORDER BY id DESC LIMIT ?1
            ) ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for row in rows {
            if let Ok(event) = serde_json::from_str(&row?) {
                events.push(event);
            }
        }
        Ok(events)
    }

    pub async fn has_article_hash(&self, content_hash: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM published_articles WHERE content_hash = ?1",
            params![content_hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Persist a draft. Returns false without error when the slug or
    /// content hash already exists, so a duplicate is a skip, not a
    /// failed run.
    pub async fn insert_article(&self, draft: &ArticleDraft, run_id: Option<i64>) -> Result<bool> {
        let db = self.db.lock().await;
        let inserted = db.execute(
            "INSERT OR IGNORE INTO published_articles \
             (id, slug, title, body, content_hash, trend_score, run_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                uuid::Uuid::new_v4().to_string(),
                draft.slug,
                draft.title,
                draft.body,
                draft.content_hash,
                draft.trend_score,
                run_id,
                now_ms()
            ],
        )?;
        Ok(inserted > 0)
    }

    pub async fn article_count(&self) -> Result<i64> {
        let db = self.db.lock().await;
        let count: i64 =
            db.query_row("SELECT COUNT(*) FROM published_articles", [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::EventLevel;
    use crate::core::store::test_store;

    fn draft(slug: &str, hash: &str) -> ArticleDraft {
        ArticleDraft {
            slug: slug.to_string(),
            title: slug.to_string(),
            body: "body".to_string(),
            content_hash: hash.to_string(),
            trend_score: 50.0,
        }
    }

    #[tokio::test]
    async fn run_log_round_trips_and_aggregates() {
        let store = test_store().await;
        let ok = RunResult {
            articles_scraped: 5,
            articles_created: 2,
            duration_seconds: 1.5,
            success: true,
            errors: vec![],
        };
        let bad = RunResult::failed("feed unreachable", 0.2);
        store.record_run(&ok, 1000, 2500).await.unwrap();
        store.record_run(&bad, 3000, 3200).await.unwrap();

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(!runs[0].result.success); // newest first
        assert_eq!(runs[0].result.errors, vec!["feed unreachable".to_string()]);
        assert_eq!(runs[1].result.articles_created, 2);

        let stats = store.run_stats().await.unwrap();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.success_rate_pct, 50);
        assert_eq!(stats.last_success, Some(false));
    }

    #[tokio::test]
    async fn stats_on_empty_log() {
        let store = test_store().await;
        let stats = store.run_stats().await.unwrap();
        assert_eq!(stats.total_executions, 0);
        assert_eq!(stats.success_rate_pct, 0);
        assert!(stats.last_finished_at_ms.is_none());
    }

    #[tokio::test]
    async fn event_buffer_trims_to_cap() {
        let store = test_store().await;
        for i in 0..120 {
            let event = AgentEvent::new(EventLevel::Info, format!("event {i}"));
            store.push_event(&event).await.unwrap();
        }
        let events = store.recent_events(200).await.unwrap();
        assert_eq!(events.len(), 100);
        assert_eq!(events[0].message, "event 20"); // oldest surviving
        assert_eq!(events[99].message, "event 119");
    }

    #[tokio::test]
    async fn duplicate_article_hash_is_a_skip() {
        let store = test_store().await;
        assert!(store.insert_article(&draft("a", "h1"), None).await.unwrap());
        assert!(!store.insert_article(&draft("b", "h1"), None).await.unwrap());
        assert!(store.has_article_hash("h1").await.unwrap());
        assert!(!store.has_article_hash("h2").await.unwrap());
        assert_eq!(store.article_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_slug_is_a_skip() {
        let store = test_store().await;
        assert!(store.insert_article(&draft("a", "h1"), None).await.unwrap());
        assert!(!store.insert_article(&draft("a", "h2"), None).await.unwrap());
    }
}
