use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::types::SettingsSnapshot;
use super::{Store, now_ms};

pub const KEY_ENABLED: &str = "agent.enabled";
pub const KEY_INTERVAL_HOURS: &str = "agent.intervalHours";
pub const KEY_LAST_RUN: &str = "agent.lastRun";
pub const KEY_NEXT_RUN: &str = "agent.nextRun";

const DEFAULT_INTERVAL_HOURS: i64 = 6;
const MIN_INTERVAL_HOURS: i64 = 1;
const MAX_INTERVAL_HOURS: i64 = 24;

impl Store {
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let value = db
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO settings (key, value, updated_at_ms) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
             updated_at_ms = excluded.updated_at_ms",
            params![key, value, now_ms()],
        )?;
        Ok(())
    }

    /// Defaults to enabled: only an explicit "false" turns the agent off,
    /// so a missing or garbled row never silently disables it.
    pub async fn agent_enabled(&self) -> Result<bool> {
        Ok(self.get_setting(KEY_ENABLED).await?.as_deref() != Some("false"))
    }

    pub async fn set_agent_enabled(&self, enabled: bool) -> Result<()> {
        self.set_setting(KEY_ENABLED, if enabled { "true" } else { "false" })
            .await
    }

    /// Interval between scheduled runs, clamped to a sane range. Unparseable
    /// rows fall back to the default rather than erroring.
    pub async fn interval_hours(&self) -> Result<i64> {
        let raw = self.get_setting(KEY_INTERVAL_HOURS).await?;
        let hours = raw
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_INTERVAL_HOURS);
        Ok(hours.clamp(MIN_INTERVAL_HOURS, MAX_INTERVAL_HOURS))
    }

    pub async fn set_interval_hours(&self, hours: i64) -> Result<i64> {
        let clamped = hours.clamp(MIN_INTERVAL_HOURS, MAX_INTERVAL_HOURS);
        self.set_setting(KEY_INTERVAL_HOURS, &clamped.to_string())
            .await?;
        Ok(clamped)
    }

    pub async fn last_run(&self) -> Result<Option<String>> {
        self.get_setting(KEY_LAST_RUN).await
    }

    pub async fn set_last_run(&self, rfc3339: &str) -> Result<()> {
        self.set_setting(KEY_LAST_RUN, rfc3339).await
    }

    pub async fn next_run(&self) -> Result<Option<String>> {
        self.get_setting(KEY_NEXT_RUN).await
    }

    pub async fn set_next_run(&self, rfc3339: &str) -> Result<()> {
        self.set_setting(KEY_NEXT_RUN, rfc3339).await
    }

    pub async fn settings_snapshot(&self) -> Result<SettingsSnapshot> {
        Ok(SettingsSnapshot {
            enabled: self.agent_enabled().await?,
            interval_hours: self.interval_hours().await?,
            last_run: self.last_run().await?,
            next_run: self.next_run().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;

    #[tokio::test]
    async fn enabled_defaults_to_true() {
        let store = test_store().await;
        assert!(store.agent_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn garbage_enabled_value_stays_enabled() {
        let store = test_store().await;
        store.set_setting(KEY_ENABLED, "maybe").await.unwrap();
        assert!(store.agent_enabled().await.unwrap());
        store.set_agent_enabled(false).await.unwrap();
        assert!(!store.agent_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn interval_is_clamped_and_defaulted() {
        let store = test_store().await;
        assert_eq!(store.interval_hours().await.unwrap(), 6);

        store.set_setting(KEY_INTERVAL_HOURS, "not a number").await.unwrap();
        assert_eq!(store.interval_hours().await.unwrap(), 6);

        assert_eq!(store.set_interval_hours(0).await.unwrap(), 1);
        assert_eq!(store.interval_hours().await.unwrap(), 1);

        store.set_setting(KEY_INTERVAL_HOURS, "9999").await.unwrap();
        assert_eq!(store.interval_hours().await.unwrap(), 24);
    }

    #[tokio::test]
    async fn set_setting_upserts() {
        let store = test_store().await;
        store.set_setting("k", "v1").await.unwrap();
        store.set_setting("k", "v2").await.unwrap();
        assert_eq!(store.get_setting("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn snapshot_reflects_rows() {
        let store = test_store().await;
        store.set_agent_enabled(false).await.unwrap();
        store.set_interval_hours(3).await.unwrap();
        store.set_next_run("2026-08-23T12:00:00+00:00").await.unwrap();

        let snap = store.settings_snapshot().await.unwrap();
        assert!(!snap.enabled);
        assert_eq!(snap.interval_hours, 3);
        assert!(snap.last_run.is_none());
        assert_eq!(snap.next_run.as_deref(), Some("2026-08-23T12:00:00+00:00"));
    }
}
