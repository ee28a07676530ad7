use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::core::store::now_ms;

/// Tier-1 entries live at most this long regardless of the requested TTL.
const L1_TTL: Duration = Duration::from_secs(30);
const L1_MAX_ENTRIES: usize = 1000;

/// Counter snapshot returned by the cache stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub evictions: u64,
    pub errors: u64,
    pub l2_available: bool,
}

struct L1Entry {
    value: String,
    expires_at_ms: i64,
    tags: Vec<String>,
}

#[derive(Default)]
struct L1Cache {
    entries: HashMap<String, L1Entry>,
    // Insertion order for FIFO eviction. May hold keys already removed
    // from the map; those are skipped when popped.
    order: VecDeque<String>,
}

/// Two-tier cache: a small in-process map in front of the store's cache
/// tables. The second tier is optional; when it is absent or errors, the
/// cache degrades to tier 1 only and keeps serving.
pub struct CacheManager {
    l1: Mutex<L1Cache>,
    l2: Option<Arc<Mutex<Connection>>>,
    stats: Mutex<CacheStats>,
}

impl CacheManager {
    pub fn new(l2: Option<Arc<Mutex<Connection>>>) -> Self {
        Self {
            l1: Mutex::new(L1Cache::default()),
            l2,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = now_ms();

        {
            let mut l1 = self.l1.lock().await;
            match l1.entries.get(key) {
                Some(entry) if entry.expires_at_ms > now => {
                    let value = serde_json::from_str(&entry.value).ok();
                    let mut stats = self.stats.lock().await;
                    stats.hits += 1;
                    stats.l1_hits += 1;
                    return value;
                }
                Some(_) => {
                    l1.entries.remove(key);
                }
                None => {}
            }
        }

        if let Some(raw) = self.l2_get(key, now).await {
            // Backfill tier 1 so repeat reads stay in-process. The tags stay
            // in the tier-2 table; tag invalidation sweeps backfilled keys
            // through the tier-2 lookup.
            self.l1_put(key, raw.clone(), now + L1_TTL.as_millis() as i64, &[])
                .await;
            let mut stats = self.stats.lock().await;
            stats.hits += 1;
            stats.l2_hits += 1;
            return serde_json::from_str(&raw).ok();
        }

        self.stats.lock().await.misses += 1;
        None
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, tags: &[&str]) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cache serialization failed for {}: {}", key, e);
                self.stats.lock().await.errors += 1;
                return;
            }
        };

        let now = now_ms();
        let l1_expiry = now + ttl.min(L1_TTL).as_millis() as i64;
        self.l1_put(key, raw.clone(), l1_expiry, tags).await;

        if let Some(db) = &self.l2 {
            let expires = now + ttl.as_millis() as i64;
            let db = db.lock().await;
            let result: rusqlite::Result<()> = (|| {
                // Opportunistic sweep of dead rows; reads also delete lazily.
                db.execute(
                    "DELETE FROM cache_entries WHERE expires_at_ms < ?1",
                    params![now],
                )?;
                db.execute(
                    "INSERT OR REPLACE INTO cache_entries (key, value, expires_at_ms) \
                     VALUES (?1, ?2, ?3)",
                    params![key, raw, expires],
                )?;
                for tag in tags {
                    db.execute(
                        "INSERT OR IGNORE INTO cache_tags (tag, key) VALUES (?1, ?2)",
                        params![tag, key],
                    )?;
                }
                Ok(())
            })();
            if let Err(e) = result {
                warn!("Cache tier-2 write failed for {}: {}", key, e);
                self.stats.lock().await.errors += 1;
            }
        }
    }

    /// Remove every entry carrying `tag` from both tiers. Tier 1 is swept
    /// by its own stored tags first, so tagged entries go away even when
    /// tier 2 is absent or its mirror write failed.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut removed: std::collections::HashSet<String> = {
            let mut l1 = self.l1.lock().await;
            let doomed: Vec<String> = l1
                .entries
                .iter()
                .filter(|(_, entry)| entry.tags.iter().any(|t| t == tag))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &doomed {
                l1.entries.remove(key);
            }
            doomed.into_iter().collect()
        };

        let Some(db) = &self.l2 else {
            return removed.len();
        };

        let keys: Vec<String> = {
            let db = db.lock().await;
            let result: rusqlite::Result<Vec<String>> = (|| {
                let mut stmt = db.prepare("SELECT key FROM cache_tags WHERE tag = ?1")?;
                let rows = stmt.query_map(params![tag], |row| row.get(0))?;
                rows.collect()
            })();
            match result {
                Ok(keys) => keys,
                Err(e) => {
                    warn!("Cache tag lookup failed for {}: {}", tag, e);
                    self.stats.lock().await.errors += 1;
                    return removed.len();
                }
            }
        };

        {
            let mut l1 = self.l1.lock().await;
            for key in &keys {
                l1.entries.remove(key);
            }
        }
        {
            let db = db.lock().await;
            for key in &keys {
                let _ = db.execute("DELETE FROM cache_entries WHERE key = ?1", params![key]);
            }
            let _ = db.execute("DELETE FROM cache_tags WHERE tag = ?1", params![tag]);
        }
        removed.extend(keys);
        removed.len()
    }

    /// Remove every entry whose key starts with `prefix` from both tiers.
    pub async fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut removed = {
            let mut l1 = self.l1.lock().await;
            let before = l1.entries.len();
            l1.entries.retain(|key, _| !key.starts_with(prefix));
            before - l1.entries.len()
        };

        if let Some(db) = &self.l2 {
            let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
            // The statement borrows end with this block; stats are updated
            // after so the future stays Send.
            let result = {
                let db = db.lock().await;
                let deleted = db.execute(
                    "DELETE FROM cache_entries WHERE key LIKE ?1 ESCAPE '\\'",
                    params![pattern],
                );
                if deleted.is_ok() {
                    let _ = db.execute(
                        "DELETE FROM cache_tags WHERE key LIKE ?1 ESCAPE '\\'",
                        params![pattern],
                    );
                }
                deleted
            };
            match result {
                Ok(n) => removed = removed.max(n),
                Err(e) => {
                    warn!("Cache prefix invalidation failed for {}: {}", prefix, e);
                    self.stats.lock().await.errors += 1;
                }
            }
        }
        removed
    }

    pub async fn clear_all(&self) {
        {
            let mut l1 = self.l1.lock().await;
            l1.entries.clear();
            l1.order.clear();
        }
        if let Some(db) = &self.l2 {
            let db = db.lock().await;
            let result = db
                .execute("DELETE FROM cache_entries", [])
                .and_then(|_| db.execute("DELETE FROM cache_tags", []));
            if let Err(e) = result {
                warn!("Cache tier-2 clear failed: {}", e);
                drop(db);
                self.stats.lock().await.errors += 1;
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let mut snapshot = self.stats.lock().await.clone();
        snapshot.l2_available = self.l2.is_some();
        snapshot
    }

    pub async fn reset_stats(&self) {
        *self.stats.lock().await = CacheStats::default();
    }

    async fn l1_put(&self, key: &str, value: String, expires_at_ms: i64, tags: &[&str]) {
        let mut l1 = self.l1.lock().await;
        let mut evicted = 0u64;
        while l1.entries.len() >= L1_MAX_ENTRIES {
            let Some(oldest) = l1.order.pop_front() else {
                break;
            };
            if l1.entries.remove(&oldest).is_some() {
                evicted += 1;
            }
        }
        let entry = L1Entry {
            value,
            expires_at_ms,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };
        if l1.entries.insert(key.to_string(), entry).is_none() {
            l1.order.push_back(key.to_string());
        }
        drop(l1);
        if evicted > 0 {
            self.stats.lock().await.evictions += evicted;
        }
    }

    async fn l2_get(&self, key: &str, now: i64) -> Option<String> {
        let db = self.l2.as_ref()?;
        let db = db.lock().await;
        let row: rusqlite::Result<Option<(String, i64)>> = db
            .query_row(
                "SELECT value, expires_at_ms FROM cache_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional();

        match row {
            Ok(Some((value, expires))) if expires > now => Some(value),
            Ok(Some(_)) => {
                let _ = db.execute("DELETE FROM cache_entries WHERE key = ?1", params![key]);
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Cache tier-2 read failed for {}: {}", key, e);
                drop(db);
                // Degrades to a miss; the read path never errors out.
                self.stats.lock().await.errors += 1;
                None
            }
        }
    }
}
