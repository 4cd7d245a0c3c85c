//! Single-flight classification cache with TTL.
//!
//! [`ClassificationCache::get_or_compute`] guarantees that at most one
//! classification runs per [`Fingerprint`] at a time. Concurrent callers
//! for the same fingerprint wait on the same computation and receive the
//! same result.
//!
//! # Design
//!
//! The table maps each fingerprint to a slot holding a
//! `tokio::sync::OnceCell`. The table itself sits behind one short-lived
//! `std::sync::Mutex` that is never held across an `.await`:
//!
//! ```text
//!  lock table ─▶ slot missing or expired? insert fresh slot ─▶ clone Arc<Slot> ─▶ unlock
//!                                                                    │
//!                  slot.cell.get_or_try_init(durable lookup → compute → durable store)
//! ```
//!
//! A failed computation leaves the cell empty, so nothing is cached and the
//! next caller (or the next run) tries again.
//!
//! An optional [`CacheBackend`] adds a durable tier. It is consulted inside
//! the single-flight section before computing, and written with
//! set-if-absent afterwards; if another process stored a value first, that
//! value wins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prism_core::models::ClassificationResult;
use prism_core::Fingerprint;
use sqlx::SqlitePool;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::error::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════
// Durable tier
// ═══════════════════════════════════════════════════════════════════════

/// A result read from a [`CacheBackend`], with its wall-clock expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub result: ClassificationResult,
    pub expires_at: DateTime<Utc>,
}

/// Persistent storage for cached classifications.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Unexpired entry for `fingerprint`, if any.
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<StoredEntry>>;

    /// Store `entry` unless an unexpired one exists. Returns whichever
    /// entry is stored afterwards.
    async fn set_if_absent(&self, fingerprint: &Fingerprint, entry: &StoredEntry) -> Result<StoredEntry>;

    async fn remove(&self, fingerprint: &Fingerprint) -> Result<()>;

    /// Delete expired entries; returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

/// [`CacheBackend`] over the `classification_cache` table.
pub struct SqliteCacheBackend {
    pool: SqlitePool,
}

impl SqliteCacheBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn decode_entry(json: &str, expires_at_ms: i64) -> Result<StoredEntry> {
    let result: ClassificationResult =
        serde_json::from_str(json).map_err(|e| Error::Storage(format!("corrupt cache entry: {}", e)))?;
    let expires_at = DateTime::from_timestamp_millis(expires_at_ms)
        .ok_or_else(|| Error::Storage(format!("invalid cache expiry {}", expires_at_ms)))?;
    Ok(StoredEntry { result, expires_at })
}

#[async_trait]
impl CacheBackend for SqliteCacheBackend {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<StoredEntry>> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT result_json, expires_at FROM classification_cache WHERE fingerprint = ? AND expires_at > ?",
        )
        .bind(fingerprint.as_str())
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(json, expires_at)| decode_entry(&json, expires_at)).transpose()
    }

    async fn set_if_absent(&self, fingerprint: &Fingerprint, entry: &StoredEntry) -> Result<StoredEntry> {
        let json = serde_json::to_string(&entry.result).map_err(|e| Error::Storage(e.to_string()))?;
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO classification_cache (fingerprint, result_json, created_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                result_json = excluded.result_json,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            WHERE classification_cache.expires_at <= excluded.created_at
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(&json)
        .bind(now)
        .bind(entry.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let (stored_json, expires_at): (String, i64) = sqlx::query_as(
            "SELECT result_json, expires_at FROM classification_cache WHERE fingerprint = ?",
        )
        .bind(fingerprint.as_str())
        .fetch_one(&self.pool)
        .await?;
        decode_entry(&stored_json, expires_at)
    }

    async fn remove(&self, fingerprint: &Fingerprint) -> Result<()> {
        sqlx::query("DELETE FROM classification_cache WHERE fingerprint = ?")
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM classification_cache WHERE expires_at <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// In-process single-flight table
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Cached {
    result: ClassificationResult,
    expires_at: Instant,
}

#[derive(Default)]
struct Slot {
    cell: OnceCell<Cached>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.cell.get().is_some_and(|c| c.expires_at <= now)
    }
}

pub struct ClassificationCache {
    slots: Mutex<HashMap<Fingerprint, Arc<Slot>>>,
    ttl: Duration,
    backend: Option<Arc<dyn CacheBackend>>,
}

impl ClassificationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slot(&self, fingerprint: &Fingerprint) -> Arc<Slot> {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(fingerprint) {
            Some(slot) if !slot.is_expired(now) => slot.clone(),
            _ => {
                let slot = Arc::new(Slot::default());
                slots.insert(fingerprint.clone(), slot.clone());
                slot
            }
        }
    }

    /// Return the cached result for `fingerprint`, computing it at most
    /// once across concurrent callers.
    ///
    /// Errors from `compute` are returned to the caller that ran it and
    /// are not cached.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        fingerprint: &Fingerprint,
        compute: F,
    ) -> std::result::Result<ClassificationResult, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<ClassificationResult, E>>,
    {
        let slot = self.slot(fingerprint);
        let cached = slot
            .cell
            .get_or_try_init(|| async {
                if let Some(hit) = self.durable_get(fingerprint).await {
                    tracing::debug!(fingerprint = fingerprint.short(), "durable cache hit");
                    return Ok(hit);
                }
                tracing::debug!(fingerprint = fingerprint.short(), "cache miss; classifying");
                let result = compute().await?;
                Ok(self.durable_put(fingerprint, result).await)
            })
            .await?;
        Ok(cached.result.clone())
    }

    async fn durable_get(&self, fingerprint: &Fingerprint) -> Option<Cached> {
        let backend = self.backend.as_ref()?;
        match backend.get(fingerprint).await {
            Ok(Some(entry)) => Some(self.to_cached(entry)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(fingerprint = fingerprint.short(), error = %e, "durable cache read failed");
                None
            }
        }
    }

    async fn durable_put(&self, fingerprint: &Fingerprint, result: ClassificationResult) -> Cached {
        let Some(backend) = &self.backend else {
            return Cached {
                result,
                expires_at: Instant::now() + self.ttl,
            };
        };
        let entry = StoredEntry {
            result,
            expires_at: Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero()),
        };
        match backend.set_if_absent(fingerprint, &entry).await {
            Ok(stored) => self.to_cached(stored),
            Err(e) => {
                tracing::warn!(fingerprint = fingerprint.short(), error = %e, "durable cache write failed");
                self.to_cached(entry)
            }
        }
    }

    fn to_cached(&self, entry: StoredEntry) -> Cached {
        let remaining = (entry.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Cached {
            result: entry.result,
            expires_at: Instant::now() + remaining.min(self.ttl),
        }
    }

    /// Completed, unexpired result for `fingerprint`, without computing.
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<ClassificationResult> {
        let now = Instant::now();
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(fingerprint)
            .and_then(|s| s.cell.get())
            .filter(|c| c.expires_at > now)
            .map(|c| c.result.clone())
    }

    /// Drop the entry for `fingerprint` from both tiers.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<()> {
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.remove(fingerprint);
        }
        if let Some(backend) = &self.backend {
            backend.remove(fingerprint).await?;
        }
        Ok(())
    }

    /// Remove expired entries and idle empty slots; returns how many
    /// in-memory entries were dropped.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let dropped = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let before = slots.len();
            slots.retain(|_, slot| match slot.cell.get() {
                Some(c) => c.expires_at > now,
                // Empty and nobody waiting on it.
                None => Arc::strong_count(slot) > 1,
            });
            before - slots.len()
        };
        if let Some(backend) = &self.backend {
            let removed = backend.purge_expired().await?;
            tracing::debug!(removed, "purged expired durable cache entries");
        }
        Ok(dropped)
    }

    /// Number of completed, unexpired in-memory entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .values()
            .filter(|s| s.cell.get().is_some_and(|c| c.expires_at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::models::Category;
    use prism_core::fingerprint;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn result(category: Category) -> ClassificationResult {
        ClassificationResult {
            category,
            confidence: 0.9,
            tags: BTreeSet::new(),
            extracted_info: BTreeMap::new(),
            summary: "summary".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_computation() {
        let cache = Arc::new(ClassificationCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = fingerprint("same", "content");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            let fp = fp.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&fp, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, Error>(result(Category::Task))
                    })
                    .await
                    .unwrap()
            }));
        }
        let results = futures::future::join_all(handles).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for r in results {
            assert_eq!(r.unwrap().category, Category::Task);
        }
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let cache = ClassificationCache::new(Duration::from_secs(60));
        let fp = fingerprint("a", "b");
        let err = cache
            .get_or_compute(&fp, || async { Err::<ClassificationResult, _>(Error::Classification("boom".into())) })
            .await;
        assert!(err.is_err());
        assert!(cache.is_empty());

        let ok = cache
            .get_or_compute(&fp, || async { Ok::<_, Error>(result(Category::Note)) })
            .await
            .unwrap();
        assert_eq!(ok.category, Category::Note);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = ClassificationCache::new(Duration::from_secs(10));
        let fp = fingerprint("a", "b");
        cache
            .get_or_compute(&fp, || async { Ok::<_, Error>(result(Category::Note)) })
            .await
            .unwrap();
        assert!(cache.peek(&fp).is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.peek(&fp).is_none());

        let fresh = cache
            .get_or_compute(&fp, || async { Ok::<_, Error>(result(Category::Task)) })
            .await
            .unwrap();
        assert_eq!(fresh.category, Category::Task);
    }

    #[tokio::test]
    async fn invalidate_and_purge() {
        let cache = ClassificationCache::new(Duration::from_secs(60));
        let fp = fingerprint("x", "y");
        cache
            .get_or_compute(&fp, || async { Ok::<_, Error>(result(Category::Habit)) })
            .await
            .unwrap();
        cache.invalidate(&fp).await.unwrap();
        assert!(cache.peek(&fp).is_none());

        let other = fingerprint("p", "q");
        let _ = cache
            .get_or_compute(&other, || async { Err::<ClassificationResult, _>(Error::Cancelled) })
            .await;
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn durable_tier_survives_a_new_cache() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("prism.sqlite")).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        let backend: Arc<dyn CacheBackend> = Arc::new(SqliteCacheBackend::new(pool));
        let fp = fingerprint("durable", "entry");

        let first = ClassificationCache::new(Duration::from_secs(600)).with_backend(backend.clone());
        first
            .get_or_compute(&fp, || async { Ok::<_, Error>(result(Category::Knowledge)) })
            .await
            .unwrap();

        let second = ClassificationCache::new(Duration::from_secs(600)).with_backend(backend.clone());
        let calls = AtomicUsize::new(0);
        let hit = second
            .get_or_compute(&fp, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(result(Category::Task))
            })
            .await
            .unwrap();
        assert_eq!(hit.category, Category::Knowledge);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn set_if_absent_keeps_the_first_writer() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("prism.sqlite")).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        let backend = SqliteCacheBackend::new(pool);
        let fp = fingerprint("race", "");
        let expires_at = Utc::now() + chrono::Duration::minutes(10);

        let first = StoredEntry { result: result(Category::Note), expires_at };
        let second = StoredEntry { result: result(Category::Task), expires_at };
        backend.set_if_absent(&fp, &first).await.unwrap();
        let winner = backend.set_if_absent(&fp, &second).await.unwrap();
        assert_eq!(winner.result.category, Category::Note);
    }
}
