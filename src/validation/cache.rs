//! Verdict cache: persists a [`ValidationVerdict`] keyed by candidate, run,
//! and validation settings, plus a per-key advisory lock so concurrent
//! validation attempts for the same candidate serialize onto one gate run
//! instead of duplicating the work.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::Result;

use super::types::{CacheKey, ValidationVerdict};

/// Durable store for verdicts, looked up before the gate pipeline runs and
/// written after it completes.
#[async_trait]
pub trait VerdictCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<ValidationVerdict>>;
    async fn put(&self, key: &CacheKey, verdict: &ValidationVerdict) -> Result<()>;
}

/// Per-key advisory locks so two workers racing to validate the same
/// candidate serialize rather than both running the gate pipeline. Not a
/// cache itself -- wraps whichever [`VerdictCache`] backs the harness.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex for `key`, creating one if this is the first
    /// contender. Callers hold the returned guard for the duration of the
    /// cache-check-then-validate-then-store sequence.
    pub fn handle(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

/// Simple in-memory [`VerdictCache`], used by default and by tests. Not
/// durable across process restarts.
#[derive(Default)]
pub struct InMemoryVerdictCache {
    entries: DashMap<CacheKey, ValidationVerdict>,
}

impl InMemoryVerdictCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerdictCache for InMemoryVerdictCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<ValidationVerdict>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &CacheKey, verdict: &ValidationVerdict) -> Result<()> {
        self.entries.insert(key.clone(), verdict.clone());
        Ok(())
    }
}

#[cfg(feature = "sqlite-store")]
mod sqlite_store {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::sync::Mutex as StdMutex;

    /// SQLite-backed [`VerdictCache`]: verdicts are serialized as JSON
    /// under a single `verdicts` table keyed by the cache key's three
    /// components, following the same `Arc<Mutex<Connection>>` +
    /// `with_conn` pattern the rest of the persisted-state layer uses.
    pub struct SqliteVerdictCache {
        conn: Arc<StdMutex<Connection>>,
    }

    impl SqliteVerdictCache {
        pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
            let conn = Connection::open(path)
                .map_err(|e| crate::error::Error::cache(e.to_string()))?;
            Self::from_connection(conn)
        }

        pub fn in_memory() -> Result<Self> {
            let conn = Connection::open_in_memory()
                .map_err(|e| crate::error::Error::cache(e.to_string()))?;
            Self::from_connection(conn)
        }

        fn from_connection(conn: Connection) -> Result<Self> {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS verdicts (
                    candidate_id TEXT NOT NULL,
                    run_fingerprint TEXT NOT NULL,
                    validation_settings_hash TEXT NOT NULL,
                    verdict_json TEXT NOT NULL,
                    PRIMARY KEY (candidate_id, run_fingerprint, validation_settings_hash)
                )",
                [],
            )
            .map_err(|e| crate::error::Error::cache(e.to_string()))?;

            Ok(Self {
                conn: Arc::new(StdMutex::new(conn)),
            })
        }

        fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
            let conn = self.conn.lock().map_err(|_| crate::error::Error::cache("poisoned connection mutex"))?;
            f(&conn).map_err(|e| crate::error::Error::cache(e.to_string()))
        }
    }

    #[async_trait]
    impl VerdictCache for SqliteVerdictCache {
        async fn get(&self, key: &CacheKey) -> Result<Option<ValidationVerdict>> {
            self.with_conn(|conn| {
                conn.query_row(
                    "SELECT verdict_json FROM verdicts
                     WHERE candidate_id = ?1 AND run_fingerprint = ?2 AND validation_settings_hash = ?3",
                    params![key.candidate_id, key.run_fingerprint, key.validation_settings_hash],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })?
            .map(|json| serde_json::from_str(&json).map_err(crate::error::Error::from))
            .transpose()
        }

        async fn put(&self, key: &CacheKey, verdict: &ValidationVerdict) -> Result<()> {
            let json = serde_json::to_string(verdict)?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO verdicts
                     (candidate_id, run_fingerprint, validation_settings_hash, verdict_json)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        key.candidate_id,
                        key.run_fingerprint,
                        key.validation_settings_hash,
                        json
                    ],
                )
            })?;
            Ok(())
        }
    }
}

#[cfg(feature = "sqlite-store")]
pub use sqlite_store::SqliteVerdictCache;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::types::{GateOutcome, Status};
    use chrono::Utc;

    fn verdict(candidate_id: &str) -> ValidationVerdict {
        ValidationVerdict {
            candidate_id: candidate_id.to_string(),
            query_id: "query-1".to_string(),
            run_fingerprint: "run-1".to_string(),
            status: Status::Improved,
            speedup: Some(1.08),
            gate_outcomes: vec![GateOutcome::pass(super::super::types::GateName::Static, "ok")],
            gate_failed: None,
            semantic_confidence: None,
            perf: None,
            baseline_explain: None,
            candidate_explain: None,
            reason: "candidate is 1.08x faster".to_string(),
            computed_at: Utc::now(),
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn in_memory_cache_round_trips() {
        let cache = InMemoryVerdictCache::new();
        let key = CacheKey {
            candidate_id: "cand-1".into(),
            run_fingerprint: "run-1".into(),
            validation_settings_hash: "hash".into(),
        };
        assert!(cache.get(&key).await.unwrap().is_none());
        cache.put(&key, &verdict("cand-1")).await.unwrap();
        let fetched = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(fetched.candidate_id, "cand-1");
    }

    #[tokio::test]
    async fn keyed_locks_return_the_same_mutex_for_the_same_key() {
        let locks = KeyedLocks::new();
        let key = CacheKey {
            candidate_id: "cand-1".into(),
            run_fingerprint: "run-1".into(),
            validation_settings_hash: "hash".into(),
        };
        let a = locks.handle(&key);
        let b = locks.handle(&key);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[cfg(feature = "sqlite-store")]
    #[tokio::test]
    async fn sqlite_cache_round_trips() {
        let cache = super::sqlite_store::SqliteVerdictCache::in_memory().unwrap();
        let key = CacheKey {
            candidate_id: "cand-1".into(),
            run_fingerprint: "run-1".into(),
            validation_settings_hash: "hash".into(),
        };
        cache.put(&key, &verdict("cand-1")).await.unwrap();
        let fetched = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(fetched.candidate_id, "cand-1");
    }
}
