// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed state repository.
//!
//! Stores JSON-encoded values keyed by `(repository, key)`, so several
//! repositories can share one database file. Intended for key cardinalities
//! that do not fit comfortably in memory.
//!
//! # Per-Key Atomicity
//!
//! `compute` is a read, a user function, and a write. To keep it atomic per
//! key without serializing the whole repository, every key hashes onto one
//! of [`LOCK_STRIPES`] async mutexes:
//!
//! ```text
//! compute("p-1") ──▶ stripe 12 ──▶ SELECT → f() → UPSERT
//! compute("p-9") ──▶ stripe 40 ──▶ SELECT → f() → UPSERT   (runs in parallel)
//! compute("p-1") ──▶ stripe 12 ──▶ waits
//! ```
//!
//! The striping is in-process only. Two processes sharing a database file
//! get no per-key atomicity from it.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with capped exponential backoff;
//! any other database error is surfaced to the caller.

use super::{ComputeFn, StateRepository};
use crate::error::{ChannelError, Result};
use crate::metrics;
use crate::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Number of per-key lock stripes.
pub const LOCK_STRIPES: usize = 64;

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    repository: &str,
    operation: &'static str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(repository, operation, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    repository,
                    operation,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                metrics::record_state_busy_retry(repository, operation);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(repository, operation, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Persistent [`StateRepository`] over SQLite in WAL mode.
pub struct SqliteStateRepository<V> {
    name: String,
    pool: SqlitePool,
    stripes: Vec<Mutex<()>>,
    path: String,
    _value: PhantomData<fn() -> V>,
}

impl<V> SqliteStateRepository<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open (or create) the database at `path` and bind to repository `name`.
    pub async fn open(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, repository = %name, "Opening SQLite state repository");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ChannelError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_entries (
                repository TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (repository, key)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            name,
            pool,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            path: path_str,
            _value: PhantomData,
        })
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() % self.stripes.len() as u64) as usize]
    }

    fn encode(&self, value: &V) -> Result<String> {
        serde_json::to_string(value)
            .map_err(|e| ChannelError::state_repository(&self.name, format!("encode: {}", e)))
    }

    fn decode(&self, key: &str, text: &str) -> Result<V> {
        serde_json::from_str(text).map_err(|e| {
            ChannelError::state_repository(&self.name, format!("decode '{}': {}", key, e))
        })
    }

    async fn load(&self, key: &str) -> Result<Option<V>> {
        let row: Option<(String,)> = execute_with_retry(&self.name, "get", || {
            sqlx::query_as("SELECT value FROM state_entries WHERE repository = ? AND key = ?")
                .bind(&self.name)
                .bind(key)
                .fetch_optional(&self.pool)
        })
        .await?;
        row.map(|(text,)| self.decode(key, &text)).transpose()
    }

    async fn store(&self, key: &str, value: &V) -> Result<()> {
        let text = self.encode(value)?;
        let now = chrono::Utc::now().timestamp_millis();
        execute_with_retry(&self.name, "put", || {
            sqlx::query(
                r#"
                INSERT INTO state_entries (repository, key, value, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(repository, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&self.name)
            .bind(key)
            .bind(&text)
            .bind(now)
            .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        execute_with_retry(&self.name, "remove", || {
            sqlx::query("DELETE FROM state_entries WHERE repository = ? AND key = ?")
                .bind(&self.name)
                .bind(key)
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    /// Force flush WAL to main database.
    pub async fn checkpoint(&self) -> Result<()> {
        execute_with_retry(&self.name, "checkpoint", || {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&self.pool)
        })
        .await?;
        debug!(repository = %self.name, "WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(repository = %self.name, "SQLite state repository closed");
    }
}

impl<V> StateRepository<V> for SqliteStateRepository<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<V>> {
        Box::pin(self.load(key))
    }

    fn put<'a>(&'a self, key: &'a str, value: V) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.stripe(key).lock().await;
            self.store(key, &value).await?;
            metrics::record_state_write(&self.name, "put");
            Ok(())
        })
    }

    fn compute<'a>(&'a self, key: &'a str, f: ComputeFn<V>) -> BoxFuture<'a, Option<V>> {
        Box::pin(async move {
            let _guard = self.stripe(key).lock().await;
            let current = self.load(key).await?;
            let had_value = current.is_some();
            let next = f(key, current);
            match &next {
                Some(value) => self.store(key, value).await?,
                None if had_value => self.delete(key).await?,
                None => {}
            }
            metrics::record_state_write(&self.name, "compute");
            Ok(next)
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<V>> {
        Box::pin(async move {
            let _guard = self.stripe(key).lock().await;
            let previous = self.load(key).await?;
            if previous.is_some() {
                self.delete(key).await?;
            }
            metrics::record_state_write(&self.name, "remove");
            Ok(previous)
        })
    }

    fn clear(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let result = execute_with_retry(&self.name, "clear", || {
                sqlx::query("DELETE FROM state_entries WHERE repository = ?")
                    .bind(&self.name)
                    .execute(&self.pool)
            })
            .await?;
            debug!(repository = %self.name, removed = result.rows_affected(), "Cleared repository");
            Ok(())
        })
    }

    fn size(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            let (count,): (i64,) = execute_with_retry(&self.name, "size", || {
                sqlx::query_as("SELECT COUNT(*) FROM state_entries WHERE repository = ?")
                    .bind(&self.name)
                    .fetch_one(&self.pool)
            })
            .await?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }

    fn keys(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let rows: Vec<(String,)> = execute_with_retry(&self.name, "keys", || {
                sqlx::query_as("SELECT key FROM state_entries WHERE repository = ? ORDER BY key")
                    .bind(&self.name)
                    .fetch_all(&self.pool)
            })
            .await?;
            Ok(rows.into_iter().map(|(key,)| key).collect())
        })
    }

    fn entries(&self) -> BoxFuture<'_, Vec<(String, V)>> {
        Box::pin(async move {
            let rows: Vec<(String, String)> = execute_with_retry(&self.name, "entries", || {
                sqlx::query_as(
                    "SELECT key, value FROM state_entries WHERE repository = ? ORDER BY key",
                )
                .bind(&self.name)
                .fetch_all(&self.pool)
            })
            .await?;
            rows.into_iter()
                .map(|(key, text)| {
                    let value = self.decode(&key, &text)?;
                    Ok((key, value))
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::compute_fn;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_get_remove() {
        let dir = tempdir().unwrap();
        let repo = SqliteStateRepository::<Value>::open(dir.path().join("state.db"), "products")
            .await
            .unwrap();

        assert_eq!(repo.get("p1").await.unwrap(), None);
        repo.put("p1", json!({"name": "Shoe"})).await.unwrap();
        assert_eq!(repo.get("p1").await.unwrap(), Some(json!({"name": "Shoe"})));
        assert_eq!(repo.size().await.unwrap(), 1);

        assert_eq!(repo.remove("p1").await.unwrap(), Some(json!({"name": "Shoe"})));
        assert_eq!(repo.size().await.unwrap(), 0);
        repo.close().await;
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let repo = SqliteStateRepository::<u64>::open(&path, "r").await.unwrap();
            repo.put("a", 7).await.unwrap();
            repo.close().await;
        }

        let repo = SqliteStateRepository::<u64>::open(&path, "r").await.unwrap();
        assert_eq!(repo.get("a").await.unwrap(), Some(7));
        repo.close().await;
    }

    #[tokio::test]
    async fn test_repositories_are_isolated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let a = SqliteStateRepository::<u64>::open(&path, "a").await.unwrap();
        let b = SqliteStateRepository::<u64>::open(&path, "b").await.unwrap();

        a.put("k", 1).await.unwrap();
        b.put("k", 2).await.unwrap();
        a.clear().await.unwrap();

        assert_eq!(a.size().await.unwrap(), 0);
        assert_eq!(b.get("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_compute_and_keys() {
        let dir = tempdir().unwrap();
        let repo = SqliteStateRepository::<u64>::open(dir.path().join("s.db"), "r")
            .await
            .unwrap();

        repo.compute("b", compute_fn(|_, cur| Some(cur.unwrap_or(0) + 1)))
            .await
            .unwrap();
        repo.compute("a", compute_fn(|_, cur| Some(cur.unwrap_or(10) + 1)))
            .await
            .unwrap();
        assert_eq!(repo.keys().await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            repo.entries().await.unwrap(),
            vec![("a".to_string(), 11), ("b".to_string(), 1)]
        );

        let removed = repo.compute("a", compute_fn(|_, _| None)).await.unwrap();
        assert_eq!(removed, None);
        assert_eq!(repo.keys().await.unwrap(), vec!["b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_compute_no_lost_updates() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(
            SqliteStateRepository::<u64>::open(dir.path().join("c.db"), "counter")
                .await
                .unwrap(),
        );

        let workers = 16u64;
        let mut handles = Vec::new();
        for _ in 0..workers {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                repo.compute("count", compute_fn(|_, cur| Some(cur.unwrap_or(0) + 1)))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(repo.get("count").await.unwrap(), Some(workers));
    }

    #[tokio::test]
    async fn test_corrupt_value_is_state_repository_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        let text_repo = SqliteStateRepository::<String>::open(&path, "r").await.unwrap();
        text_repo.put("k", "not a number".to_string()).await.unwrap();

        let num_repo = SqliteStateRepository::<u64>::open(&path, "r").await.unwrap();
        let err = num_repo.get("k").await.unwrap_err();
        assert!(err.is_state_repository());
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;
        let result: std::result::Result<i32, sqlx::Error> =
            execute_with_retry("r", "test_op", || {
                attempt_count += 1;
                async { Err(sqlx::Error::RowNotFound) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_pool_timed_out() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
