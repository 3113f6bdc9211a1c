//! SQLite database for shared QAFlow state
//!
//! The database file may be opened by several orchestrator processes at once;
//! rate limit counters kept here are shared between all of them.

use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A counter checked and incremented as part of one acquisition
#[derive(Debug, Clone)]
pub struct CounterSpec {
    pub key: String,
    pub limit: u64,
    /// Lifetime of the counter after its last increment
    pub ttl_secs: i64,
}

/// Database wrapper for shared state
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // WAL lets readers in other processes proceed during a write
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Rate limit counters, one row per provider/operation/window bucket
            CREATE TABLE IF NOT EXISTS rate_limit_counters (
                key TEXT PRIMARY KEY,
                count INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rate_limit_expires ON rate_limit_counters(expires_at);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Rate limit counters
    // ========================================================================

    /// Increment every counter if none of them has reached its limit.
    ///
    /// Returns `false` without touching any counter when one is exhausted.
    /// The check and the increments run in a single IMMEDIATE transaction.
    pub fn try_acquire(&self, counters: &[CounterSpec], now: i64) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM rate_limit_counters WHERE expires_at <= ?1",
            params![now],
        )?;

        for counter in counters {
            let count: i64 = tx
                .query_row(
                    "SELECT count FROM rate_limit_counters WHERE key = ?1",
                    params![counter.key],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);

            if count.max(0) as u64 >= counter.limit {
                tx.commit()?;
                debug!("Counter {} exhausted at {}", counter.key, count);
                return Ok(false);
            }
        }

        for counter in counters {
            tx.execute(
                "INSERT INTO rate_limit_counters (key, count, expires_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(key) DO UPDATE SET count = count + 1, expires_at = excluded.expires_at",
                params![counter.key, now + counter.ttl_secs],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }

    /// Current values of the given counters; missing or expired ones read as 0
    pub fn counter_values(&self, keys: &[String], now: i64) -> Result<Vec<u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT count FROM rate_limit_counters WHERE key = ?1 AND expires_at > ?2",
        )?;

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let count: Option<i64> = stmt
                .query_row(params![key, now], |row| row.get(0))
                .optional()?;
            values.push(count.unwrap_or(0).max(0) as u64);
        }
        Ok(values)
    }

    /// Delete every counter whose key starts with `prefix`
    pub fn clear_counters(&self, prefix: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM rate_limit_counters WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        debug!("Cleared {} counters with prefix {}", removed, prefix);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(key: &str, limit: u64, ttl_secs: i64) -> CounterSpec {
        CounterSpec {
            key: key.to_string(),
            limit,
            ttl_secs,
        }
    }

    #[test]
    fn test_try_acquire_limits() {
        let db = Database::open_memory().unwrap();
        let counters = vec![spec("a:minute:1", 2, 60), spec("a:hour:0", 10, 3600)];

        assert!(db.try_acquire(&counters, 100).unwrap());
        assert!(db.try_acquire(&counters, 100).unwrap());
        assert!(!db.try_acquire(&counters, 100).unwrap());

        let values = db
            .counter_values(&["a:minute:1".to_string(), "a:hour:0".to_string()], 100)
            .unwrap();
        assert_eq!(values, vec![2, 2]);
    }

    #[test]
    fn test_denial_does_not_increment() {
        let db = Database::open_memory().unwrap();
        let counters = vec![spec("m", 5, 60), spec("h", 1, 3600)];

        assert!(db.try_acquire(&counters, 0).unwrap());
        assert!(!db.try_acquire(&counters, 0).unwrap());

        let values = db
            .counter_values(&["m".to_string(), "h".to_string()], 0)
            .unwrap();
        assert_eq!(values, vec![1, 1]);
    }

    #[test]
    fn test_expired_counters_read_as_zero() {
        let db = Database::open_memory().unwrap();
        let counters = vec![spec("k", 1, 60)];

        assert!(db.try_acquire(&counters, 0).unwrap());
        assert!(!db.try_acquire(&counters, 59).unwrap());
        assert_eq!(db.counter_values(&["k".to_string()], 60).unwrap(), vec![0]);
        assert!(db.try_acquire(&counters, 60).unwrap());
    }

    #[test]
    fn test_clear_and_expiry_purge() {
        let db = Database::open_memory().unwrap();
        db.try_acquire(&[spec("rate_limit:openai:generate:minute:1", 9, 60)], 0)
            .unwrap();
        db.try_acquire(&[spec("rate_limit:figma:get_file:minute:1", 9, 60)], 0)
            .unwrap();
        db.try_acquire(&[spec("rate_limit:figma:get_images:hour:0", 9, 10)], 0)
            .unwrap();

        assert_eq!(db.clear_counters("rate_limit:openai:").unwrap(), 1);

        // the next write drops the expired hour counter
        db.try_acquire(&[spec("rate_limit:llm:generate:minute:0", 9, 60)], 30)
            .unwrap();
        assert_eq!(db.clear_counters("rate_limit:").unwrap(), 2);
    }

    #[test]
    fn test_shared_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let first = Database::open(&path).unwrap();
        let second = Database::open(&path).unwrap();
        let counters = vec![spec("shared", 3, 60)];

        assert!(first.try_acquire(&counters, 0).unwrap());
        assert!(second.try_acquire(&counters, 0).unwrap());
        assert!(first.try_acquire(&counters, 0).unwrap());
        assert!(!second.try_acquire(&counters, 0).unwrap());
    }
}
