//! Counter store backed by the shared SQLite database

use super::CounterStore;
use async_trait::async_trait;
use qaflow_common::{CounterSpec, Database, Error, Result};

/// Counters stored in a database file shared between processes
#[derive(Clone)]
pub struct SqliteCounterStore {
    db: Database,
}

impl SqliteCounterStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| Error::Internal(format!("counter store task failed: {}", e)))?
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn try_acquire(&self, counters: &[CounterSpec], now: i64) -> Result<bool> {
        let counters = counters.to_vec();
        self.blocking(move |db| db.try_acquire(&counters, now)).await
    }

    async fn counts(&self, keys: &[String], now: i64) -> Result<Vec<u64>> {
        let keys = keys.to_vec();
        self.blocking(move |db| db.counter_values(&keys, now)).await
    }

    async fn clear(&self, prefix: &str) -> Result<usize> {
        let prefix = prefix.to_string();
        self.blocking(move |db| db.clear_counters(&prefix)).await
    }
}
