//! In-process counter store

use super::CounterStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use qaflow_common::{CounterSpec, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: i64,
}

/// Counters held in a process-local map
///
/// Expired counters are swept on every access, so buckets two or more
/// windows old never accumulate.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, Counter>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and increment under one lock
    pub fn acquire(&self, specs: &[CounterSpec], now: i64) -> bool {
        let mut counters = self.counters.lock();
        counters.retain(|_, c| c.expires_at > now);

        let exhausted = specs.iter().any(|spec| {
            counters
                .get(&spec.key)
                .map_or(false, |c| c.count >= spec.limit)
        });
        if exhausted {
            return false;
        }

        for spec in specs {
            let counter = counters.entry(spec.key.clone()).or_insert(Counter {
                count: 0,
                expires_at: now,
            });
            counter.count += 1;
            counter.expires_at = now + spec.ttl_secs;
        }
        true
    }

    /// Undo one `acquire` of the same counters
    pub fn release(&self, specs: &[CounterSpec]) {
        let mut counters = self.counters.lock();
        for spec in specs {
            if let Some(counter) = counters.get_mut(&spec.key) {
                counter.count = counter.count.saturating_sub(1);
            }
        }
    }

    pub fn values(&self, keys: &[String], now: i64) -> Vec<u64> {
        let counters = self.counters.lock();
        keys.iter()
            .map(|key| {
                counters
                    .get(key)
                    .filter(|c| c.expires_at > now)
                    .map_or(0, |c| c.count)
            })
            .collect()
    }

    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut counters = self.counters.lock();
        let before = counters.len();
        counters.retain(|key, _| !key.starts_with(prefix));
        before - counters.len()
    }

    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn try_acquire(&self, counters: &[CounterSpec], now: i64) -> Result<bool> {
        Ok(self.acquire(counters, now))
    }

    async fn counts(&self, keys: &[String], now: i64) -> Result<Vec<u64>> {
        Ok(self.values(keys, now))
    }

    async fn clear(&self, prefix: &str) -> Result<usize> {
        Ok(self.remove_prefix(prefix))
    }
}
