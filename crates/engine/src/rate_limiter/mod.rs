//! Provider rate limiting
//!
//! Each (provider, operation) pair has a per-minute and a per-hour quota,
//! counted in fixed windows. Every grant this process makes is counted in an
//! in-process [`MemoryCounterStore`]; when a shared [`CounterStore`] is
//! configured it must also grant the call. A failure of the shared store is
//! logged and the local decision stands, so the local count bounds this
//! process's grants whichever backend answered.

mod memory;
mod sqlite;

pub use memory::MemoryCounterStore;
pub use sqlite::SqliteCounterStore;

use crate::config::RateLimitConfig;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use qaflow_common::{CounterSpec, RateLimitStatus, Result, Window, WindowStatus};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const KEY_PREFIX: &str = "rate_limit";

// ============================================================================
// Clock
// ============================================================================

/// Source of wall-clock time in unix seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Reads the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Manually driven clock for tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Counter stores
// ============================================================================

/// Backend holding windowed counters
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short name reported in status responses
    fn name(&self) -> &'static str;

    /// Increment all counters if none has reached its limit
    async fn try_acquire(&self, counters: &[CounterSpec], now: i64) -> Result<bool>;

    /// Live values of the given counters, expired ones as 0
    async fn counts(&self, keys: &[String], now: i64) -> Result<Vec<u64>>;

    /// Remove counters whose key starts with `prefix`
    async fn clear(&self, prefix: &str) -> Result<usize>;
}

// ============================================================================
// Rate limiter
// ============================================================================

/// Quota guard for provider calls
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    shared: Option<Arc<dyn CounterStore>>,
    local: Arc<MemoryCounterStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter that counts in process only
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            shared: None,
            local: Arc::new(MemoryCounterStore::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Count in a store shared with other processes
    pub fn with_shared_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        info!("Rate limiter using shared counter store: {}", store.name());
        self.shared = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Counter key for a provider/operation pair in the bucket containing `now`
    pub fn counter_key(provider: &str, operation: &str, window: Window, now: i64) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            KEY_PREFIX,
            provider,
            operation,
            window.label(),
            window.bucket(now)
        )
    }

    fn counters(&self, provider: &str, operation: &str, now: i64) -> Vec<CounterSpec> {
        let limits = self.config.limits_for(provider);
        vec![
            CounterSpec {
                key: Self::counter_key(provider, operation, Window::Minute, now),
                limit: limits.per_minute,
                ttl_secs: Window::Minute.secs(),
            },
            CounterSpec {
                key: Self::counter_key(provider, operation, Window::Hour, now),
                limit: limits.per_hour,
                ttl_secs: Window::Hour.secs(),
            },
        ]
    }

    /// Consume one unit of quota if both windows have room
    pub async fn allow(&self, provider: &str, operation: &str) -> bool {
        let now = self.clock.now();
        let counters = self.counters(provider, operation, now);

        if !self.local.acquire(&counters, now) {
            debug!("Rate limit {}/{}: denied by local counters", provider, operation);
            return false;
        }

        let Some(shared) = &self.shared else {
            return true;
        };

        match shared.try_acquire(&counters, now).await {
            Ok(allowed) => {
                debug!(
                    "Rate limit {}/{} via {}: {}",
                    provider,
                    operation,
                    shared.name(),
                    if allowed { "allowed" } else { "denied" }
                );
                if !allowed {
                    self.local.release(&counters);
                }
                allowed
            }
            Err(e) => {
                warn!(
                    "Shared counter store {} failed, using local counters: {}",
                    shared.name(),
                    e
                );
                true
            }
        }
    }

    /// Retry `allow` with exponential backoff until it succeeds or `max_wait` passes
    pub async fn wait_until_allowed(
        &self,
        provider: &str,
        operation: &str,
        max_wait: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut delay = Duration::from_secs(1).min(max_wait);

        loop {
            if self.allow(provider, operation).await {
                return true;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(
                    "Rate limit for {}/{} not released within {:?}",
                    provider, operation, max_wait
                );
                return false;
            }

            let pause = delay.min(deadline - now);
            debug!(
                "Rate limited on {}/{}, retrying in {:?}",
                provider, operation, pause
            );
            tokio::time::sleep(pause).await;
            delay = (delay * 2).min(max_wait);
        }
    }

    /// Current usage of both windows
    pub async fn status(&self, provider: &str, operation: &str) -> RateLimitStatus {
        let now = self.clock.now();
        let limits = self.config.limits_for(provider);
        let keys = vec![
            Self::counter_key(provider, operation, Window::Minute, now),
            Self::counter_key(provider, operation, Window::Hour, now),
        ];

        let mut backend = self.local.name();
        let mut counts = None;
        if let Some(shared) = &self.shared {
            match shared.counts(&keys, now).await {
                Ok(values) => {
                    backend = shared.name();
                    counts = Some(values);
                }
                Err(e) => {
                    warn!(
                        "Shared counter store {} failed, reporting local counters: {}",
                        shared.name(),
                        e
                    );
                }
            }
        }
        let counts = counts.unwrap_or_else(|| self.local.values(&keys, now));

        let window_status = |window: Window, count: u64, limit: u64| WindowStatus {
            count,
            limit,
            remaining: limit.saturating_sub(count),
            resets_at: Utc
                .timestamp_opt(window.next_reset(now), 0)
                .single()
                .unwrap_or_else(Utc::now),
        };

        RateLimitStatus {
            provider: provider.to_string(),
            operation: operation.to_string(),
            current_minute: window_status(
                Window::Minute,
                counts.first().copied().unwrap_or(0),
                limits.per_minute,
            ),
            current_hour: window_status(
                Window::Hour,
                counts.get(1).copied().unwrap_or(0),
                limits.per_hour,
            ),
            backend: backend.to_string(),
        }
    }

    /// Clear counters of one provider, or of every provider
    pub async fn reset(&self, provider: Option<&str>) -> usize {
        let prefix = match provider {
            Some(p) => format!("{}:{}:", KEY_PREFIX, p),
            None => format!("{}:", KEY_PREFIX),
        };

        let mut removed = self.local.remove_prefix(&prefix);
        if let Some(shared) = &self.shared {
            match shared.clear(&prefix).await {
                Ok(n) => removed += n,
                Err(e) => warn!("Failed to clear shared counters {}: {}", prefix, e),
            }
        }

        info!(
            "Reset rate limits for {}: {} counters removed",
            provider.unwrap_or("all providers"),
            removed
        );
        removed
    }
}
