//! Concurrent batch execution with per-item failure isolation

use futures::future::{join_all, FutureExt};
use futures::stream::{self, StreamExt};
use qaflow_common::{BatchItem, BatchResult, Result};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

/// Runs independent operations concurrently and collects every outcome
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchCoordinator {
    concurrency: Option<usize>,
}

impl BatchCoordinator {
    /// Run every item at once
    pub fn new() -> Self {
        Self::default()
    }

    /// Run at most `limit` items at a time
    pub fn with_concurrency(limit: usize) -> Self {
        Self {
            concurrency: Some(limit.max(1)),
        }
    }

    /// Build from an optional cap
    pub fn from_limit(limit: Option<usize>) -> Self {
        limit.map_or_else(Self::new, Self::with_concurrency)
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    /// Apply `operation` to every item.
    ///
    /// Results keep input order. An item that returns an error or panics
    /// becomes a `Failed` entry; the batch itself always completes.
    pub async fn run_batch<I, T, F, Fut>(&self, items: Vec<I>, operation: F) -> BatchResult<T>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let total = items.len();
        let futures = items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| isolate(idx, operation(item)));

        let outcomes = match self.concurrency {
            Some(limit) => stream::iter(futures).buffered(limit).collect().await,
            None => join_all(futures).await,
        };

        let result = BatchResult::from_items(outcomes);
        debug!(
            "Batch finished: {} of {} succeeded",
            result.succeeded, total
        );
        result
    }
}

async fn isolate<T, Fut>(idx: usize, fut: Fut) -> BatchItem<T>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => BatchItem::Succeeded { value },
        Ok(Err(e)) => {
            warn!("Batch item {} failed: {}", idx, e);
            BatchItem::Failed {
                error: e.to_string(),
            }
        }
        Err(panic) => {
            let error = format!("item panicked: {}", panic_message(panic.as_ref()));
            warn!("Batch item {} {}", idx, error);
            BatchItem::Failed { error }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
