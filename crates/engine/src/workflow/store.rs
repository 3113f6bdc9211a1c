//! Workflow registry

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use qaflow_common::{Error, Result, WorkflowRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Process-wide store of workflow records
pub trait WorkflowStore: Send + Sync {
    /// Add a new record; fails if the id is taken
    fn insert(&self, record: WorkflowRecord) -> Result<()>;

    /// Snapshot of a record
    fn get(&self, id: &str) -> Option<WorkflowRecord>;

    /// Mutate a record in place, atomically with respect to readers
    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut WorkflowRecord) -> Result<()>,
    ) -> Result<()>;

    /// Snapshots of every record
    fn list(&self) -> Vec<WorkflowRecord>;

    fn remove(&self, id: &str) -> Option<WorkflowRecord>;

    /// Drop terminal records that ended before `cutoff`
    fn evict_finished(&self, cutoff: DateTime<Utc>) -> usize;
}

/// In-memory store with per-record locking
#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    records: DashMap<String, WorkflowRecord>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl WorkflowStore for MemoryWorkflowStore {
    fn insert(&self, record: WorkflowRecord) -> Result<()> {
        match self.records.entry(record.workflow_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Internal(format!(
                "workflow {} already exists",
                record.workflow_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!("Registered workflow {}", record.workflow_id);
                slot.insert(record);
                Ok(())
            }
        }
    }

    fn get(&self, id: &str) -> Option<WorkflowRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut WorkflowRecord) -> Result<()>,
    ) -> Result<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::not_found("workflow", id))?;
        f(record.value_mut())
    }

    fn list(&self) -> Vec<WorkflowRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    fn remove(&self, id: &str) -> Option<WorkflowRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    fn evict_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| {
            !(record.is_terminal() && record.end_time.map_or(false, |end| end < cutoff))
        });
        before.saturating_sub(self.records.len())
    }
}

/// Periodically evict finished workflows older than `retention`
pub fn spawn_retention(
    store: Arc<dyn WorkflowStore>,
    retention: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    let retention = chrono::Duration::from_std(retention)
        .unwrap_or_else(|_| chrono::Duration::days(365));

    tokio::spawn(async move {
        info!(
            "Workflow retention started: keeping finished workflows for {}h",
            retention.num_hours()
        );
        loop {
            tokio::time::sleep(interval).await;

            let evicted = store.evict_finished(Utc::now() - retention);
            if evicted > 0 {
                info!("Evicted {} finished workflows", evicted);
            }
        }
    })
}
