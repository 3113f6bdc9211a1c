//! Workflow coordination
//!
//! A workflow runs in its own task and is the only writer of its record.
//! Steps run strictly in order; only a failed fatal step stops the run.

use super::steps::{plan, RunContext, ServiceClients, StepKind, StepOutput, StepRunner};
use super::store::WorkflowStore;
use crate::batch::{panic_message, BatchCoordinator};
use crate::config::WorkflowConfig;
use crate::health::ServiceHealthAggregator;
use crate::rate_limiter::RateLimiter;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use qaflow_common::{
    Error, HealthReport, Result, StepOutcome, StepResult, WorkflowRecord, WorkflowRequest,
    WorkflowState, WorkflowSummary,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

/// All known workflows, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowListing {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub workflows: Vec<WorkflowSummary>,
}

/// Step results of a workflow, complete or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResults {
    pub workflow_id: String,
    pub status: WorkflowState,
    pub progress: f64,
    pub results: Vec<StepResult>,
    pub errors: Vec<String>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Drives workflows from request to report
#[derive(Clone)]
pub struct WorkflowCoordinator {
    store: Arc<dyn WorkflowStore>,
    runner: StepRunner,
    health: Option<ServiceHealthAggregator>,
    config: WorkflowConfig,
}

impl WorkflowCoordinator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        clients: ServiceClients,
        limiter: RateLimiter,
        config: WorkflowConfig,
    ) -> Self {
        let batch = BatchCoordinator::from_limit(config.batch_concurrency);
        Self {
            store,
            runner: StepRunner::new(clients, limiter, batch, config.clone()),
            health: None,
            config,
        }
    }

    /// Use `health` to gate steps when `gate_on_health` is set
    pub fn with_health(mut self, health: ServiceHealthAggregator) -> Self {
        self.health = Some(health);
        self
    }

    /// Validate and register a workflow, then run it in the background.
    ///
    /// Returns the new workflow id without waiting for any step.
    pub fn start(&self, request: WorkflowRequest) -> Result<String> {
        let (id, steps) = self.register(&request)?;

        let coordinator = self.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            coordinator.run(task_id, request, steps).await;
        });

        Ok(id)
    }

    /// Run a workflow on the caller's task and return its terminal record
    ///
    /// The record is registered like any other, so it stays visible to
    /// `status` and `list` while it runs.
    pub async fn run_to_completion(&self, request: WorkflowRequest) -> Result<WorkflowRecord> {
        let (id, steps) = self.register(&request)?;
        self.clone().run(id.clone(), request, steps).await;
        self.status(&id)
    }

    fn register(&self, request: &WorkflowRequest) -> Result<(String, Vec<StepKind>)> {
        request.validate()?;

        let steps = plan(request);
        let mut record = WorkflowRecord::new(request);
        record.planned_steps = steps.iter().map(|s| s.name().to_string()).collect();
        let id = record.workflow_id.clone();
        self.store.insert(record)?;

        info!(
            "Started workflow {} for {} ({} steps)",
            id,
            request.target_url,
            steps.len()
        );
        Ok((id, steps))
    }

    pub fn status(&self, id: &str) -> Result<WorkflowRecord> {
        self.store
            .get(id)
            .ok_or_else(|| Error::not_found("workflow", id))
    }

    /// Step results recorded so far
    pub fn results(&self, id: &str) -> Result<WorkflowResults> {
        let record = self.status(id)?;
        Ok(WorkflowResults {
            workflow_id: record.workflow_id,
            status: record.status,
            progress: record.progress,
            results: record.results,
            errors: record.errors,
            end_time: record.end_time,
        })
    }

    pub fn list(&self) -> WorkflowListing {
        let mut records = self.store.list();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        let mut by_status = BTreeMap::new();
        for record in &records {
            *by_status.entry(record.status.to_string()).or_insert(0) += 1;
        }

        WorkflowListing {
            total: records.len(),
            by_status,
            workflows: records.iter().map(WorkflowSummary::from).collect(),
        }
    }

    /// Delete a finished workflow; running ones cannot be removed
    pub fn remove(&self, id: &str) -> Result<WorkflowRecord> {
        let record = self.status(id)?;
        if !record.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: record.status.to_string(),
                to: "removed".to_string(),
            });
        }

        let removed = self
            .store
            .remove(id)
            .ok_or_else(|| Error::not_found("workflow", id))?;
        info!("Removed workflow {}", id);
        Ok(removed)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn run(self, id: String, request: WorkflowRequest, steps: Vec<StepKind>) {
        if let Err(e) = self.store.update(&id, &mut |r| {
            r.transition(WorkflowState::Running)?;
            r.current_step = "Starting".to_string();
            Ok(())
        }) {
            error!("Workflow {} could not start: {}", id, e);
            return;
        }

        let health = self.health_snapshot(&steps).await;
        let mut ctx = RunContext::new(id.clone(), request);
        let total = steps.len();
        let mut fatal: Option<StepKind> = None;

        for (idx, kind) in steps.into_iter().enumerate() {
            self.update(&id, |r| {
                r.current_step = kind.description().to_string();
                Ok(())
            });

            let started = Utc::now();
            let result = match check_health(kind, health.as_ref()) {
                Ok(()) => self.run_step(kind, &mut ctx).await,
                Err(e) => Err(e),
            };

            let (outcome, warnings) = match result {
                Ok(output) => (StepOutcome::succeeded(output.payload, started), output.warnings),
                Err(e) => {
                    error!("Workflow {} step {} failed: {}", id, kind, e);
                    (StepOutcome::failed(e, started), Vec::new())
                }
            };

            let success = outcome.success;
            ctx.finish(kind, outcome.payload.clone(), outcome.duration_ms);

            let progress = (idx + 1) as f64 / total as f64;
            self.update(&id, |r| {
                r.record(kind.name(), outcome.clone());
                r.errors.extend(warnings.iter().cloned());
                r.advance(progress);
                Ok(())
            });

            if !success && kind.is_fatal() {
                fatal = Some(kind);
                break;
            }
        }

        self.update(&id, |r| finish_record(r, fatal));

        info!(
            "Workflow {} finished: {}",
            id,
            if fatal.is_some() { "failed" } else { "completed" }
        );
    }

    async fn run_step(&self, kind: StepKind, ctx: &mut RunContext) -> Result<StepOutput> {
        match AssertUnwindSafe(self.runner.run(kind, ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(Error::WorkflowStepFailure {
                step: kind.name().to_string(),
                reason: format!("step panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }

    /// One health probe of the services the planned steps need
    async fn health_snapshot(&self, steps: &[StepKind]) -> Option<HealthReport> {
        if !self.config.gate_on_health {
            return None;
        }
        let Some(health) = self.health.as_ref() else {
            warn!("gate_on_health is set but no health aggregator is attached; steps run ungated");
            return None;
        };

        let mut services: Vec<String> = steps
            .iter()
            .filter_map(|s| s.required_service())
            .map(str::to_string)
            .collect();
        services.sort();
        services.dedup();

        let report = health.check(&services).await;
        if !report.overall_healthy() {
            warn!(
                "{} services unhealthy at workflow start",
                report.unhealthy_services
            );
        }
        Some(report)
    }

    fn update(&self, id: &str, mut f: impl FnMut(&mut WorkflowRecord) -> Result<()>) {
        if let Err(e) = self.store.update(id, &mut f) {
            warn!("Failed to update workflow {}: {}", id, e);
        }
    }
}

/// Move a finished run to its terminal state
fn finish_record(record: &mut WorkflowRecord, fatal: Option<StepKind>) -> Result<()> {
    match fatal {
        Some(kind) => {
            record.transition(WorkflowState::Failed)?;
            record.current_step = format!("Failed during {}", kind.name());
        }
        None => {
            record.transition(WorkflowState::Completed)?;
            record.current_step = "Completed".to_string();
        }
    }
    Ok(())
}

fn check_health(kind: StepKind, report: Option<&HealthReport>) -> Result<()> {
    let (Some(report), Some(service)) = (report, kind.required_service()) else {
        return Ok(());
    };
    if report.is_healthy(service) {
        return Ok(());
    }

    let status = report
        .services
        .get(service)
        .map(|r| r.status.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    Err(Error::provider(
        service,
        format!("service was {} at workflow start", status),
    ))
}
