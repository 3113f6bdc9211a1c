//! Core types for QAFlow

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

// ============================================================================
// Workflows
// ============================================================================

/// Workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Initializing,
    Running,
    Completed,
    Failed,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::Initializing
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowState::Initializing => write!(f, "initializing"),
            WorkflowState::Running => write!(f, "running"),
            WorkflowState::Completed => write!(f, "completed"),
            WorkflowState::Failed => write!(f, "failed"),
        }
    }
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }

    /// Only initializing -> running -> {completed, failed} is allowed
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        matches!(
            (self, next),
            (WorkflowState::Initializing, WorkflowState::Running)
                | (WorkflowState::Running, WorkflowState::Completed)
                | (WorkflowState::Running, WorkflowState::Failed)
        )
    }
}

/// How much of the pipeline a workflow runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowScope {
    /// Generate, execute and analyze tests
    Full,
    /// Stop after test generation
    GenerateOnly,
}

impl Default for WorkflowScope {
    fn default() -> Self {
        Self::Full
    }
}

/// Login credentials for the system under test
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    #[serde(default)]
    pub additional_fields: HashMap<String, String>,
}

fn default_auth_type() -> String {
    "form_based".to_string()
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("auth_type", &self.auth_type)
            .finish()
    }
}

/// Requirement sources for a workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequirementsInput {
    /// Paths of documents the parser service can read
    #[serde(default)]
    pub documents: Vec<String>,
    /// Documents sent with the request itself
    #[serde(default)]
    pub uploads: Vec<UploadedDocument>,
    #[serde(default)]
    pub user_stories: Vec<String>,
    #[serde(default)]
    pub business_requirements: Vec<String>,
}

impl RequirementsInput {
    pub fn document_count(&self) -> usize {
        self.documents.len() + self.uploads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
            && self.uploads.is_empty()
            && self.user_stories.is_empty()
            && self.business_requirements.is_empty()
    }
}

/// Requirement document carried inline, base64 encoded on the wire
#[derive(Clone, Serialize, Deserialize)]
pub struct UploadedDocument {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl std::fmt::Debug for UploadedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadedDocument")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("bytes", &self.content.len())
            .finish()
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Request to start a workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub target_url: String,
    #[serde(default)]
    pub scope: WorkflowScope,
    pub credentials: Option<Credentials>,
    pub design_file_key: Option<String>,
    pub requirements: Option<RequirementsInput>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

impl WorkflowRequest {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            ..Default::default()
        }
    }

    pub fn with_design(mut self, key: impl Into<String>) -> Self {
        self.design_file_key = Some(key.into());
        self
    }

    pub fn with_requirements(mut self, requirements: RequirementsInput) -> Self {
        self.requirements = Some(requirements);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_scope(mut self, scope: WorkflowScope) -> Self {
        self.scope = scope;
        self
    }

    /// Reject malformed input before a workflow record is created
    pub fn validate(&self) -> Result<()> {
        let url = self.target_url.trim();
        if url.is_empty() {
            return Err(Error::Validation("target_url is required".to_string()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Validation(format!(
                "target_url must be an http(s) URL: {}",
                url
            )));
        }
        if let Some(key) = &self.design_file_key {
            if key.trim().is_empty() {
                return Err(Error::Validation("design_file_key is empty".to_string()));
            }
        }
        if let Some(requirements) = &self.requirements {
            if requirements.is_empty() {
                return Err(Error::Validation(
                    "requirements were supplied but contain no documents or stories".to_string(),
                ));
            }
            for upload in &requirements.uploads {
                if upload.filename.trim().is_empty() || upload.content.is_empty() {
                    return Err(Error::Validation(format!(
                        "uploaded document '{}' needs a filename and content",
                        upload.filename
                    )));
                }
            }
        }
        if let Some(credentials) = &self.credentials {
            if credentials.username.trim().is_empty() {
                return Err(Error::Validation("credentials.username is empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            target_url: self.target_url.clone(),
            scope: self.scope,
            has_credentials: self.credentials.is_some(),
            design_file_key: self.design_file_key.clone(),
            requirement_documents: self
                .requirements
                .as_ref()
                .map_or(0, RequirementsInput::document_count),
        }
    }
}

/// What a workflow was asked to do, without secrets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSummary {
    pub target_url: String,
    pub scope: WorkflowScope,
    pub has_credentials: bool,
    pub design_file_key: Option<String>,
    pub requirement_documents: usize,
}

/// Outcome of a single workflow step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub success: bool,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StepOutcome {
    pub fn succeeded(payload: serde_json::Value, started_at: DateTime<Utc>) -> Self {
        let finished_at = Utc::now();
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            started_at,
            finished_at,
            duration_ms: elapsed_ms(started_at, finished_at),
        }
    }

    pub fn failed(error: impl ToString, started_at: DateTime<Utc>) -> Self {
        let finished_at = Utc::now();
        Self {
            success: false,
            payload: None,
            error: Some(error.to_string()),
            started_at,
            finished_at,
            duration_ms: elapsed_ms(started_at, finished_at),
        }
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

/// A step outcome keyed by step name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub outcome: StepOutcome,
}

/// Tracked state of one workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: String,
    pub status: WorkflowState,
    pub progress: f64,
    pub current_step: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub request: RequestSummary,
    #[serde(default)]
    pub planned_steps: Vec<String>,
    /// Step outcomes in execution order
    #[serde(default)]
    pub results: Vec<StepResult>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl WorkflowRecord {
    pub fn new(request: &WorkflowRequest) -> Self {
        Self {
            workflow_id: Uuid::new_v4().to_string(),
            status: WorkflowState::Initializing,
            progress: 0.0,
            current_step: "Validating request".to_string(),
            start_time: Utc::now(),
            end_time: None,
            request: request.summary(),
            planned_steps: Vec::new(),
            results: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Move to the next state, rejecting backward or skipped transitions
    pub fn transition(&mut self, next: WorkflowState) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(())
    }

    /// Raise progress; lower values are ignored
    pub fn advance(&mut self, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        if progress > self.progress {
            self.progress = progress;
        }
    }

    pub fn record(&mut self, step: impl Into<String>, outcome: StepOutcome) {
        let step = step.into();
        if let Some(error) = &outcome.error {
            self.errors.push(format!("{}: {}", step, error));
        }
        self.results.push(StepResult { step, outcome });
    }

    pub fn result(&self, step: &str) -> Option<&StepOutcome> {
        self.results
            .iter()
            .find(|r| r.step == step)
            .map(|r| &r.outcome)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Short listing entry for a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub status: WorkflowState,
    pub progress: f64,
    pub current_step: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_count: usize,
}

impl From<&WorkflowRecord> for WorkflowSummary {
    fn from(record: &WorkflowRecord) -> Self {
        Self {
            workflow_id: record.workflow_id.clone(),
            status: record.status,
            progress: record.progress,
            current_step: record.current_step.clone(),
            start_time: record.start_time,
            end_time: record.end_time,
            error_count: record.errors.len(),
        }
    }
}

// ============================================================================
// Service health
// ============================================================================

/// Health of a downstream service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A downstream service with a health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub url: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl ServiceEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            health_path: default_health_path(),
        }
    }

    pub fn health_url(&self) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            self.health_path.trim_start_matches('/')
        )
    }
}

/// Result of probing one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealthRecord {
    pub name: String,
    pub url: String,
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ServiceHealthRecord {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Aggregated health of a set of services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub healthy_services: usize,
    pub unhealthy_services: usize,
    pub services: BTreeMap<String, ServiceHealthRecord>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn from_records(records: impl IntoIterator<Item = ServiceHealthRecord>) -> Self {
        let services: BTreeMap<String, ServiceHealthRecord> = records
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();
        let healthy_services = services.values().filter(|r| r.is_healthy()).count();
        let unhealthy_services = services.len() - healthy_services;
        Self {
            overall: if unhealthy_services == 0 {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            healthy_services,
            unhealthy_services,
            services,
            checked_at: Utc::now(),
        }
    }

    pub fn overall_healthy(&self) -> bool {
        self.overall == HealthStatus::Healthy
    }

    pub fn is_healthy(&self, service: &str) -> bool {
        self.services.get(service).map_or(false, |r| r.is_healthy())
    }
}

// ============================================================================
// Batches
// ============================================================================

/// Outcome of one batch item
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItem<T> {
    Succeeded { value: T },
    Failed { error: String },
}

impl<T> BatchItem<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchItem::Succeeded { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            BatchItem::Succeeded { value } => Some(value),
            BatchItem::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            BatchItem::Succeeded { .. } => None,
            BatchItem::Failed { error } => Some(error),
        }
    }
}

/// Ordered outcomes of a batch, aligned with its input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult<T> {
    pub items: Vec<BatchItem<T>>,
    pub succeeded: usize,
    pub failed: usize,
}

impl<T> BatchResult<T> {
    pub fn from_items(items: Vec<BatchItem<T>>) -> Self {
        let succeeded = items.iter().filter(|i| i.is_success()).count();
        let failed = items.len() - succeeded;
        Self {
            items,
            succeeded,
            failed,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    /// Successful values, in input order
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter_map(|i| i.value())
    }

    /// Input positions and messages of failed items
    pub fn failures(&self) -> impl Iterator<Item = (usize, &str)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(idx, i)| i.error().map(|e| (idx, e)))
    }

    /// Turn any failed item into a `PartialBatchFailure`
    pub fn ensure_complete(&self) -> Result<()> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(Error::PartialBatchFailure {
                failed: self.failed,
                total: self.items.len(),
            })
        }
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

/// Rate limit window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    Hour,
}

impl Window {
    pub fn secs(&self) -> i64 {
        match self {
            Window::Minute => 60,
            Window::Hour => 3600,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
        }
    }

    /// Bucket index containing the given unix time
    pub fn bucket(&self, unix_time: i64) -> i64 {
        unix_time.div_euclid(self.secs())
    }

    /// Unix time at which the bucket containing `unix_time` ends
    pub fn next_reset(&self, unix_time: i64) -> i64 {
        (self.bucket(unix_time) + 1) * self.secs()
    }
}

/// Usage of one window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowStatus {
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
    pub resets_at: DateTime<Utc>,
}

/// Rate limit usage for one provider/operation pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub provider: String,
    pub operation: String,
    pub current_minute: WindowStatus,
    pub current_hour: WindowStatus,
    /// Counter store that answered the query
    pub backend: String,
}
