//! Workflow pipeline steps

use crate::batch::BatchCoordinator;
use crate::config::{RateLimitPolicy, WorkflowConfig};
use crate::rate_limiter::RateLimiter;
use qaflow_common::{
    AuthSession, Authenticator, DesignSource, DocumentParser, Error, ExecutionReport, LlmClient,
    LlmRequest, Result, SiteAnalyzer, TestExecutor, UploadedDocument, WorkflowRequest,
    WorkflowScope,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One stage of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Authentication,
    WebsiteAnalysis,
    DesignAnalysis,
    RequirementsAnalysis,
    TestGeneration,
    TestExecution,
    ResultsAnalysis,
    Report,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Authentication => "authentication",
            StepKind::WebsiteAnalysis => "website_analysis",
            StepKind::DesignAnalysis => "design_analysis",
            StepKind::RequirementsAnalysis => "requirements_analysis",
            StepKind::TestGeneration => "test_generation",
            StepKind::TestExecution => "test_execution",
            StepKind::ResultsAnalysis => "results_analysis",
            StepKind::Report => "report",
        }
    }

    /// Text shown as the workflow's current step while this one runs
    pub fn description(&self) -> &'static str {
        match self {
            StepKind::Authentication => "Authenticating with target site",
            StepKind::WebsiteAnalysis => "Analyzing website",
            StepKind::DesignAnalysis => "Analyzing design file",
            StepKind::RequirementsAnalysis => "Analyzing requirements",
            StepKind::TestGeneration => "Generating tests",
            StepKind::TestExecution => "Executing tests",
            StepKind::ResultsAnalysis => "Analyzing test results",
            StepKind::Report => "Building report",
        }
    }

    /// A failed fatal step ends the workflow as failed
    pub fn is_fatal(&self) -> bool {
        matches!(self, StepKind::Authentication)
    }

    /// Downstream service the step depends on
    pub fn required_service(&self) -> Option<&'static str> {
        match self {
            StepKind::Authentication => Some("auth_manager"),
            StepKind::WebsiteAnalysis => Some("website_analyzer"),
            StepKind::DesignAnalysis => Some("figma_service"),
            StepKind::RequirementsAnalysis => Some("document_parser"),
            StepKind::TestGeneration | StepKind::ResultsAnalysis => Some("llm_integration"),
            StepKind::TestExecution => Some("test_executor"),
            StepKind::Report => None,
        }
    }
}

type StepPredicate = fn(&WorkflowRequest) -> bool;

fn always(_: &WorkflowRequest) -> bool {
    true
}

fn has_credentials(r: &WorkflowRequest) -> bool {
    r.credentials.is_some()
}

fn has_design(r: &WorkflowRequest) -> bool {
    r.design_file_key.is_some()
}

/// Where a requirement document comes from
enum DocumentSource {
    Path(String),
    Upload(UploadedDocument),
}

impl DocumentSource {
    fn name(&self) -> &str {
        match self {
            DocumentSource::Path(path) => path,
            DocumentSource::Upload(upload) => &upload.filename,
        }
    }
}

fn has_requirements(r: &WorkflowRequest) -> bool {
    r.requirements.is_some()
}

fn full_scope(r: &WorkflowRequest) -> bool {
    r.scope == WorkflowScope::Full
}

const PIPELINE: &[(StepKind, StepPredicate)] = &[
    (StepKind::Authentication, has_credentials),
    (StepKind::WebsiteAnalysis, always),
    (StepKind::DesignAnalysis, has_design),
    (StepKind::RequirementsAnalysis, has_requirements),
    (StepKind::TestGeneration, always),
    (StepKind::TestExecution, full_scope),
    (StepKind::ResultsAnalysis, full_scope),
    (StepKind::Report, always),
];

/// Steps a request will run, in order
pub fn plan(request: &WorkflowRequest) -> Vec<StepKind> {
    PIPELINE
        .iter()
        .filter(|(_, applies)| applies(request))
        .map(|(kind, _)| *kind)
        .collect()
}

/// Clients for every remote service a workflow uses
#[derive(Clone)]
pub struct ServiceClients {
    pub authenticator: Arc<dyn Authenticator>,
    pub site_analyzer: Arc<dyn SiteAnalyzer>,
    pub design: Arc<dyn DesignSource>,
    pub parser: Arc<dyn DocumentParser>,
    pub llm: Arc<dyn LlmClient>,
    pub executor: Arc<dyn TestExecutor>,
}

/// Result of a successful step
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub payload: Value,
    /// Non-fatal problems, such as some batch items failing
    pub warnings: Vec<String>,
}

impl StepOutput {
    fn new(payload: Value) -> Self {
        Self {
            payload,
            warnings: Vec::new(),
        }
    }
}

/// State carried between the steps of one run
pub struct RunContext {
    pub workflow_id: String,
    pub request: WorkflowRequest,
    pub session: Option<AuthSession>,
    outputs: HashMap<StepKind, Value>,
    completed: Vec<(StepKind, bool, u64)>,
}

impl RunContext {
    pub fn new(workflow_id: String, request: WorkflowRequest) -> Self {
        Self {
            workflow_id,
            request,
            session: None,
            outputs: HashMap::new(),
            completed: Vec::new(),
        }
    }

    pub fn output(&self, kind: StepKind) -> Option<&Value> {
        self.outputs.get(&kind)
    }

    pub fn finish(&mut self, kind: StepKind, payload: Option<Value>, duration_ms: u64) {
        let success = payload.is_some();
        if let Some(payload) = payload {
            self.outputs.insert(kind, payload);
        }
        self.completed.push((kind, success, duration_ms));
    }
}

/// A frame on a design page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignFrame {
    pub id: String,
    pub name: String,
    pub page: String,
}

/// Top-level frames of every canvas page in a design document
pub fn extract_frames(file: &Value) -> Vec<DesignFrame> {
    let pages = file
        .pointer("/document/children")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    pages
        .iter()
        .filter(|page| page.get("type").and_then(Value::as_str) == Some("CANVAS"))
        .flat_map(|page| {
            let page_name = page
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            page.get("children")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter(|node| node.get("type").and_then(Value::as_str) == Some("FRAME"))
                .filter_map(move |node| {
                    Some(DesignFrame {
                        id: node.get("id")?.as_str()?.to_string(),
                        name: node
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        page: page_name.clone(),
                    })
                })
        })
        .collect()
}

/// Executes individual steps against the remote services
#[derive(Clone)]
pub struct StepRunner {
    clients: ServiceClients,
    limiter: RateLimiter,
    batch: BatchCoordinator,
    config: WorkflowConfig,
}

impl StepRunner {
    pub fn new(
        clients: ServiceClients,
        limiter: RateLimiter,
        batch: BatchCoordinator,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            clients,
            limiter,
            batch,
            config,
        }
    }

    pub async fn run(&self, kind: StepKind, ctx: &mut RunContext) -> Result<StepOutput> {
        match kind {
            StepKind::Authentication => self.authenticate(ctx).await,
            StepKind::WebsiteAnalysis => self.analyze_website(ctx).await,
            StepKind::DesignAnalysis => self.analyze_design(ctx).await,
            StepKind::RequirementsAnalysis => self.analyze_requirements(ctx).await,
            StepKind::TestGeneration => self.generate_tests(ctx).await,
            StepKind::TestExecution => self.execute_tests(ctx).await,
            StepKind::ResultsAnalysis => self.analyze_results(ctx).await,
            StepKind::Report => Ok(StepOutput::new(build_report(ctx))),
        }
    }

    /// Apply the configured policy to one unit of provider quota
    async fn acquire(&self, provider: &str, operation: &str) -> Result<()> {
        let allowed = match self.config.rate_limit_policy {
            RateLimitPolicy::FailFast => self.limiter.allow(provider, operation).await,
            RateLimitPolicy::Wait { max_wait_secs } => {
                self.limiter
                    .wait_until_allowed(provider, operation, Duration::from_secs(max_wait_secs))
                    .await
            }
        };

        if allowed {
            Ok(())
        } else {
            Err(Error::rate_limited(provider, operation))
        }
    }

    /// Bound one downstream call by the step timeout
    async fn call<T>(&self, request: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.step_timeout();
        tokio::time::timeout(limit, request)
            .await
            .map_err(|_| Error::Timeout {
                seconds: limit.as_secs(),
            })?
    }

    async fn authenticate(&self, ctx: &mut RunContext) -> Result<StepOutput> {
        let credentials = ctx
            .request
            .credentials
            .as_ref()
            .ok_or_else(|| Error::Validation("no credentials supplied".to_string()))?;

        let session = self
            .call(
                self.clients
                    .authenticator
                    .authenticate(&ctx.request.target_url, credentials),
            )
            .await?;

        if !session.success {
            return Err(Error::provider(
                "auth_manager",
                session
                    .error_message
                    .as_deref()
                    .unwrap_or("authentication rejected"),
            ));
        }

        info!(
            "Workflow {} authenticated via {}",
            ctx.workflow_id,
            session.auth_method.as_deref().unwrap_or("unknown method")
        );
        let payload = json!({
            "success": true,
            "auth_method": session.auth_method,
            "cookie_count": session.session_cookies.len(),
        });
        ctx.session = Some(session);
        Ok(StepOutput::new(payload))
    }

    async fn analyze_website(&self, ctx: &mut RunContext) -> Result<StepOutput> {
        let analysis = self
            .call(
                self.clients
                    .site_analyzer
                    .analyze(&ctx.request.target_url, ctx.session.as_ref()),
            )
            .await?;
        Ok(StepOutput::new(analysis))
    }

    async fn analyze_design(&self, ctx: &mut RunContext) -> Result<StepOutput> {
        let file_key = ctx
            .request
            .design_file_key
            .clone()
            .ok_or_else(|| Error::Validation("no design file key supplied".to_string()))?;
        let provider = self.config.design_provider.as_str();

        self.acquire(provider, "get_file").await?;
        let file = self.call(self.clients.design.get_file(&file_key)).await?;
        let frames = extract_frames(&file);
        debug!("Design {} has {} frames", file_key, frames.len());

        let chunks: Vec<Vec<DesignFrame>> = frames
            .chunks(self.config.image_batch_size.max(1))
            .map(<[DesignFrame]>::to_vec)
            .collect();

        let renders = self
            .batch
            .run_batch(chunks, |chunk| {
                let file_key = file_key.clone();
                async move {
                    self.acquire(provider, "get_images").await?;
                    let ids: Vec<String> = chunk.iter().map(|f| f.id.clone()).collect();
                    self.call(self.clients.design.get_images(&file_key, &ids))
                        .await
                }
            })
            .await;

        let mut images: HashMap<String, Option<String>> = HashMap::new();
        for rendered in renders.values() {
            images.extend(rendered.clone());
        }

        let frames_json: Vec<Value> = frames
            .iter()
            .map(|frame| {
                json!({
                    "id": frame.id,
                    "name": frame.name,
                    "page": frame.page,
                    "image_url": images.get(&frame.id).cloned().flatten(),
                })
            })
            .collect();

        let mut output = StepOutput::new(json!({
            "file_key": file_key,
            "name": file.get("name").cloned().unwrap_or(Value::Null),
            "frame_count": frames.len(),
            "frames": frames_json,
            "render_batches": renders.len(),
            "failed_render_batches": renders.failed,
        }));

        if !renders.is_complete() {
            let detail = renders
                .failures()
                .map(|(idx, e)| format!("batch {}: {}", idx, e))
                .collect::<Vec<_>>()
                .join("; ");
            warn!(
                "Workflow {}: {} of {} render batches failed",
                ctx.workflow_id,
                renders.failed,
                renders.len()
            );
            output.warnings.push(format!(
                "design_analysis: {} of {} frame render batches failed ({})",
                renders.failed,
                renders.len(),
                detail
            ));
        }
        Ok(output)
    }

    async fn analyze_requirements(&self, ctx: &mut RunContext) -> Result<StepOutput> {
        let requirements = ctx.request.requirements.clone().unwrap_or_default();

        let sources: Vec<DocumentSource> = requirements
            .documents
            .iter()
            .cloned()
            .map(DocumentSource::Path)
            .chain(requirements.uploads.iter().cloned().map(DocumentSource::Upload))
            .collect();
        let names: Vec<String> = sources.iter().map(|s| s.name().to_string()).collect();

        let parsed = self
            .batch
            .run_batch(sources, |source| async move {
                let doc = match &source {
                    DocumentSource::Path(path) => self.call(self.clients.parser.parse(path)).await?,
                    DocumentSource::Upload(upload) => {
                        self.call(self.clients.parser.parse_upload(upload)).await?
                    }
                };
                if doc.success {
                    Ok(doc)
                } else {
                    Err(Error::provider(
                        "document_parser",
                        doc.error_message
                            .unwrap_or_else(|| format!("failed to parse {}", source.name())),
                    ))
                }
            })
            .await;

        let failed_documents: Vec<Value> = parsed
            .failures()
            .map(|(idx, error)| {
                json!({
                    "path": names.get(idx),
                    "error": error,
                })
            })
            .collect();

        let mut output = StepOutput::new(json!({
            "documents": parsed.values().collect::<Vec<_>>(),
            "failed_documents": failed_documents,
            "user_stories": requirements.user_stories,
            "business_requirements": requirements.business_requirements,
            "parsed": parsed.succeeded,
            "failed": parsed.failed,
        }));

        if !parsed.is_complete() {
            output.warnings.push(format!(
                "requirements_analysis: {} of {} documents failed to parse",
                parsed.failed,
                parsed.len()
            ));
        }
        Ok(output)
    }

    async fn generate_tests(&self, ctx: &mut RunContext) -> Result<StepOutput> {
        self.acquire(&self.config.llm_provider, "generate").await?;

        let context = json!({
            "target_url": ctx.request.target_url,
            "website": ctx.output(StepKind::WebsiteAnalysis),
            "design": ctx.output(StepKind::DesignAnalysis),
            "requirements": ctx.output(StepKind::RequirementsAnalysis),
            "options": ctx.request.options,
        });
        let request = LlmRequest::new(
            format!(
                "Generate executable UI test cases for {} from the supplied analysis.",
                ctx.request.target_url
            ),
            context,
        );

        let response = self.call(self.clients.llm.generate(request)).await?;
        let suite = serde_json::from_str::<Value>(&response.content)
            .unwrap_or_else(|_| json!({ "raw": response.content }));

        Ok(StepOutput::new(json!({
            "test_suite": suite,
            "tokens_used": response.tokens_used,
            "processing_time_ms": response.processing_time_ms,
        })))
    }

    async fn execute_tests(&self, ctx: &mut RunContext) -> Result<StepOutput> {
        let suite = ctx
            .output(StepKind::TestGeneration)
            .and_then(|out| out.get("test_suite"))
            .cloned()
            .ok_or_else(|| Error::Validation("no generated test suite to execute".to_string()))?;

        let report = self
            .call(self.clients.executor.execute(&suite, ctx.session.as_ref()))
            .await?;
        info!(
            "Workflow {}: {}/{} tests passed",
            ctx.workflow_id, report.passed_tests, report.total_tests
        );
        Ok(StepOutput::new(serde_json::to_value(&report)?))
    }

    async fn analyze_results(&self, ctx: &mut RunContext) -> Result<StepOutput> {
        let execution = ctx
            .output(StepKind::TestExecution)
            .cloned()
            .ok_or_else(|| Error::Validation("no test execution results to analyze".to_string()))?;

        self.acquire(&self.config.llm_provider, "analyze").await?;
        let request = LlmRequest::new(
            "Summarize these UI test results and suggest fixes for the failures.",
            json!({ "execution": execution }),
        );
        let response = self.call(self.clients.llm.generate(request)).await?;

        Ok(StepOutput::new(json!({
            "analysis": response.content,
            "tokens_used": response.tokens_used,
        })))
    }
}

fn build_report(ctx: &RunContext) -> Value {
    let steps: Vec<Value> = ctx
        .completed
        .iter()
        .map(|(kind, success, duration_ms)| {
            json!({ "step": kind.name(), "success": success, "duration_ms": duration_ms })
        })
        .collect();
    let succeeded = ctx.completed.iter().filter(|(_, ok, _)| *ok).count();

    let execution: Option<ExecutionReport> = ctx
        .output(StepKind::TestExecution)
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let tests = execution.map(|report| {
        json!({
            "total": report.total_tests,
            "passed": report.passed_tests,
            "failed": report.failed_tests,
            "pass_rate": report.pass_rate(),
        })
    });

    json!({
        "workflow_id": ctx.workflow_id,
        "target_url": ctx.request.target_url,
        "summary": {
            "steps_succeeded": succeeded,
            "steps_failed": ctx.completed.len() - succeeded,
        },
        "steps": steps,
        "test_suite_generated": ctx.output(StepKind::TestGeneration).is_some(),
        "tests": tests,
        "analysis": ctx
            .output(StepKind::ResultsAnalysis)
            .and_then(|v| v.get("analysis"))
            .cloned(),
    })
}
