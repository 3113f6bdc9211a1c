//! HTTP request layer

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use qaflow_common::{
    BatchResult, Credentials, DocumentParser, Error, ParsedDocument, RequirementsInput,
    UploadedDocument, WorkflowRequest, WorkflowScope, WorkflowState,
};
use qaflow_engine::{BatchCoordinator, RateLimiter, ServiceHealthAggregator, WorkflowCoordinator};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: WorkflowCoordinator,
    pub limiter: RateLimiter,
    pub health: ServiceHealthAggregator,
    pub batch: BatchCoordinator,
    pub parser: Arc<dyn DocumentParser>,
}

/// Error returned from handlers
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            Error::Provider { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Largest multipart body accepted when starting a workflow with uploads
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Build the router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/workflows",
            get(list_workflows_handler).post(start_workflow_handler),
        )
        .route(
            "/workflows/:workflow_id",
            get(workflow_status_handler).delete(remove_workflow_handler),
        )
        .route("/workflows/:workflow_id/results", get(workflow_results_handler))
        .route("/rate-limits/reset", post(reset_rate_limits_handler))
        .route("/rate-limits/:provider", get(rate_limit_status_handler))
        .route("/services/health", get(services_health_handler))
        .route("/documents/batch-parse", post(batch_parse_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` until the listener fails
pub async fn serve(addr: SocketAddr, router: Router) -> anyhow::Result<()> {
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "qaflow-orchestrator",
        "version": qaflow_common::VERSION,
    }))
}

// ============================================================================
// Workflows
// ============================================================================

async fn start_workflow_handler(
    State(state): State<AppState>,
    Json(request): Json<WorkflowRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = state.coordinator.start(request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "workflow_id": id, "status": "initializing" })),
    ))
}

/// Start a workflow from a multipart form
///
/// Text fields: `target_url`, `scope`, `design_file_key`, `credentials` (JSON)
/// and repeatable `user_stories`. Every `requirements_file` part becomes an
/// uploaded requirement document.
async fn start_with_upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let mut request = WorkflowRequest::default();
    let mut requirements = RequirementsInput::default();

    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "requirements_file" {
            let filename = field
                .file_name()
                .map(str::to_string)
                .ok_or_else(|| Error::Validation("requirements_file needs a filename".into()))?;
            let content_type = field.content_type().map(str::to_string);
            let content = field.bytes().await.map_err(bad_form)?.to_vec();
            requirements.uploads.push(UploadedDocument {
                filename,
                content_type,
                content,
            });
            continue;
        }

        let value = field.text().await.map_err(bad_form)?;
        match name.as_str() {
            "target_url" => request.target_url = value,
            "design_file_key" if !value.trim().is_empty() => {
                request.design_file_key = Some(value)
            }
            "scope" => request.scope = parse_scope(&value)?,
            "credentials" => {
                let credentials: Credentials = serde_json::from_str(&value)
                    .map_err(|e| Error::Validation(format!("invalid credentials JSON: {}", e)))?;
                request.credentials = Some(credentials);
            }
            "user_stories" => requirements.user_stories.push(value),
            _ => debug!("Ignoring form field {}", name),
        }
    }

    if !requirements.is_empty() {
        request.requirements = Some(requirements);
    }
    let id = state.coordinator.start(request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "workflow_id": id, "status": "initializing" })),
    ))
}

fn bad_form(err: axum::extract::multipart::MultipartError) -> ApiError {
    Error::Validation(format!("malformed form: {}", err)).into()
}

fn parse_scope(value: &str) -> qaflow_common::Result<WorkflowScope> {
    serde_json::from_value(json!(value.trim()))
        .map_err(|_| Error::Validation(format!("unknown workflow scope: {}", value)))
}

#[derive(Debug, Deserialize)]
struct QuickTestRequest {
    target_url: String,
    credentials: Option<Credentials>,
}

/// Analyze a site and generate tests, answering once the run is over
async fn quick_test_handler(
    State(state): State<AppState>,
    Json(quick): Json<QuickTestRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut request =
        WorkflowRequest::new(quick.target_url).with_scope(WorkflowScope::GenerateOnly);
    request.credentials = quick.credentials;

    let record = state.coordinator.run_to_completion(request).await?;
    let execution_time_ms = record
        .end_time
        .map(|end| (end - record.start_time).num_milliseconds());
    Ok(Json(json!({
        "success": record.status == WorkflowState::Completed && record.errors.is_empty(),
        "execution_time_ms": execution_time_ms,
        "errors": record.errors,
        "workflow": record,
    })))
}

async fn list_workflows_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.list())
}

async fn workflow_status_handler(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.status(&workflow_id)?))
}

async fn workflow_results_handler(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.results(&workflow_id)?))
}

async fn remove_workflow_handler(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let removed = state.coordinator.remove(&workflow_id)?;
    Ok(Json(json!({
        "workflow_id": removed.workflow_id,
        "removed": true,
    })))
}

// ============================================================================
// Rate limits
// ============================================================================

#[derive(Debug, Deserialize)]
struct StatusQuery {
    operation: Option<String>,
}

async fn rate_limit_status_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<StatusQuery>,
) -> impl IntoResponse {
    let operation = query.operation.as_deref().unwrap_or("generate");
    Json(state.limiter.status(&provider, operation).await)
}

#[derive(Debug, Default, Deserialize)]
struct ResetRequest {
    provider: Option<String>,
}

async fn reset_rate_limits_handler(
    State(state): State<AppState>,
    body: Option<Json<ResetRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let cleared = state.limiter.reset(request.provider.as_deref()).await;
    Json(json!({
        "provider": request.provider,
        "cleared": cleared,
    }))
}

// ============================================================================
// Services and documents
// ============================================================================

async fn services_health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.check_all().await;
    let status = if report.overall_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

#[derive(Debug, Deserialize)]
struct BatchParseRequest {
    paths: Vec<String>,
}

async fn batch_parse_handler(
    State(state): State<AppState>,
    Json(request): Json<BatchParseRequest>,
) -> ApiResult<Json<BatchResult<ParsedDocument>>> {
    if request.paths.is_empty() {
        return Err(Error::Validation("paths must not be empty".to_string()).into());
    }

    let parser = state.parser.clone();
    let result = state
        .batch
        .run_batch(request.paths, |path| {
            let parser = parser.clone();
            async move {
                let doc = parser.parse(&path).await?;
                if !doc.success {
                    return Err(Error::provider(
                        "document_parser",
                        doc.error_message
                            .unwrap_or_else(|| format!("could not parse {}", path)),
                    ));
                }
                Ok(doc)
            }
        })
        .await;
    Ok(Json(result))
}
