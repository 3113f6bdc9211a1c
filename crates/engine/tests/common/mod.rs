//! In-process stand-ins for the remote services

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use qaflow_common::{
    AuthSession, Authenticator, Credentials, DesignSource, DocumentParser, Error,
    ExecutionReport, LlmClient, LlmRequest, LlmResponse, ParsedDocument, Result, SiteAnalyzer,
    TestExecutor, UploadedDocument, WorkflowRecord,
};
use qaflow_engine::{ServiceClients, WorkflowCoordinator};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// How the fake services misbehave
#[derive(Debug, Default, Clone)]
pub struct Script {
    pub auth_fails: bool,
    pub site_fails: bool,
    pub site_panics: bool,
    pub llm_hangs: bool,
    pub failing_documents: Vec<String>,
    pub failing_frames: Vec<String>,
    /// Added to every call
    pub latency: Duration,
}

pub struct FakeServices {
    script: Script,
    calls: Mutex<Vec<String>>,
}

impl FakeServices {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn clients(self: &Arc<Self>) -> ServiceClients {
        ServiceClients {
            authenticator: self.clone(),
            site_analyzer: self.clone(),
            design: self.clone(),
            parser: self.clone(),
            llm: self.clone(),
            executor: self.clone(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called(&self, name: &str) -> bool {
        self.calls.lock().iter().any(|c| c == name)
    }

    async fn enter(&self, name: &str) {
        self.calls.lock().push(name.to_string());
        if !self.script.latency.is_zero() {
            tokio::time::sleep(self.script.latency).await;
        }
    }
}

pub fn design_file() -> Value {
    json!({
        "name": "Storefront",
        "document": {
            "children": [{
                "type": "CANVAS",
                "name": "Flows",
                "children": [
                    { "type": "FRAME", "id": "1:1", "name": "Login" },
                    { "type": "FRAME", "id": "1:2", "name": "Cart" },
                    { "type": "FRAME", "id": "1:3", "name": "Checkout" }
                ]
            }]
        }
    })
}

#[async_trait]
impl Authenticator for FakeServices {
    async fn authenticate(&self, _url: &str, credentials: &Credentials) -> Result<AuthSession> {
        self.enter("authenticate").await;
        if self.script.auth_fails {
            return Ok(AuthSession {
                success: false,
                error_message: Some(format!("bad password for {}", credentials.username)),
                ..Default::default()
            });
        }
        Ok(AuthSession {
            success: true,
            session_cookies: HashMap::from([("sid".to_string(), "abc".to_string())]),
            auth_method: Some("form_based".to_string()),
            error_message: None,
        })
    }
}

#[async_trait]
impl SiteAnalyzer for FakeServices {
    async fn analyze(&self, url: &str, _session: Option<&AuthSession>) -> Result<Value> {
        self.enter("analyze").await;
        if self.script.site_panics {
            panic!("analyzer crashed");
        }
        if self.script.site_fails {
            return Err(Error::provider("website_analyzer", "HTTP 500"));
        }
        Ok(json!({ "url": url, "pages": 4 }))
    }
}

#[async_trait]
impl DesignSource for FakeServices {
    async fn get_file(&self, _file_key: &str) -> Result<Value> {
        self.enter("get_file").await;
        Ok(design_file())
    }

    async fn get_images(
        &self,
        file_key: &str,
        node_ids: &[String],
    ) -> Result<HashMap<String, Option<String>>> {
        self.enter("get_images").await;
        if node_ids
            .iter()
            .any(|id| self.script.failing_frames.contains(id))
        {
            return Err(Error::provider("figma_service", "render failed"));
        }
        Ok(node_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    Some(format!("https://img.example/{}/{}.png", file_key, id)),
                )
            })
            .collect())
    }
}

#[async_trait]
impl DocumentParser for FakeServices {
    async fn parse(&self, path: &str) -> Result<ParsedDocument> {
        self.enter("parse").await;
        if self.script.failing_documents.iter().any(|p| p == path) {
            return Ok(ParsedDocument {
                path: path.to_string(),
                success: false,
                error_message: Some("unsupported format".to_string()),
                ..Default::default()
            });
        }
        Ok(ParsedDocument {
            path: path.to_string(),
            text: format!("requirements from {}", path),
            success: true,
            ..Default::default()
        })
    }

    async fn parse_upload(&self, upload: &UploadedDocument) -> Result<ParsedDocument> {
        self.enter("parse_upload").await;
        if self.script.failing_documents.contains(&upload.filename) {
            return Ok(ParsedDocument {
                path: upload.filename.clone(),
                success: false,
                error_message: Some("unsupported format".to_string()),
                ..Default::default()
            });
        }
        Ok(ParsedDocument {
            path: upload.filename.clone(),
            text: String::from_utf8_lossy(&upload.content).into_owned(),
            success: true,
            ..Default::default()
        })
    }
}

#[async_trait]
impl LlmClient for FakeServices {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.enter("generate").await;
        if self.script.llm_hangs {
            futures::future::pending::<()>().await;
        }
        let content = if request.context.get("execution").is_some() {
            "All good except checkout".to_string()
        } else {
            json!({ "tests": [{ "name": "login works" }, { "name": "cart adds item" }] })
                .to_string()
        };
        Ok(LlmResponse {
            content,
            tokens_used: 120,
            processing_time_ms: 15,
        })
    }
}

#[async_trait]
impl TestExecutor for FakeServices {
    async fn execute(
        &self,
        suite: &Value,
        _session: Option<&AuthSession>,
    ) -> Result<ExecutionReport> {
        self.enter("execute").await;
        let total = suite
            .get("tests")
            .and_then(Value::as_array)
            .map_or(0, |t| t.len() as u32);
        Ok(ExecutionReport {
            status: "completed".to_string(),
            total_tests: total,
            passed_tests: total.saturating_sub(1),
            failed_tests: total.min(1),
            test_results: Vec::new(),
        })
    }
}

/// Poll until the workflow reaches a terminal state
pub async fn wait_for_terminal(coordinator: &WorkflowCoordinator, id: &str) -> WorkflowRecord {
    for _ in 0..60_000 {
        let record = coordinator.status(id).unwrap();
        if record.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {} did not finish", id);
}
