//! Interfaces to the remote services a workflow drives
//!
//! Each trait is a narrow view of one external HTTP service. The daemon
//! provides `reqwest` implementations; tests substitute in-process fakes.

use crate::{Credentials, Result, UploadedDocument};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Session established against the system under test
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSession {
    pub success: bool,
    #[serde(default)]
    pub session_cookies: HashMap<String, String>,
    #[serde(default)]
    pub auth_method: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Output of the document parser for one file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub path: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub sections: Vec<serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Prompt sent to the language model service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    #[serde(default)]
    pub context: serde_json::Value,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            prompt: prompt.into(),
            context,
            max_tokens: 4000,
            temperature: 0.3,
        }
    }
}

/// Completion returned by the language model service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub processing_time_ms: u64,
}

/// Result of running a test suite
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionReport {
    pub status: String,
    pub total_tests: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    pub test_results: Vec<serde_json::Value>,
}

impl ExecutionReport {
    pub fn pass_rate(&self) -> f64 {
        if self.total_tests == 0 {
            0.0
        } else {
            f64::from(self.passed_tests) / f64::from(self.total_tests)
        }
    }
}

/// Design tool API (files and rendered frames)
#[async_trait]
pub trait DesignSource: Send + Sync {
    /// Fetch the full document tree of a design file
    async fn get_file(&self, file_key: &str) -> Result<serde_json::Value>;

    /// Render the given nodes; a node the service could not render maps to `None`
    async fn get_images(
        &self,
        file_key: &str,
        node_ids: &[String],
    ) -> Result<HashMap<String, Option<String>>>;
}

/// Requirement document parser
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, path: &str) -> Result<ParsedDocument>;

    /// Parse a document whose bytes came with the request
    async fn parse_upload(&self, upload: &UploadedDocument) -> Result<ParsedDocument>;
}

/// Language model integration
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse>;
}

/// Runs generated test suites against the target site
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(
        &self,
        suite: &serde_json::Value,
        session: Option<&AuthSession>,
    ) -> Result<ExecutionReport>;
}

/// Logs into the target site
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, url: &str, credentials: &Credentials) -> Result<AuthSession>;
}

/// Crawls and describes the target site
#[async_trait]
pub trait SiteAnalyzer: Send + Sync {
    async fn analyze(&self, url: &str, session: Option<&AuthSession>)
        -> Result<serde_json::Value>;
}
