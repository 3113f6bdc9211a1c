//! HTTP clients for the remote services
//!
//! Thin protocol wrappers: every non-2xx response becomes `Error::Provider`.

use crate::config::ClientsConfig;
use async_trait::async_trait;
use qaflow_common::{
    AuthSession, Authenticator, Credentials, DesignSource, DocumentParser, Error,
    ExecutionReport, LlmClient, LlmRequest, LlmResponse, ParsedDocument, Result, SiteAnalyzer,
    TestExecutor, UploadedDocument,
};
use qaflow_engine::ServiceClients;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Build clients for every remote service
pub fn build_clients(config: &ClientsConfig) -> Result<ServiceClients> {
    let http = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

    let service = |name: &'static str, base_url: &str| {
        Arc::new(ServiceClient {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            http: http.clone(),
        })
    };

    Ok(ServiceClients {
        authenticator: service("auth_manager", &config.auth_manager_url),
        site_analyzer: service("website_analyzer", &config.website_analyzer_url),
        design: Arc::new(DesignApiClient {
            base_url: config.design_api_url.trim_end_matches('/').to_string(),
            token: config.design_token.clone(),
            http: http.clone(),
        }),
        parser: service("document_parser", &config.document_parser_url),
        llm: service("llm_integration", &config.llm_url),
        executor: service("test_executor", &config.test_executor_url),
    })
}

async fn read_json<T: DeserializeOwned>(service: &str, resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::provider(
            service,
            format!("HTTP {}: {}", status.as_u16(), body.trim()),
        ));
    }
    resp.json::<T>()
        .await
        .map_err(|e| Error::provider(service, format!("invalid response: {}", e)))
}

// ============================================================================
// Internal services
// ============================================================================

/// Client for one of the pipeline's own HTTP services
pub struct ServiceClient {
    name: &'static str,
    base_url: String,
    http: reqwest::Client,
}

impl ServiceClient {
    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::provider(self.name, e))?;
        read_json(self.name, resp).await
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: reqwest::multipart::Form,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {} (multipart)", url);
        let resp = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::provider(self.name, e))?;
        read_json(self.name, resp).await
    }
}

fn cookie_list(session: Option<&AuthSession>) -> Vec<Value> {
    session
        .map(|s| {
            s.session_cookies
                .iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct AuthReply {
    success: bool,
    #[serde(default)]
    cookies: Vec<Value>,
    #[serde(default)]
    auth_method: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl Authenticator for ServiceClient {
    async fn authenticate(&self, url: &str, credentials: &Credentials) -> Result<AuthSession> {
        let reply: AuthReply = self
            .post(
                "/authenticate",
                &json!({
                    "url": url,
                    "username": credentials.username,
                    "password": credentials.password,
                    "auth_type": credentials.auth_type,
                    "additional_fields": credentials.additional_fields,
                }),
            )
            .await?;

        let session_cookies = reply
            .cookies
            .iter()
            .filter_map(|c| {
                Some((
                    c.get("name")?.as_str()?.to_string(),
                    c.get("value")?.as_str()?.to_string(),
                ))
            })
            .collect::<HashMap<_, _>>();

        Ok(AuthSession {
            success: reply.success,
            session_cookies,
            auth_method: reply.auth_method.or_else(|| Some(credentials.auth_type.clone())),
            error_message: reply.error,
        })
    }
}

#[async_trait]
impl SiteAnalyzer for ServiceClient {
    async fn analyze(&self, url: &str, session: Option<&AuthSession>) -> Result<Value> {
        self.post(
            "/analyze",
            &json!({ "url": url, "cookies": cookie_list(session) }),
        )
        .await
    }
}

#[derive(Deserialize)]
struct ParseReply {
    success: bool,
    #[serde(default)]
    document: Option<ParsedBody>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ParsedBody {
    #[serde(default)]
    content: ParsedContent,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Default, Deserialize)]
struct ParsedContent {
    #[serde(default)]
    text: String,
    #[serde(default)]
    sections: Vec<Value>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

impl ParseReply {
    fn into_document(self, path: &str) -> ParsedDocument {
        let (content, doc_error) = match self.document {
            Some(body) => (body.content, body.error_message),
            None => (ParsedContent::default(), None),
        };
        ParsedDocument {
            path: path.to_string(),
            text: content.text,
            sections: content.sections,
            metadata: content.metadata,
            success: self.success,
            error_message: self.error.or(doc_error),
        }
    }
}

#[async_trait]
impl DocumentParser for ServiceClient {
    async fn parse(&self, path: &str) -> Result<ParsedDocument> {
        let reply: ParseReply = self
            .post("/parse/file", &json!({ "file_path": path }))
            .await?;
        Ok(reply.into_document(path))
    }

    async fn parse_upload(&self, upload: &UploadedDocument) -> Result<ParsedDocument> {
        let mut part = reqwest::multipart::Part::bytes(upload.content.clone())
            .file_name(upload.filename.clone());
        if let Some(content_type) = &upload.content_type {
            part = part
                .mime_str(content_type)
                .map_err(|e| Error::Validation(format!("bad content type: {}", e)))?;
        }
        let form = reqwest::multipart::Form::new().part("file", part);
        let reply: ParseReply = self.post_form("/parse/upload", form).await?;
        Ok(reply.into_document(&upload.filename))
    }
}

#[derive(Deserialize)]
struct GenerateReply {
    response: GenerateBody,
}

#[derive(Deserialize)]
struct GenerateBody {
    content: String,
    #[serde(default)]
    tokens_used: u64,
    /// Seconds
    #[serde(default)]
    processing_time: f64,
}

#[async_trait]
impl LlmClient for ServiceClient {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        let reply: GenerateReply = self
            .post("/llm/generate", &serde_json::to_value(&request)?)
            .await?;
        Ok(LlmResponse {
            content: reply.response.content,
            tokens_used: reply.response.tokens_used,
            processing_time_ms: (reply.response.processing_time * 1000.0).max(0.0) as u64,
        })
    }
}

#[async_trait]
impl TestExecutor for ServiceClient {
    async fn execute(&self, suite: &Value, session: Option<&AuthSession>) -> Result<ExecutionReport> {
        self.post(
            "/execute",
            &json!({ "test_suite": suite, "session_cookies": cookie_list(session) }),
        )
        .await
    }
}

// ============================================================================
// Design API
// ============================================================================

/// Client for the design tool's REST API
pub struct DesignApiClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ImagesReply {
    #[serde(default)]
    err: Option<String>,
    #[serde(default)]
    images: HashMap<String, Option<String>>,
}

impl DesignApiClient {
    fn get(&self, url: String) -> Result<reqwest::RequestBuilder> {
        let token = self.token.as_deref().ok_or_else(|| {
            Error::provider("figma_service", "no design API token configured")
        })?;
        debug!("GET {}", url);
        Ok(self.http.get(url).header("X-Figma-Token", token))
    }
}

#[async_trait]
impl DesignSource for DesignApiClient {
    async fn get_file(&self, file_key: &str) -> Result<Value> {
        let resp = self
            .get(format!("{}/files/{}", self.base_url, file_key))?
            .send()
            .await
            .map_err(|e| Error::provider("figma_service", e))?;
        read_json("figma_service", resp).await
    }

    async fn get_images(
        &self,
        file_key: &str,
        node_ids: &[String],
    ) -> Result<HashMap<String, Option<String>>> {
        let resp = self
            .get(format!("{}/images/{}", self.base_url, file_key))?
            .query(&[
                ("ids", node_ids.join(",")),
                ("format", "png".to_string()),
                ("scale", "1".to_string()),
            ])
            .send()
            .await
            .map_err(|e| Error::provider("figma_service", e))?;

        let reply: ImagesReply = read_json("figma_service", resp).await?;
        if let Some(err) = reply.err {
            return Err(Error::provider("figma_service", err));
        }

        let mut images = reply.images;
        for id in node_ids {
            images.entry(id.clone()).or_insert(None);
        }
        Ok(images)
    }
}
