//! Daemon configuration

use anyhow::Context;
use qaflow_engine::{HealthConfig, RateLimitConfig, WorkflowConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the design API token
pub const DESIGN_TOKEN_ENV: &str = "QAFLOW_DESIGN_TOKEN";

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Provider quotas
    pub rate_limits: RateLimitConfig,

    /// Downstream services probed for health
    pub services: HealthConfig,

    /// Workflow execution
    pub workflow: WorkflowConfig,

    /// Remote service clients
    pub clients: ClientsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8006".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Keep rate limit counters in the store database so that several
    /// daemons pointed at the same store share quotas
    pub shared_counters: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_path: qaflow_common::default_store_path(),
            shared_counters: true,
        }
    }
}

/// Remote service client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientsConfig {
    /// Design tool REST API base URL
    pub design_api_url: String,

    /// Design tool API token (prefer the environment variable)
    pub design_token: Option<String>,

    pub auth_manager_url: String,
    pub website_analyzer_url: String,
    pub document_parser_url: String,
    pub llm_url: String,
    pub test_executor_url: String,

    /// Timeout for a single remote request
    pub request_timeout_secs: u64,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            design_api_url: "https://api.figma.com/v1".to_string(),
            design_token: None,
            auth_manager_url: "http://localhost:8007".to_string(),
            website_analyzer_url: "http://localhost:3001".to_string(),
            document_parser_url: "http://localhost:8002".to_string(),
            llm_url: "http://localhost:8005".to_string(),
            test_executor_url: "http://localhost:3003".to_string(),
            request_timeout_secs: 120,
        }
    }
}

impl ClientsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Self = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Fill secrets from the environment
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(DESIGN_TOKEN_ENV) {
            if !token.trim().is_empty() {
                self.clients.design_token = Some(token);
            }
        }
    }

    /// Reject configurations the daemon cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;
        self.rate_limits.validate()?;
        self.services.validate()?;
        self.workflow.validate()?;
        if self.clients.request_timeout_secs == 0 {
            anyhow::bail!("clients.request_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .with_context(|| format!("invalid listen address: {}", self.server.listen))
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.storage.store_path.join("state.db")
    }
}
