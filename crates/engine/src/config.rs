//! Engine configuration

use qaflow_common::{Error, Result, ServiceEndpoint};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Quota for one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLimits {
    pub per_minute: u64,
    pub per_hour: u64,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_hour: 1000,
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Limits for providers without an explicit entry
    pub default: ProviderLimits,
    /// Per-provider overrides
    pub providers: HashMap<String, ProviderLimits>,
}

impl RateLimitConfig {
    pub fn limits_for(&self, provider: &str) -> ProviderLimits {
        self.providers
            .get(provider)
            .copied()
            .unwrap_or(self.default)
    }

    pub fn with_provider(mut self, provider: impl Into<String>, limits: ProviderLimits) -> Self {
        self.providers.insert(provider.into(), limits);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let all = std::iter::once(("default", &self.default))
            .chain(self.providers.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, limits) in all {
            if limits.per_minute == 0 || limits.per_hour == 0 {
                return Err(Error::InvalidConfig(format!(
                    "rate limits for {} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// What a workflow step does when its provider quota is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RateLimitPolicy {
    /// Back off and retry until the quota frees up or `max_wait_secs` passes
    Wait { max_wait_secs: u64 },
    /// Record the step as failed immediately
    FailFast,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::Wait { max_wait_secs: 60 }
    }
}

/// Health aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub services: Vec<ServiceEndpoint>,
    /// Per-probe timeout
    pub timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            timeout_secs: 5,
        }
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "health timeout_secs must be positive".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate service name: {}",
                    service.name
                )));
            }
        }
        Ok(())
    }
}

/// Downstream services of a standard deployment
pub fn default_services() -> Vec<ServiceEndpoint> {
    [
        ("website_analyzer", 3001),
        ("visual_engine", 3002),
        ("test_executor", 3003),
        ("figma_service", 8001),
        ("document_parser", 8002),
        ("nlp_service", 8003),
        ("computer_vision", 8004),
        ("llm_integration", 8005),
        ("orchestrator", 8006),
        ("auth_manager", 8007),
    ]
    .into_iter()
    .map(|(name, port)| ServiceEndpoint::new(name, format!("http://localhost:{}", port)))
    .collect()
}

/// Workflow coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub rate_limit_policy: RateLimitPolicy,
    /// Fail steps whose service was unhealthy when the run started
    pub gate_on_health: bool,
    /// Upper bound on each downstream call a step makes; quota waits are
    /// bounded by the rate limit policy instead
    pub step_timeout_secs: u64,
    /// Rate limit identity used for LLM calls
    pub llm_provider: String,
    /// Rate limit identity used for design API calls
    pub design_provider: String,
    /// Frames requested per image render call
    pub image_batch_size: usize,
    /// Cap on concurrent batch items (`None` runs all at once)
    pub batch_concurrency: Option<usize>,
    /// How long finished workflows stay queryable
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            rate_limit_policy: RateLimitPolicy::default(),
            gate_on_health: false,
            step_timeout_secs: 300,
            llm_provider: "llm".to_string(),
            design_provider: "figma".to_string(),
            image_batch_size: 10,
            batch_concurrency: None,
            retention_secs: 24 * 3600,
            sweep_interval_secs: 300,
        }
    }
}

impl WorkflowConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "step_timeout_secs must be positive".to_string(),
            ));
        }
        if self.image_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "image_batch_size must be positive".to_string(),
            ));
        }
        if self.batch_concurrency == Some(0) {
            return Err(Error::InvalidConfig(
                "batch_concurrency must be positive when set".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
