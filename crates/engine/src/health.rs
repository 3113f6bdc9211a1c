//! Downstream service health checks

use crate::config::HealthConfig;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use qaflow_common::{
    Error, HealthReport, HealthStatus, Result, ServiceEndpoint, ServiceHealthRecord,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Performs one health request and returns the HTTP status code
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &ServiceEndpoint) -> Result<u16>;
}

/// Probes `GET {url}{health_path}` over HTTP
#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, endpoint: &ServiceEndpoint) -> Result<u16> {
        let resp = self
            .client
            .get(endpoint.health_url())
            .send()
            .await
            .map_err(|e| Error::provider(&endpoint.name, e))?;
        Ok(resp.status().as_u16())
    }
}

/// Probes a fixed set of services concurrently
#[derive(Clone)]
pub struct ServiceHealthAggregator {
    services: Vec<ServiceEndpoint>,
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
}

impl ServiceHealthAggregator {
    /// Create an aggregator that probes over HTTP
    pub fn new(config: &HealthConfig) -> Result<Self> {
        let probe = HttpProbe::new(config.timeout())?;
        Ok(Self::with_probe(
            config.services.clone(),
            Arc::new(probe),
            config.timeout(),
        ))
    }

    pub fn with_probe(
        services: Vec<ServiceEndpoint>,
        probe: Arc<dyn HealthProbe>,
        timeout: Duration,
    ) -> Self {
        Self {
            services,
            probe,
            timeout,
        }
    }

    /// Probe every configured service
    pub async fn check_all(&self) -> HealthReport {
        let records = join_all(self.services.iter().map(|s| self.probe_one(s))).await;
        let report = HealthReport::from_records(records);
        if !report.overall_healthy() {
            warn!(
                "{} of {} services unhealthy",
                report.unhealthy_services,
                report.services.len()
            );
        }
        report
    }

    /// Probe only the named services; unknown names are reported unreachable
    pub async fn check(&self, names: &[String]) -> HealthReport {
        let probes = names.iter().map(|name| async move {
            match self.services.iter().find(|s| &s.name == name) {
                Some(endpoint) => self.probe_one(endpoint).await,
                None => ServiceHealthRecord {
                    name: name.clone(),
                    url: String::new(),
                    status: HealthStatus::Unreachable,
                    latency_ms: None,
                    error: Some("service not configured".to_string()),
                    checked_at: Utc::now(),
                },
            }
        });
        HealthReport::from_records(join_all(probes).await)
    }

    async fn probe_one(&self, endpoint: &ServiceEndpoint) -> ServiceHealthRecord {
        let started = tokio::time::Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.probe.probe(endpoint)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status, latency_ms, error) = match outcome {
            Ok(Ok(code)) if (200..300).contains(&code) => {
                (HealthStatus::Healthy, Some(latency_ms), None)
            }
            Ok(Ok(code)) => (
                HealthStatus::Unhealthy,
                Some(latency_ms),
                Some(format!("HTTP {}", code)),
            ),
            Ok(Err(e)) => (HealthStatus::Unreachable, None, Some(e.to_string())),
            Err(_) => (
                HealthStatus::Unreachable,
                None,
                Some(Error::Timeout {
                    seconds: self.timeout.as_secs(),
                }
                .to_string()),
            ),
        };

        debug!("Health of {}: {}", endpoint.name, status);
        ServiceHealthRecord {
            name: endpoint.name.clone(),
            url: endpoint.url.clone(),
            status,
            latency_ms,
            error,
            checked_at: Utc::now(),
        }
    }
}
