mod common;

use async_trait::async_trait;
use common::{wait_for_terminal, FakeServices, Script};
use qaflow_common::{
    Credentials, Error, RequirementsInput, Result, ServiceEndpoint, UploadedDocument,
    WorkflowRequest, WorkflowScope, WorkflowState,
};
use qaflow_engine::{
    HealthProbe, ManualClock, MemoryWorkflowStore, ProviderLimits, RateLimitConfig, RateLimitPolicy,
    RateLimiter, ServiceHealthAggregator, WorkflowConfig, WorkflowCoordinator,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn coordinator_with(
    fakes: &Arc<FakeServices>,
    limiter: RateLimiter,
    config: WorkflowConfig,
) -> WorkflowCoordinator {
    WorkflowCoordinator::new(
        Arc::new(MemoryWorkflowStore::new()),
        fakes.clients(),
        limiter,
        config,
    )
}

fn coordinator(fakes: &Arc<FakeServices>) -> WorkflowCoordinator {
    coordinator_with(
        fakes,
        RateLimiter::new(RateLimitConfig::default()),
        WorkflowConfig::default(),
    )
}

fn credentials() -> Credentials {
    Credentials {
        username: "qa".to_string(),
        password: "secret".to_string(),
        auth_type: "form_based".to_string(),
        additional_fields: HashMap::new(),
    }
}

fn step_names(record: &qaflow_common::WorkflowRecord) -> Vec<&str> {
    record.results.iter().map(|r| r.step.as_str()).collect()
}

#[tokio::test]
async fn test_design_only_workflow_runs_six_steps() {
    let fakes = FakeServices::new(Script::default());
    let coordinator = coordinator(&fakes);

    let id = coordinator
        .start(WorkflowRequest::new("https://shop.example").with_design("file-1"))
        .unwrap();
    let record = wait_for_terminal(&coordinator, &id).await;

    assert_eq!(record.status, WorkflowState::Completed);
    assert_eq!(
        step_names(&record),
        vec![
            "website_analysis",
            "design_analysis",
            "test_generation",
            "test_execution",
            "results_analysis",
            "report"
        ]
    );
    assert_eq!(record.planned_steps.len(), 6);
    assert!(record.results.iter().all(|r| r.outcome.success));
    assert_eq!(record.progress, 1.0);
    assert!(record.end_time.is_some());
    assert!(record.errors.is_empty());

    let design = record.result("design_analysis").unwrap().payload.clone().unwrap();
    assert_eq!(design["frame_count"], 3);
    assert_eq!(design["frames"][2]["image_url"], "https://img.example/file-1/1:3.png");

    let report = record.result("report").unwrap().payload.clone().unwrap();
    assert_eq!(report["tests"]["total"], 2);
    assert_eq!(report["tests"]["passed"], 1);
    assert_eq!(report["summary"]["steps_failed"], 0);
    assert!(!fakes.called("authenticate"));
    assert!(!fakes.called("parse"));
}

#[tokio::test(start_paused = true)]
async fn test_start_returns_immediately_and_progress_never_decreases() {
    let fakes = FakeServices::new(Script {
        latency: Duration::from_secs(2),
        ..Default::default()
    });
    let coordinator = coordinator(&fakes);

    let id = coordinator
        .start(WorkflowRequest::new("https://shop.example").with_design("file-1"))
        .unwrap();

    let first = coordinator.status(&id).unwrap();
    assert_eq!(first.status, WorkflowState::Initializing);
    assert_eq!(first.progress, 0.0);

    let mut last = 0.0;
    loop {
        let record = coordinator.status(&id).unwrap();
        assert!(record.progress >= last);
        last = record.progress;
        if record.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    assert_eq!(last, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_partial_results_visible_while_running() {
    let fakes = FakeServices::new(Script {
        latency: Duration::from_secs(10),
        ..Default::default()
    });
    let coordinator = coordinator(&fakes);
    let id = coordinator
        .start(WorkflowRequest::new("https://shop.example"))
        .unwrap();

    tokio::time::sleep(Duration::from_secs(15)).await;
    let partial = coordinator.results(&id).unwrap();
    assert_eq!(partial.status, WorkflowState::Running);
    assert_eq!(partial.results.len(), 1);
    assert_eq!(partial.results[0].step, "website_analysis");

    let record = wait_for_terminal(&coordinator, &id).await;
    assert_eq!(record.results.len(), 5);
}

#[tokio::test]
async fn test_authentication_failure_is_fatal() {
    let fakes = FakeServices::new(Script {
        auth_fails: true,
        ..Default::default()
    });
    let coordinator = coordinator(&fakes);

    let id = coordinator
        .start(
            WorkflowRequest::new("https://shop.example")
                .with_design("file-1")
                .with_credentials(credentials()),
        )
        .unwrap();
    let record = wait_for_terminal(&coordinator, &id).await;

    assert_eq!(record.status, WorkflowState::Failed);
    assert_eq!(step_names(&record), vec!["authentication"]);
    assert!(record.errors[0].contains("bad password for qa"));
    assert!(record.end_time.is_some());
    assert!(record.progress < 1.0);
    assert!(!fakes.called("analyze"));
}

#[tokio::test]
async fn test_non_fatal_failure_keeps_going() {
    let fakes = FakeServices::new(Script {
        site_fails: true,
        ..Default::default()
    });
    let coordinator = coordinator(&fakes);

    let id = coordinator
        .start(WorkflowRequest::new("https://shop.example").with_credentials(credentials()))
        .unwrap();
    let record = wait_for_terminal(&coordinator, &id).await;

    assert_eq!(record.status, WorkflowState::Completed);
    assert!(!record.result("website_analysis").unwrap().success);
    assert!(record.result("test_generation").unwrap().success);
    assert_eq!(record.errors.len(), 1);
    assert!(record.errors[0].starts_with("website_analysis:"));
    assert!(record.result("authentication").unwrap().success);
}

#[tokio::test]
async fn test_partial_batch_failure_is_recorded_not_fatal() {
    let fakes = FakeServices::new(Script {
        failing_documents: vec!["spec.docx".to_string()],
        failing_frames: vec!["1:2".to_string()],
        ..Default::default()
    });
    let config = WorkflowConfig {
        image_batch_size: 1,
        ..Default::default()
    };
    let coordinator = coordinator_with(
        &fakes,
        RateLimiter::new(RateLimitConfig::default()),
        config,
    );

    let id = coordinator
        .start(
            WorkflowRequest::new("https://shop.example")
                .with_design("file-1")
                .with_requirements(RequirementsInput {
                    documents: vec!["stories.pdf".to_string(), "spec.docx".to_string()],
                    user_stories: vec!["As a shopper I can pay".to_string()],
                    ..Default::default()
                }),
        )
        .unwrap();
    let record = wait_for_terminal(&coordinator, &id).await;

    assert_eq!(record.status, WorkflowState::Completed);

    let requirements = record.result("requirements_analysis").unwrap();
    assert!(requirements.success);
    let payload = requirements.payload.clone().unwrap();
    assert_eq!(payload["parsed"], 1);
    assert_eq!(payload["failed"], 1);
    assert_eq!(payload["failed_documents"][0]["path"], "spec.docx");
    assert_eq!(payload["user_stories"][0], "As a shopper I can pay");

    let design = record.result("design_analysis").unwrap().payload.clone().unwrap();
    assert_eq!(design["failed_render_batches"], 1);
    assert!(design["frames"][1]["image_url"].is_null());

    assert_eq!(record.errors.len(), 2);
    assert!(record
        .errors
        .iter()
        .any(|e| e.contains("1 of 2 documents failed to parse")));
    assert!(record
        .errors
        .iter()
        .any(|e| e.contains("1 of 3 frame render batches failed")));
}

#[tokio::test]
async fn test_generate_only_scope_skips_execution() {
    let fakes = FakeServices::new(Script::default());
    let coordinator = coordinator(&fakes);

    let id = coordinator
        .start(WorkflowRequest::new("https://shop.example").with_scope(WorkflowScope::GenerateOnly))
        .unwrap();
    let record = wait_for_terminal(&coordinator, &id).await;

    assert_eq!(
        step_names(&record),
        vec!["website_analysis", "test_generation", "report"]
    );
    assert!(!fakes.called("execute"));
    let report = record.result("report").unwrap().payload.clone().unwrap();
    assert_eq!(report["test_suite_generated"], true);
    assert!(report["tests"].is_null());
}

#[tokio::test]
async fn test_rate_limit_fail_fast_records_step_failure() {
    let fakes = FakeServices::new(Script::default());
    let limits = RateLimitConfig::default().with_provider(
        "llm",
        ProviderLimits {
            per_minute: 1,
            per_hour: 100,
        },
    );
    let config = WorkflowConfig {
        rate_limit_policy: RateLimitPolicy::FailFast,
        ..Default::default()
    };
    let limiter = RateLimiter::new(limits).with_clock(Arc::new(ManualClock::new(0)));
    let coordinator = coordinator_with(&fakes, limiter, config);

    let first = coordinator
        .start(WorkflowRequest::new("https://shop.example"))
        .unwrap();
    let first = wait_for_terminal(&coordinator, &first).await;
    assert!(first.results.iter().all(|r| r.outcome.success));

    let second = coordinator
        .start(WorkflowRequest::new("https://shop.example"))
        .unwrap();
    let second = wait_for_terminal(&coordinator, &second).await;

    assert_eq!(second.status, WorkflowState::Completed);
    let generation = second.result("test_generation").unwrap();
    assert!(!generation.success);
    assert!(generation
        .error
        .as_deref()
        .unwrap()
        .contains("Rate limit exceeded for llm/generate"));
    assert!(!second.result("test_execution").unwrap().success);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_wait_gives_up() {
    let fakes = FakeServices::new(Script::default());
    let limits = RateLimitConfig::default().with_provider(
        "llm",
        ProviderLimits {
            per_minute: 1,
            per_hour: 1,
        },
    );
    let limiter = RateLimiter::new(limits).with_clock(Arc::new(ManualClock::new(0)));
    assert!(limiter.allow("llm", "generate").await);

    let config = WorkflowConfig {
        rate_limit_policy: RateLimitPolicy::Wait { max_wait_secs: 5 },
        ..Default::default()
    };
    let coordinator = coordinator_with(&fakes, limiter, config);
    let id = coordinator
        .start(WorkflowRequest::new("https://shop.example").with_scope(WorkflowScope::GenerateOnly))
        .unwrap();
    let record = wait_for_terminal(&coordinator, &id).await;

    let generation = record.result("test_generation").unwrap();
    assert!(!generation.success);
    assert!(generation.error.as_deref().unwrap().contains("Rate limit"));
    assert!(!fakes.called("generate"));
}

#[tokio::test(start_paused = true)]
async fn test_quota_wait_outlasts_call_timeout() {
    let fakes = FakeServices::new(Script::default());
    let limits = RateLimitConfig::default().with_provider(
        "llm",
        ProviderLimits {
            per_minute: 1,
            per_hour: 1,
        },
    );
    let limiter = RateLimiter::new(limits).with_clock(Arc::new(ManualClock::new(0)));
    assert!(limiter.allow("llm", "generate").await);

    let config = WorkflowConfig {
        rate_limit_policy: RateLimitPolicy::Wait { max_wait_secs: 60 },
        step_timeout_secs: 10,
        ..Default::default()
    };
    assert!(config.validate().is_ok());

    let coordinator = coordinator_with(&fakes, limiter, config);
    let id = coordinator
        .start(WorkflowRequest::new("https://shop.example").with_scope(WorkflowScope::GenerateOnly))
        .unwrap();

    let started = tokio::time::Instant::now();
    let record = wait_for_terminal(&coordinator, &id).await;
    assert!(started.elapsed() >= Duration::from_secs(60));

    let generation = record.result("test_generation").unwrap();
    assert!(!generation.success);
    assert!(generation
        .error
        .as_deref()
        .unwrap()
        .contains("Rate limit exceeded for llm/generate"));
}

#[tokio::test]
async fn test_step_panic_is_recorded() {
    let fakes = FakeServices::new(Script {
        site_panics: true,
        ..Default::default()
    });
    let coordinator = coordinator(&fakes);

    let id = coordinator
        .start(WorkflowRequest::new("https://shop.example"))
        .unwrap();
    let record = wait_for_terminal(&coordinator, &id).await;

    assert_eq!(record.status, WorkflowState::Completed);
    let analysis = record.result("website_analysis").unwrap();
    assert!(analysis.error.as_deref().unwrap().contains("analyzer crashed"));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_step_times_out() {
    let fakes = FakeServices::new(Script {
        llm_hangs: true,
        ..Default::default()
    });
    let config = WorkflowConfig {
        step_timeout_secs: 2,
        ..Default::default()
    };
    let coordinator = coordinator_with(
        &fakes,
        RateLimiter::new(RateLimitConfig::default()),
        config,
    );

    let id = coordinator
        .start(WorkflowRequest::new("https://shop.example"))
        .unwrap();
    let record = wait_for_terminal(&coordinator, &id).await;

    assert_eq!(record.status, WorkflowState::Completed);
    let generation = record.result("test_generation").unwrap();
    assert!(generation.error.as_deref().unwrap().contains("timeout"));
}

struct DownProbe {
    down: &'static str,
}

#[async_trait]
impl HealthProbe for DownProbe {
    async fn probe(&self, endpoint: &ServiceEndpoint) -> Result<u16> {
        if endpoint.name == self.down {
            Err(Error::provider(&endpoint.name, "connection refused"))
        } else {
            Ok(200)
        }
    }
}

#[tokio::test]
async fn test_health_gate_skips_unhealthy_service() {
    let fakes = FakeServices::new(Script::default());
    let config = WorkflowConfig {
        gate_on_health: true,
        ..Default::default()
    };
    let health = ServiceHealthAggregator::with_probe(
        qaflow_engine::config::default_services(),
        Arc::new(DownProbe {
            down: "website_analyzer",
        }),
        Duration::from_secs(5),
    );
    let coordinator = coordinator_with(
        &fakes,
        RateLimiter::new(RateLimitConfig::default()),
        config,
    )
    .with_health(health);

    let id = coordinator
        .start(WorkflowRequest::new("https://shop.example"))
        .unwrap();
    let record = wait_for_terminal(&coordinator, &id).await;

    let analysis = record.result("website_analysis").unwrap();
    assert!(!analysis.success);
    assert!(analysis.error.as_deref().unwrap().contains("unreachable"));
    assert!(!fakes.called("analyze"));
    assert!(record.result("test_generation").unwrap().success);
}

#[tokio::test]
async fn test_health_gate_without_aggregator_runs_ungated() {
    let fakes = FakeServices::new(Script::default());
    let config = WorkflowConfig {
        gate_on_health: true,
        ..Default::default()
    };
    let coordinator = coordinator_with(
        &fakes,
        RateLimiter::new(RateLimitConfig::default()),
        config,
    );

    let id = coordinator
        .start(WorkflowRequest::new("https://shop.example"))
        .unwrap();
    let record = wait_for_terminal(&coordinator, &id).await;

    assert_eq!(record.status, WorkflowState::Completed);
    assert!(record.result("website_analysis").unwrap().success);
    assert!(fakes.called("analyze"));
}

#[tokio::test]
async fn test_invalid_request_rejected_before_registration() {
    let fakes = FakeServices::new(Script::default());
    let coordinator = coordinator(&fakes);

    let err = coordinator
        .start(WorkflowRequest::new("not a url"))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(coordinator.list().total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_remove_only_finished_workflows() {
    let fakes = FakeServices::new(Script {
        latency: Duration::from_secs(1),
        ..Default::default()
    });
    let coordinator = coordinator(&fakes);
    let id = coordinator
        .start(WorkflowRequest::new("https://shop.example"))
        .unwrap();

    assert!(matches!(
        coordinator.remove(&id),
        Err(Error::InvalidStateTransition { .. })
    ));

    wait_for_terminal(&coordinator, &id).await;
    let listing = coordinator.list();
    assert_eq!(listing.total, 1);
    assert_eq!(listing.by_status.get("completed"), Some(&1));

    coordinator.remove(&id).unwrap();
    assert!(matches!(
        coordinator.status(&id),
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        coordinator.remove(&id),
        Err(Error::NotFound { .. })
    ));
}

fn upload(filename: &str, content: &str) -> UploadedDocument {
    UploadedDocument {
        filename: filename.to_string(),
        content_type: Some("text/markdown".to_string()),
        content: content.as_bytes().to_vec(),
    }
}

#[tokio::test]
async fn test_uploaded_documents_parsed_with_paths() {
    let fakes = FakeServices::new(Script {
        failing_documents: vec!["legacy.doc".to_string()],
        ..Default::default()
    });
    let coordinator = coordinator(&fakes);

    let id = coordinator
        .start(
            WorkflowRequest::new("https://shop.example").with_requirements(RequirementsInput {
                documents: vec!["stories.pdf".to_string()],
                uploads: vec![
                    upload("checkout.md", "Shoppers can pay by card"),
                    upload("legacy.doc", "???"),
                ],
                ..Default::default()
            }),
        )
        .unwrap();
    let record = wait_for_terminal(&coordinator, &id).await;

    assert_eq!(record.status, WorkflowState::Completed);
    assert_eq!(record.request.requirement_documents, 3);
    assert!(fakes.called("parse"));
    assert!(fakes.called("parse_upload"));

    let payload = record
        .result("requirements_analysis")
        .unwrap()
        .payload
        .clone()
        .unwrap();
    assert_eq!(payload["parsed"], 2);
    assert_eq!(payload["failed"], 1);
    assert_eq!(payload["failed_documents"][0]["path"], "legacy.doc");
    assert_eq!(payload["documents"][1]["text"], "Shoppers can pay by card");
    assert!(record
        .errors
        .iter()
        .any(|e| e.contains("1 of 3 documents failed to parse")));
}

#[tokio::test]
async fn test_run_to_completion_returns_terminal_record() {
    let fakes = FakeServices::new(Script::default());
    let coordinator = coordinator(&fakes);

    let record = coordinator
        .run_to_completion(
            WorkflowRequest::new("https://shop.example").with_scope(WorkflowScope::GenerateOnly),
        )
        .await
        .unwrap();

    assert_eq!(record.status, WorkflowState::Completed);
    assert_eq!(record.progress, 1.0);
    assert_eq!(
        coordinator.status(&record.workflow_id).unwrap().status,
        WorkflowState::Completed
    );
    assert!(coordinator
        .run_to_completion(WorkflowRequest::new("not a url"))
        .await
        .is_err());
    assert_eq!(coordinator.list().total, 1);
}
