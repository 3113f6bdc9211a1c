//! QAFlow Engine
//!
//! Coordination core of the QAFlow orchestrator: provider rate limiting,
//! downstream health aggregation, concurrent batches, and the workflow
//! pipeline that ties them together.

pub mod batch;
pub mod config;
pub mod health;
pub mod rate_limiter;
pub mod workflow;

pub use batch::BatchCoordinator;
pub use config::{HealthConfig, ProviderLimits, RateLimitConfig, RateLimitPolicy, WorkflowConfig};
pub use health::{HealthProbe, HttpProbe, ServiceHealthAggregator};
pub use rate_limiter::{
    Clock, CounterStore, ManualClock, MemoryCounterStore, RateLimiter, SqliteCounterStore,
    SystemClock,
};
pub use workflow::{
    spawn_retention, MemoryWorkflowStore, ServiceClients, StepKind, WorkflowCoordinator,
    WorkflowListing, WorkflowResults, WorkflowStore,
};
