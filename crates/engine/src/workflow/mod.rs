//! Workflow orchestration

mod coordinator;
mod steps;
mod store;

pub use coordinator::{WorkflowCoordinator, WorkflowListing, WorkflowResults};
pub use steps::{extract_frames, plan, DesignFrame, ServiceClients, StepKind};
pub use store::{spawn_retention, MemoryWorkflowStore, WorkflowStore};
