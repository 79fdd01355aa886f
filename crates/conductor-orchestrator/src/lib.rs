//! Goal decomposition and agent selection engine.
//!
//! Workers advertise capability tags; goals are routed to the best-scoring
//! capable worker, and workflows of dependent steps are driven in waves with
//! retries, backoff, pause and cancellation.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Top-level engine that runs goals and workflows.
//! - [`AgentRegistry`]: Registered workers with capability routing and selection.
//! - [`PerformanceTracker`]: Per-worker success rate, latency, load, and history.
//! - [`Workflow`]: Ordered, dependency-annotated steps built from [`StepDefinition`]s.
//! - [`Worker`]: Trait implemented by anything that can execute a [`Goal`].

/// Capability tags and the keyword matcher.
pub mod capability;
/// Orchestrator configuration.
pub mod config;
/// Workflow and goal execution engine.
pub mod engine;
/// Goals and priorities.
pub mod goal;
/// Bounded per-worker execution history.
pub mod history;
/// Performance records and load accounting.
pub mod performance;
/// Worker registry and selection.
pub mod registry;
/// Retry backoff policy.
pub mod retry;
/// The worker trait.
pub mod worker;
/// Workflows, steps, and dependency resolution.
pub mod workflow;

pub use capability::{CapabilityMatcher, CapabilityTag};
pub use config::{DependencyResolution, OrchestratorConfig};
pub use engine::{Orchestrator, OrchestratorStatus, WorkerMetrics, WorkflowResult};
pub use goal::{Goal, Priority};
pub use history::{ExecutionHistory, ExecutionRecord};
pub use performance::{LoadGuard, PerformanceRecord, PerformanceTracker};
pub use registry::AgentRegistry;
pub use retry::BackoffPolicy;
pub use worker::Worker;
pub use workflow::{
    DependencyRef, StepDefinition, StepStatus, Workflow, WorkflowStatus, WorkflowStep,
};
