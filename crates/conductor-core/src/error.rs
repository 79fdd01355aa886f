use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor orchestrator.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// No registered, active worker is capable of the goal.
    #[error("No capable agent for objective: {objective}")]
    NoCapableWorker {
        /// Objective text that failed to match.
        objective: String,
    },

    /// The selected worker already runs as many goals as it is allowed to.
    #[error("Agent '{worker}' at capacity ({limit} in flight)")]
    WorkerAtCapacity {
        /// Name of the saturated worker.
        worker: String,
        /// Concurrency ceiling that was hit.
        limit: usize,
    },

    /// A worker attempted a step and failed.
    #[error("Step '{step_id}' failed: {message}")]
    StepExecution {
        /// Fully-qualified step id.
        step_id: String,
        /// Failure message reported by the worker.
        message: String,
    },

    /// Remaining steps wait on prerequisites that will never complete.
    #[error("Dependency deadlock: pending steps {pending:?} have unmet dependencies")]
    DependencyDeadlock {
        /// Ids of the steps left in pending state.
        pending: Vec<String>,
    },

    /// A dependency reference could not be resolved to a step.
    #[error("Invalid dependency reference '{reference}' on step {step_index}")]
    InvalidDependencyReference {
        /// Zero-based index of the step that carries the reference.
        step_index: usize,
        /// The reference as written.
        reference: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected in workflow graph")]
    DependencyCycle,

    /// The goal's deadline passed before it could be dispatched.
    #[error("Deadline exceeded for goal {goal_id}")]
    DeadlineExceeded {
        /// Id of the expired goal.
        goal_id: Uuid,
    },

    /// No active or archived workflow has the given id.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// A workflow definition is malformed.
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// The workflow was cancelled.
    #[error("Workflow cancelled")]
    Cancelled,

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Whether a failed step attempt carrying this error may be retried.
    ///
    /// Capacity errors are retryable here; the orchestrator decides separately
    /// whether they consume an attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StepExecution { .. } | Self::WorkerAtCapacity { .. }
        )
    }
}
