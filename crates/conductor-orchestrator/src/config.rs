use crate::capability::{CapabilityMatcher, CapabilityTag};
use crate::retry::BackoffPolicy;
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// How `create_workflow` treats dependency references it cannot resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyResolution {
    /// Reject the workflow.
    #[default]
    Strict,
    /// Drop the reference with a warning.
    Permissive,
}

/// Orchestrator settings. Every field has a default, so an empty TOML table is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_worker: usize,
    /// Retry budget for steps that do not set their own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default)]
    pub dependency_resolution: DependencyResolution,
    /// Whether a `WorkerAtCapacity` failure counts as an attempt.
    #[serde(default = "default_true")]
    pub capacity_consumes_retry: bool,
    /// Per-worker execution history ring buffer size.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Keywords added to the built-in capability table.
    #[serde(default)]
    pub extra_keywords: HashMap<CapabilityTag, Vec<String>>,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_history_capacity() -> usize {
    100
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_worker: default_max_concurrent(),
            default_max_retries: default_max_retries(),
            dependency_resolution: DependencyResolution::default(),
            capacity_consumes_retry: true,
            history_capacity: default_history_capacity(),
            backoff: BackoffPolicy::default(),
            extra_keywords: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(raw: &str) -> ConductorResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| ConductorError::Config(format!("invalid orchestrator config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> ConductorResult<()> {
        if self.max_concurrent_per_worker == 0 {
            return Err(ConductorError::Config(
                "max_concurrent_per_worker must be at least 1".into(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConductorError::Config(
                "history_capacity must be at least 1".into(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ConductorError::Config(format!(
                "backoff multiplier {} must be >= 1.0",
                self.backoff.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConductorError::Config(format!(
                "backoff jitter {} must be within [0, 1]",
                self.backoff.jitter
            )));
        }
        Ok(())
    }

    pub fn matcher(&self) -> CapabilityMatcher {
        CapabilityMatcher::with_extra_keywords(&self.extra_keywords)
    }

    pub fn with_max_concurrent_per_worker(mut self, max: usize) -> Self {
        self.max_concurrent_per_worker = max;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_dependency_resolution(mut self, mode: DependencyResolution) -> Self {
        self.dependency_resolution = mode;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_capacity_consumes_retry(mut self, consumes: bool) -> Self {
        self.capacity_consumes_retry = consumes;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }
}
