use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The outcome of a single worker execution.
///
/// Workers report domain failures through `success: false` plus an `error`
/// message; the orchestrator treats both that and a returned `Err` as a failed
/// attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the worker satisfied the goal.
    pub success: bool,
    /// Worker-defined payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Failure description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Arbitrary key-value metadata (worker name, timings, ...).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionResult {
    /// Creates a successful result carrying `data`.
    pub fn success(data: impl Into<serde_json::Value>) -> Self {
        Self {
            success: true,
            data: data.into(),
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Creates a failed result with the given message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }

    /// Attaches a metadata entry.
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The failure message, or a generic one if the worker gave none.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "worker reported failure without a message".to_string())
    }
}
