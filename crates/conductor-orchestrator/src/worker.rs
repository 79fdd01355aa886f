use crate::capability::{CapabilityMatcher, CapabilityTag};
use crate::goal::Goal;
use async_trait::async_trait;
use conductor_core::{ConductorResult, ExecutionResult};

/// Trait every worker implements: LLM-backed agents, template generators,
/// analyzers, or anything else that can attempt a [`Goal`].
///
/// The capability set must not change after construction; the registry reads it
/// on every selection.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Unique name used as the registry key.
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[CapabilityTag];

    /// Per-worker concurrency ceiling. `None` defers to the orchestrator config.
    fn max_concurrency(&self) -> Option<usize> {
        None
    }

    /// Whether this worker is eligible for `goal`.
    ///
    /// Defaults to a keyword match of any advertised capability against the
    /// goal objective.
    fn can_handle(&self, goal: &Goal, matcher: &CapabilityMatcher) -> bool {
        matcher.matches_any(self.capabilities(), &goal.objective)
    }

    /// Attempt the goal. Returning `Err` and returning a result with
    /// `success: false` are both treated as a failed attempt.
    async fn execute(&self, goal: &Goal) -> ConductorResult<ExecutionResult>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct Searcher;

    #[async_trait]
    impl Worker for Searcher {
        fn name(&self) -> &str {
            "searcher"
        }

        fn capabilities(&self) -> &[CapabilityTag] {
            &[CapabilityTag::WebSearch]
        }

        async fn execute(&self, goal: &Goal) -> ConductorResult<ExecutionResult> {
            Ok(ExecutionResult::success(goal.objective.clone()))
        }
    }

    struct Generalist;

    #[async_trait]
    impl Worker for Generalist {
        fn name(&self) -> &str {
            "generalist"
        }

        fn capabilities(&self) -> &[CapabilityTag] {
            &[]
        }

        fn can_handle(&self, _goal: &Goal, _matcher: &CapabilityMatcher) -> bool {
            true
        }

        async fn execute(&self, _goal: &Goal) -> ConductorResult<ExecutionResult> {
            Ok(ExecutionResult::success(serde_json::Value::Null))
        }
    }

    #[test]
    fn test_default_can_handle_uses_keywords() {
        let matcher = CapabilityMatcher::new();
        let worker = Searcher;
        assert!(worker.can_handle(&Goal::new("Search crates.io"), &matcher));
        assert!(!worker.can_handle(&Goal::new("Write unit tests"), &matcher));
        assert!(worker.max_concurrency().is_none());
    }

    #[test]
    fn test_can_handle_override() {
        let matcher = CapabilityMatcher::new();
        assert!(Generalist.can_handle(&Goal::new("anything at all"), &matcher));
    }

    #[tokio::test]
    async fn test_execute_echoes_objective() {
        let result = Searcher.execute(&Goal::new("search docs")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data, "search docs");
    }
}
