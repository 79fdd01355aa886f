use crate::file::WorkerSpec;
use async_trait::async_trait;
use conductor_core::{ConductorResult, ExecutionResult};
use conductor_orchestrator::{CapabilityTag, Goal, Worker};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Worker that renders a text template instead of calling a model.
///
/// Placeholders: `{objective}`, `{worker}`, `{context}` (dependency results as JSON).
pub struct TemplateWorker {
    name: String,
    capabilities: Vec<CapabilityTag>,
    template: String,
    fail_every: Option<u32>,
    max_concurrency: Option<usize>,
    calls: AtomicU32,
}

impl TemplateWorker {
    pub fn new(
        name: impl Into<String>,
        capabilities: Vec<CapabilityTag>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities,
            template: template.into(),
            fail_every: None,
            max_concurrency: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn from_spec(spec: &WorkerSpec) -> Self {
        let mut worker = Self::new(&spec.name, spec.capabilities.clone(), &spec.template);
        worker.fail_every = spec.fail_rate_every.filter(|n| *n > 0);
        worker.max_concurrency = spec.max_concurrency;
        worker
    }

    pub fn render(&self, goal: &Goal) -> String {
        let context: BTreeMap<&String, &serde_json::Value> = goal.context.iter().collect();
        let context = serde_json::to_string(&context).unwrap_or_default();
        self.template
            .replace("{objective}", &goal.objective)
            .replace("{worker}", &self.name)
            .replace("{context}", &context)
    }
}

#[async_trait]
impl Worker for TemplateWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[CapabilityTag] {
        &self.capabilities
    }

    fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    async fn execute(&self, goal: &Goal) -> ConductorResult<ExecutionResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(every) = self.fail_every {
            if call % every == 0 {
                return Ok(ExecutionResult::failure(format!(
                    "{} failed on call {call}",
                    self.name
                )));
            }
        }
        Ok(ExecutionResult::success(serde_json::json!({
            "output": self.render(goal),
            "call": call,
        })))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_render_placeholders() {
        let worker = TemplateWorker::new(
            "scribe",
            vec![CapabilityTag::Documentation],
            "[{worker}] {objective} <- {context}",
        );
        let goal = Goal::new("document the API")
            .with_context("wf_step_1", serde_json::json!({"output": "spec"}));
        assert_eq!(
            worker.render(&goal),
            r#"[scribe] document the API <- {"wf_step_1":{"output":"spec"}}"#
        );
    }

    #[tokio::test]
    async fn test_fail_every_nth_call() {
        let spec = WorkerSpec {
            name: "flaky".into(),
            capabilities: vec![CapabilityTag::Testing],
            template: "{objective}".into(),
            fail_rate_every: Some(2),
            max_concurrency: Some(1),
        };
        let worker = TemplateWorker::from_spec(&spec);
        assert_eq!(worker.max_concurrency(), Some(1));

        let goal = Goal::new("write tests");
        let outcomes: Vec<bool> = run_calls(&worker, &goal, 4).await;
        assert_eq!(outcomes, vec![true, false, true, false]);
    }

    #[tokio::test]
    async fn test_zero_fail_rate_never_fails() {
        let spec = WorkerSpec {
            name: "steady".into(),
            capabilities: vec![CapabilityTag::Testing],
            template: "{objective}".into(),
            fail_rate_every: Some(0),
            max_concurrency: None,
        };
        let worker = TemplateWorker::from_spec(&spec);
        let goal = Goal::new("write tests");
        assert!(run_calls(&worker, &goal, 3).await.iter().all(|ok| *ok));
    }

    async fn run_calls(worker: &TemplateWorker, goal: &Goal, n: usize) -> Vec<bool> {
        let mut outcomes = Vec::with_capacity(n);
        for _ in 0..n {
            outcomes.push(worker.execute(goal).await.unwrap().success);
        }
        outcomes
    }
}
