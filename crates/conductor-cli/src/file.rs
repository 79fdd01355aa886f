use conductor_orchestrator::{CapabilityTag, OrchestratorConfig, StepDefinition};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// A workflow file: orchestrator settings, template workers, and workflows.
#[derive(Debug, Deserialize)]
pub struct ConductorFile {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
    #[serde(default)]
    pub workflows: Vec<WorkflowSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub capabilities: Vec<CapabilityTag>,
    #[serde(default = "default_template")]
    pub template: String,
    /// Fail every n-th call (demo only).
    #[serde(default)]
    pub fail_rate_every: Option<u32>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub steps: Vec<StepDefinition>,
}

fn default_template() -> String {
    "{worker}: {objective}".to_string()
}

impl ConductorFile {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let file: Self = toml::from_str(raw)?;
        file.orchestrator.validate()?;

        let mut seen = std::collections::HashSet::new();
        for worker in &file.workers {
            if !seen.insert(worker.name.as_str()) {
                anyhow::bail!("duplicate worker name '{}'", worker.name);
            }
        }
        Ok(file)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read workflow file '{}': {e}", path.display())
        })?;
        Self::parse(&raw)
    }

    /// Workflows matching `name`, or all of them.
    pub fn selected(&self, name: Option<&str>) -> Vec<&WorkflowSpec> {
        self.workflows
            .iter()
            .filter(|w| name.map_or(true, |n| w.name == n))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_orchestrator::{DependencyRef, DependencyResolution};
    use std::io::Write;

    const SAMPLE: &str = r#"
        [orchestrator]
        default_max_retries = 1
        dependency_resolution = "permissive"

        [[workers]]
        name = "researcher"
        capabilities = ["web_search", "analysis"]
        template = "found notes on {objective}"

        [[workers]]
        name = "writer"
        capabilities = ["summarization"]
        fail_rate_every = 3

        [[workflows]]
        name = "brief"
        description = "research brief"

        [[workflows.steps]]
        objective = "search for recent papers"

        [[workflows.steps]]
        objective = "summarize the papers"
        dependencies = ["prev"]
        priority = 9
    "#;

    #[test]
    fn test_parse_sample() {
        let file = ConductorFile::parse(SAMPLE).unwrap();
        assert_eq!(file.orchestrator.default_max_retries, 1);
        assert_eq!(
            file.orchestrator.dependency_resolution,
            DependencyResolution::Permissive
        );
        assert_eq!(file.workers.len(), 2);
        assert_eq!(file.workers[1].template, "{worker}: {objective}");
        assert_eq!(file.workers[1].fail_rate_every, Some(3));

        let steps = &file.workflows[0].steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].dependencies, vec![DependencyRef::from("prev")]);
        assert_eq!(
            steps[1].priority,
            Some(conductor_orchestrator::Priority::Critical)
        );
    }

    #[test]
    fn test_empty_file_is_valid() {
        let file = ConductorFile::parse("").unwrap();
        assert!(file.workers.is_empty());
        assert!(file.workflows.is_empty());
        assert_eq!(file.orchestrator.max_concurrent_per_worker, 5);
    }

    #[test]
    fn test_rejects_bad_input() {
        let unknown_tag = r#"
            [[workers]]
            name = "x"
            capabilities = ["juggling"]
        "#;
        assert!(ConductorFile::parse(unknown_tag).is_err());

        let duplicate = r#"
            [[workers]]
            name = "x"
            capabilities = ["analysis"]
            [[workers]]
            name = "x"
            capabilities = ["testing"]
        "#;
        let err = ConductorFile::parse(duplicate).unwrap_err();
        assert!(err.to_string().contains("duplicate worker"));

        assert!(ConductorFile::parse("[orchestrator]\nmax_concurrent_per_worker = 0").is_err());
    }

    #[test]
    fn test_load_and_select() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(SAMPLE.as_bytes()).unwrap();
        let file = ConductorFile::load(tmp.path()).unwrap();
        assert_eq!(file.selected(None).len(), 1);
        assert_eq!(file.selected(Some("brief")).len(), 1);
        assert!(file.selected(Some("other")).is_empty());

        let missing = ConductorFile::load(Path::new("/nonexistent/flow.toml")).unwrap_err();
        assert!(missing.to_string().contains("Failed to read"));
    }
}
