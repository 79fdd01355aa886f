use crate::config::DependencyResolution;
use crate::goal::{Goal, Priority};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;
use uuid::Uuid;

/// Status of a single workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed { reason: String },
}

/// Overall status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// No new steps are dispatched; step states are untouched.
    Paused,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Paused => write!(f, "paused"),
        }
    }
}

/// A dependency as written in a step definition.
///
/// Accepted forms: a zero-based index, `"prev"`/`"previous"`, `"step_N"`
/// (1-based), or a fully-qualified step id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyRef {
    Index(usize),
    Name(String),
}

impl From<usize> for DependencyRef {
    fn from(index: usize) -> Self {
        DependencyRef::Index(index)
    }
}

impl From<&str> for DependencyRef {
    fn from(name: &str) -> Self {
        DependencyRef::Name(name.to_string())
    }
}

impl From<String> for DependencyRef {
    fn from(name: String) -> Self {
        DependencyRef::Name(name)
    }
}

impl std::fmt::Display for DependencyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyRef::Index(i) => write!(f, "{i}"),
            DependencyRef::Name(n) => f.write_str(n),
        }
    }
}

/// Input schema for one step of `create_workflow`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDefinition {
    pub objective: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
    /// Worker to try first, if it is capable of the goal.
    #[serde(default)]
    pub preferred_agent: Option<String>,
    /// Overrides the orchestrator's default retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl StepDefinition {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            ..Self::default()
        }
    }

    pub fn depends_on(mut self, dep: impl Into<DependencyRef>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_preferred_agent(mut self, agent: impl Into<String>) -> Self {
        self.preferred_agent = Some(agent.into());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A goal bound to a position in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    /// Zero-based position in the workflow.
    pub position: usize,
    pub goal: Goal,
    pub preferred_agent: Option<String>,
    /// Fully-qualified ids of prerequisite steps.
    pub dependencies: Vec<String>,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Number of times a worker was actually invoked.
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub assigned_worker: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a retry may be dispatched.
    pub retry_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn is_ready(&self, completed: &HashSet<String>, now: DateTime<Utc>) -> bool {
        self.status == StepStatus::Pending
            && self.retry_at.map_or(true, |at| at <= now)
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, StepStatus::Completed | StepStatus::Failed { .. })
    }

    pub fn mark_running(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
        self.retry_at = None;
    }

    /// Back to pending without an attempt having been made.
    pub fn defer(&mut self) {
        self.status = StepStatus::Pending;
        self.started_at = None;
    }

    pub fn mark_completed(&mut self, data: serde_json::Value) {
        self.status = StepStatus::Completed;
        self.result = Some(data);
        self.last_error = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.last_error = Some(reason.clone());
        self.status = StepStatus::Failed { reason };
        self.completed_at = Some(Utc::now());
    }

    /// Return to pending for another attempt, no earlier than `retry_at`.
    pub fn schedule_retry(&mut self, reason: impl Into<String>, retry_at: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = Some(reason.into());
        self.status = StepStatus::Pending;
        self.retry_at = Some(retry_at);
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// An ordered, dependency-annotated collection of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub steps: Vec<WorkflowStep>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Workflow {
    /// Build a workflow from step definitions, normalizing every dependency
    /// reference to a fully-qualified step id.
    ///
    /// Fails on an empty step list, an empty objective, a dependency cycle, or
    /// (in strict mode) an unresolvable reference.
    pub fn build(
        name: impl Into<String>,
        description: impl Into<String>,
        definitions: Vec<StepDefinition>,
        metadata: HashMap<String, serde_json::Value>,
        resolution: DependencyResolution,
        default_max_retries: u32,
    ) -> ConductorResult<Self> {
        if definitions.is_empty() {
            return Err(ConductorError::InvalidWorkflow(
                "workflow has no steps".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let ids: Vec<String> = (1..=definitions.len())
            .map(|n| step_id(id, n))
            .collect();

        let mut steps = Vec::with_capacity(definitions.len());
        for (position, def) in definitions.into_iter().enumerate() {
            if def.objective.trim().is_empty() {
                return Err(ConductorError::InvalidWorkflow(format!(
                    "step {position} has an empty objective"
                )));
            }

            let mut dependencies: Vec<String> = Vec::new();
            for reference in &def.dependencies {
                match resolve_reference(reference, position, &ids) {
                    Some(dep) if dep == ids[position] => {
                        return Err(ConductorError::DependencyCycle);
                    }
                    Some(dep) => {
                        if !dependencies.contains(&dep) {
                            dependencies.push(dep);
                        }
                    }
                    None => match resolution {
                        DependencyResolution::Strict => {
                            return Err(ConductorError::InvalidDependencyReference {
                                step_index: position,
                                reference: reference.to_string(),
                            });
                        }
                        DependencyResolution::Permissive => {
                            warn!(
                                step_index = position,
                                reference = %reference,
                                "Dropping unresolvable dependency reference"
                            );
                        }
                    },
                }
            }

            let mut goal = Goal::new(def.objective);
            goal.parameters = def.parameters;
            goal.priority = def.priority.unwrap_or_default();
            goal.deadline = def.deadline;
            goal.context = def.context;
            goal.dependencies = dependencies.clone();

            steps.push(WorkflowStep {
                id: ids[position].clone(),
                position,
                goal,
                preferred_agent: def.preferred_agent,
                dependencies,
                status: StepStatus::Pending,
                retry_count: 0,
                max_retries: def.max_retries.unwrap_or(default_max_retries),
                attempts: 0,
                result: None,
                last_error: None,
                assigned_worker: None,
                started_at: None,
                completed_at: None,
                retry_at: None,
            });
        }

        let workflow = Self {
            id,
            name: name.into(),
            description: description.into(),
            steps,
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata,
        };

        if workflow.has_cycle() {
            return Err(ConductorError::DependencyCycle);
        }
        Ok(workflow)
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn completed_ids(&self) -> HashSet<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Ids of steps ready at `now`: highest priority first, then position.
    pub fn ready_steps(&self, now: DateTime<Utc>) -> Vec<String> {
        let completed = self.completed_ids();
        let mut ready: Vec<&WorkflowStep> = self
            .steps
            .iter()
            .filter(|s| s.is_ready(&completed, now))
            .collect();
        ready.sort_by(|a, b| {
            b.goal
                .priority
                .cmp(&a.goal.priority)
                .then(a.position.cmp(&b.position))
        });
        ready.into_iter().map(|s| s.id.clone()).collect()
    }

    /// Earliest `retry_at` among pending steps whose dependencies are complete
    /// but whose backoff has not yet elapsed.
    pub fn next_retry_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let completed = self.completed_ids();
        self.steps
            .iter()
            .filter(|s| {
                s.status == StepStatus::Pending
                    && s.dependencies.iter().all(|d| completed.contains(d))
            })
            .filter_map(|s| s.retry_at.filter(|at| *at > now))
            .min()
    }

    /// Results of every completed step, keyed by step id.
    pub fn results(&self) -> BTreeMap<String, serde_json::Value> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| (s.id.clone(), s.result.clone().unwrap_or(serde_json::Value::Null)))
            .collect()
    }

    /// Results of the dependencies of `step_id`, keyed by dependency id.
    pub fn dependency_results(&self, step_id: &str) -> HashMap<String, serde_json::Value> {
        let Some(step) = self.step(step_id) else {
            return HashMap::new();
        };
        step.dependencies
            .iter()
            .filter_map(|dep| {
                self.step(dep)
                    .and_then(|d| d.result.clone())
                    .map(|r| (dep.clone(), r))
            })
            .collect()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .count()
    }

    pub fn completed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    pub fn failed_steps(&self) -> Vec<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed { .. }))
            .collect()
    }

    /// All steps are completed or failed.
    pub fn is_done(&self) -> bool {
        self.steps.iter().all(WorkflowStep::is_terminal)
    }

    /// Check for cycles in the dependency graph.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        for step in &self.steps {
            if self.dfs_cycle(&step.id, &mut visited) {
                return true;
            }
        }
        false
    }

    fn dfs_cycle<'a>(&'a self, id: &'a str, visited: &mut HashMap<&'a str, u8>) -> bool {
        match visited.get(id) {
            Some(1) => return true,  // back edge
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(step) = self.step(id) {
            for dep in &step.dependencies {
                if self.dfs_cycle(dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }
}

/// Fully-qualified id of the `n`-th (1-based) step of `workflow_id`.
pub fn step_id(workflow_id: Uuid, n: usize) -> String {
    format!("{workflow_id}_step_{n}")
}

fn resolve_reference(reference: &DependencyRef, position: usize, ids: &[String]) -> Option<String> {
    match reference {
        DependencyRef::Index(index) => ids.get(*index).cloned(),
        DependencyRef::Name(raw) => {
            let name = raw.trim();
            let lowered = name.to_lowercase();
            if lowered == "prev" || lowered == "previous" {
                return position.checked_sub(1).and_then(|i| ids.get(i)).cloned();
            }
            if let Ok(index) = name.parse::<usize>() {
                return ids.get(index).cloned();
            }
            if let Some(n) = lowered.strip_prefix("step_") {
                if let Ok(n) = n.parse::<usize>() {
                    return n.checked_sub(1).and_then(|i| ids.get(i)).cloned();
                }
            }
            ids.iter().find(|id| id.as_str() == name).cloned()
        }
    }
}
