use crate::capability::CapabilityTag;
use crate::config::OrchestratorConfig;
use crate::goal::Goal;
use crate::history::ExecutionRecord;
use crate::performance::{PerformanceRecord, PerformanceTracker};
use crate::registry::AgentRegistry;
use crate::worker::Worker;
use crate::workflow::{StepDefinition, StepStatus, Workflow, WorkflowStatus};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, ExecutionResult};
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Span};
use uuid::Uuid;

/// Aggregated outcome of `execute_workflow`.
///
/// `data` holds every completed step's result, keyed by step id, whether or
/// not the workflow as a whole succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub success: bool,
    pub status: WorkflowStatus,
    pub data: BTreeMap<String, serde_json::Value>,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Per-worker view in [`OrchestratorStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub active: bool,
    pub capabilities: Vec<CapabilityTag>,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub success_rate: f64,
    pub avg_execution_secs: f64,
    pub current_load: usize,
    pub score: f64,
}

/// Snapshot returned by [`Orchestrator::get_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub registered_workers: usize,
    pub active_workflows: usize,
    pub completed_workflows: usize,
    pub failed_workflows: usize,
    /// Completed over finished workflows; 0.0 before any finish.
    pub success_rate: f64,
    pub per_worker_metrics: BTreeMap<String, WorkerMetrics>,
}

impl OrchestratorStatus {
    /// Serialize the snapshot as JSON (for dashboards).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

struct ActiveWorkflow {
    workflow: Workflow,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    executing: bool,
}

#[derive(Default)]
struct WorkflowBook {
    active: HashMap<Uuid, ActiveWorkflow>,
    completed: Vec<Workflow>,
    failed: Vec<Workflow>,
}

impl WorkflowBook {
    fn find(&self, id: Uuid) -> Option<&Workflow> {
        self.active
            .get(&id)
            .map(|a| &a.workflow)
            .or_else(|| self.completed.iter().find(|w| w.id == id))
            .or_else(|| self.failed.iter().find(|w| w.id == id))
    }
}

struct Dispatch {
    step_id: String,
    goal: Goal,
    preferred: Option<String>,
}

enum Wave {
    Done,
    Run(Vec<Dispatch>),
    Backoff(DateTime<Utc>),
    Deadlock(Vec<String>),
}

/// Drives workflows to completion over a pool of registered workers.
///
/// Steps run in dependency waves: every ready step is dispatched together and
/// the next ready set is computed once the whole wave has finished. Pause and
/// cancellation are checked at wave boundaries; cancellation also interrupts a
/// wave that is still awaiting its workers.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: RwLock<AgentRegistry>,
    tracker: Arc<PerformanceTracker>,
    book: Mutex<WorkflowBook>,
    span: Span,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_span(config, info_span!("orchestrator"))
    }

    /// Create an orchestrator whose events (and its registry's) are emitted
    /// inside `span`.
    pub fn with_span(config: OrchestratorConfig, span: Span) -> Self {
        let tracker = Arc::new(PerformanceTracker::new(config.history_capacity));
        let registry = AgentRegistry::new(config.matcher(), Arc::clone(&tracker))
            .with_span(info_span!(parent: &span, "agent_registry"));
        Self {
            config,
            registry: RwLock::new(registry),
            tracker,
            book: Mutex::new(WorkflowBook::default()),
            span,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        &self.tracker
    }

    // --- Workers ---

    pub fn register_worker(&self, worker: Arc<dyn Worker>) {
        self.registry.write().register(worker);
    }

    pub fn unregister_worker(&self, name: &str) -> bool {
        self.registry.write().unregister(name)
    }

    /// Name of the worker `select_best` would pick for `goal`.
    pub fn select_worker(&self, goal: &Goal) -> Option<String> {
        self.registry
            .read()
            .select_best(goal)
            .map(|w| w.name().to_string())
    }

    /// Names of active workers able to handle `goal`, in registration order.
    pub fn capable_workers(&self, goal: &Goal) -> Vec<String> {
        self.registry
            .read()
            .find_capable(goal)
            .iter()
            .map(|w| w.name().to_string())
            .collect()
    }

    pub fn worker_history(&self, name: &str) -> Vec<ExecutionRecord> {
        self.tracker.history(name)
    }

    pub fn performance(&self, name: &str) -> Option<PerformanceRecord> {
        self.tracker.record(name)
    }

    /// Deactivate every worker. Workers stay registered but are no longer selected.
    pub fn shutdown(&self) {
        self.registry.write().deactivate_all();
        info!(parent: &self.span, "Orchestrator shut down");
    }

    // --- Goals ---

    /// Run one goal on the preferred worker (if capable) or the best-scoring one.
    ///
    /// Dispatch problems (no capable worker, capacity, expired deadline) are
    /// returned as `Err`. Anything the worker does, including returning an
    /// error or panicking, comes back as `Ok` with `success: false`.
    pub async fn execute_goal(
        &self,
        goal: &Goal,
        preferred: Option<&str>,
    ) -> ConductorResult<ExecutionResult> {
        if goal.is_expired() {
            return Err(ConductorError::DeadlineExceeded { goal_id: goal.id });
        }

        let worker = {
            let registry = self.registry.read();
            match preferred {
                Some(name) if registry.is_capable(name, goal) => registry.get(name),
                _ => registry.select_best(goal),
            }
        };
        let Some(worker) = worker else {
            return Err(ConductorError::NoCapableWorker {
                objective: goal.objective.clone(),
            });
        };

        let name = worker.name().to_string();
        let limit = self.capacity_limit(worker.as_ref());
        let Some(guard) = self.tracker.try_acquire(&name, limit) else {
            warn!(parent: &self.span, worker = %name, limit, "Worker at capacity");
            return Err(ConductorError::WorkerAtCapacity {
                worker: name,
                limit,
            });
        };

        debug!(parent: &self.span, worker = %name, goal_id = %goal.id, "Dispatching goal");
        let start = Instant::now();
        let outcome = AssertUnwindSafe(worker.execute(goal)).catch_unwind().await;
        let elapsed = start.elapsed();

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ExecutionResult::failure(e.to_string()),
            Err(panic) => ExecutionResult::failure(format!(
                "worker '{name}' panicked: {}",
                panic_message(panic.as_ref())
            )),
        };
        let error = (!result.success).then(|| result.error_message());
        guard.finish(goal, result.success, elapsed, error);

        Ok(result
            .with_metadata("worker", name)
            .with_metadata("duration_ms", millis(elapsed)))
    }

    // --- Workflows ---

    /// Build a workflow from step definitions and add it to the active set.
    pub fn create_workflow(
        &self,
        name: &str,
        description: &str,
        steps: Vec<StepDefinition>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> ConductorResult<Uuid> {
        let workflow = self.span.in_scope(|| {
            Workflow::build(
                name,
                description,
                steps,
                metadata.unwrap_or_default(),
                self.config.dependency_resolution,
                self.config.default_max_retries,
            )
        })?;
        let id = workflow.id;
        info!(
            parent: &self.span,
            workflow_id = %id,
            name = %name,
            steps = workflow.steps.len(),
            "Workflow created"
        );
        let (paused, _) = watch::channel(false);
        self.book.lock().active.insert(
            id,
            ActiveWorkflow {
                workflow,
                cancel: CancellationToken::new(),
                paused,
                executing: false,
            },
        );
        Ok(id)
    }

    /// Clone of an active or archived workflow.
    pub fn workflow(&self, id: Uuid) -> Option<Workflow> {
        self.book.lock().find(id).cloned()
    }

    /// Drive a workflow to a terminal state.
    ///
    /// Never returns an error: every failure (deadlock, retry exhaustion,
    /// cancellation, unknown id) is reported through the result.
    pub async fn execute_workflow(&self, id: Uuid) -> WorkflowResult {
        let start = Instant::now();

        let (cancel, mut paused) = {
            let mut book = self.book.lock();
            if !book.active.contains_key(&id) {
                let (status, data, message) = match book.find(id) {
                    Some(wf) => (
                        wf.status,
                        wf.results(),
                        format!("workflow already {}", wf.status),
                    ),
                    None => {
                        return detached_result(
                            id,
                            ConductorError::WorkflowNotFound(id).to_string(),
                        )
                    }
                };
                return WorkflowResult {
                    workflow_id: id,
                    success: false,
                    status,
                    data,
                    error: Some(message),
                    metadata: HashMap::new(),
                };
            }
            let Some(entry) = book.active.get_mut(&id) else {
                return detached_result(id, ConductorError::WorkflowNotFound(id).to_string());
            };
            if entry.executing {
                let wf = &entry.workflow;
                return WorkflowResult {
                    workflow_id: id,
                    success: false,
                    status: wf.status,
                    data: wf.results(),
                    error: Some("workflow already running".to_string()),
                    metadata: HashMap::new(),
                };
            }
            entry.executing = true;
            let wf = &mut entry.workflow;
            if wf.status == WorkflowStatus::Pending {
                wf.status = WorkflowStatus::Running;
            }
            wf.started_at.get_or_insert_with(Utc::now);
            (entry.cancel.clone(), entry.paused.subscribe())
        };
        info!(parent: &self.span, workflow_id = %id, "Workflow started");

        loop {
            if *paused.borrow() {
                info!(parent: &self.span, workflow_id = %id, "Workflow paused, waiting");
                let resumed = tokio::select! {
                    _ = cancel.cancelled() => false,
                    res = async { paused.wait_for(|p| !*p).await.map(|_| ()) } => res.is_ok(),
                };
                if !resumed {
                    return self.cancelled_result(id, start);
                }
                info!(parent: &self.span, workflow_id = %id, "Workflow resumed");
            }
            if cancel.is_cancelled() {
                return self.cancelled_result(id, start);
            }

            let wave = {
                let mut book = self.book.lock();
                book.active
                    .get_mut(&id)
                    .map(|entry| plan_wave(&mut entry.workflow))
            };
            let Some(wave) = wave else {
                return self.cancelled_result(id, start);
            };

            match wave {
                Wave::Done => break,
                Wave::Deadlock(pending) => {
                    warn!(
                        parent: &self.span,
                        workflow_id = %id,
                        pending = ?pending,
                        "Dependency deadlock"
                    );
                    let err = ConductorError::DependencyDeadlock { pending };
                    return self.fail_workflow(id, &err, None, start);
                }
                Wave::Backoff(until) => {
                    let wait = (until - Utc::now()).to_std().unwrap_or_default();
                    debug!(
                        parent: &self.span,
                        workflow_id = %id,
                        wait_ms = millis(wait),
                        "Waiting for retry backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return self.cancelled_result(id, start),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Wave::Run(dispatches) => {
                    let (runnable, deferred) = self.assign_workers(dispatches);
                    // With every slot held elsewhere, dispatch anyway so the
                    // capacity errors go through the retry policy.
                    let dispatches = if runnable.is_empty() {
                        deferred
                    } else {
                        if !deferred.is_empty() {
                            self.defer_steps(id, &deferred);
                        }
                        runnable
                    };
                    debug!(
                        parent: &self.span,
                        workflow_id = %id,
                        steps = dispatches.len(),
                        "Dispatching wave"
                    );
                    let wave = join_all(dispatches.iter().map(|d| async move {
                        let outcome = self.execute_goal(&d.goal, d.preferred.as_deref()).await;
                        (d.step_id.as_str(), outcome)
                    }));
                    let outcomes = tokio::select! {
                        _ = cancel.cancelled() => return self.cancelled_result(id, start),
                        outcomes = wave => outcomes,
                    };

                    let applied = {
                        let mut book = self.book.lock();
                        book.active.get_mut(&id).map(|entry| {
                            let mut exhausted = None;
                            for (step_id, outcome) in outcomes {
                                if let Some(err) =
                                    self.apply_outcome(&mut entry.workflow, step_id, outcome)
                                {
                                    exhausted.get_or_insert_with(|| (step_id.to_string(), err));
                                }
                            }
                            exhausted
                        })
                    };
                    let Some(exhausted) = applied else {
                        return self.cancelled_result(id, start);
                    };
                    if let Some((step_id, err)) = exhausted {
                        return self.fail_workflow(id, &err, Some(step_id), start);
                    }
                }
            }
        }

        self.complete_workflow(id, start)
    }

    /// Stop dispatching new steps of a running or pending workflow.
    pub fn pause_workflow(&self, id: Uuid) -> bool {
        let mut book = self.book.lock();
        let Some(entry) = book.active.get_mut(&id) else {
            return false;
        };
        if !matches!(
            entry.workflow.status,
            WorkflowStatus::Running | WorkflowStatus::Pending
        ) {
            return false;
        }
        entry.workflow.status = WorkflowStatus::Paused;
        entry.paused.send_replace(true);
        info!(parent: &self.span, workflow_id = %id, "Workflow pause requested");
        true
    }

    pub fn resume_workflow(&self, id: Uuid) -> bool {
        let mut book = self.book.lock();
        let Some(entry) = book.active.get_mut(&id) else {
            return false;
        };
        if entry.workflow.status != WorkflowStatus::Paused {
            return false;
        }
        entry.workflow.status = if entry.workflow.started_at.is_some() {
            WorkflowStatus::Running
        } else {
            WorkflowStatus::Pending
        };
        entry.paused.send_replace(false);
        info!(parent: &self.span, workflow_id = %id, "Workflow resumed");
        true
    }

    /// Mark an active workflow failed and archive it at once.
    ///
    /// A concurrent `execute_workflow` stops at its next await point; steps it
    /// had in flight are dropped and recorded as failed.
    pub fn cancel_workflow(&self, id: Uuid) -> bool {
        let mut book = self.book.lock();
        let Some(entry) = book.active.remove(&id) else {
            return false;
        };
        entry.cancel.cancel();
        let mut workflow = entry.workflow;
        for step in &mut workflow.steps {
            if step.status == StepStatus::Running {
                step.mark_failed("workflow cancelled");
            }
        }
        workflow.status = WorkflowStatus::Failed;
        workflow.completed_at = Some(Utc::now());
        workflow
            .metadata
            .insert("cancelled".to_string(), serde_json::Value::Bool(true));
        book.failed.push(workflow);
        info!(parent: &self.span, workflow_id = %id, "Workflow cancelled");
        true
    }

    pub fn get_status(&self) -> OrchestratorStatus {
        let (active, completed, failed) = {
            let book = self.book.lock();
            (book.active.len(), book.completed.len(), book.failed.len())
        };
        let finished = completed + failed;
        let success_rate = if finished == 0 {
            0.0
        } else {
            completed as f64 / finished as f64
        };

        let registry = self.registry.read();
        let per_worker_metrics = registry
            .worker_names()
            .into_iter()
            .filter_map(|name| {
                let worker = registry.get(&name)?;
                let record = self.tracker.record(&name).unwrap_or_default();
                let metrics = WorkerMetrics {
                    active: registry.is_active(&name),
                    capabilities: worker.capabilities().to_vec(),
                    total_executions: record.total_executions,
                    successful_executions: record.successful_executions,
                    success_rate: record.success_rate(),
                    avg_execution_secs: record.avg_execution_secs(),
                    current_load: record.current_load,
                    score: record.score(),
                };
                Some((name, metrics))
            })
            .collect();

        OrchestratorStatus {
            registered_workers: registry.len(),
            active_workflows: active,
            completed_workflows: completed,
            failed_workflows: failed,
            success_rate,
            per_worker_metrics,
        }
    }

    // --- Internals ---

    /// Concurrent goals `worker` may run: its own limit, capped by the config.
    fn capacity_limit(&self, worker: &dyn Worker) -> usize {
        worker
            .max_concurrency()
            .map_or(self.config.max_concurrent_per_worker, |own| {
                own.clamp(1, self.config.max_concurrent_per_worker)
            })
    }

    /// Pin each dispatch of a wave to a worker with a free slot.
    ///
    /// Slots handed out earlier in the same wave count as load, so a wave never
    /// asks a worker for more than it can take. Dispatches that find every
    /// capable worker full come back in the second list. Dispatches with no
    /// capable worker or an expired deadline are passed through untouched and
    /// fail in `execute_goal`.
    fn assign_workers(&self, dispatches: Vec<Dispatch>) -> (Vec<Dispatch>, Vec<Dispatch>) {
        let registry = self.registry.read();
        let mut reserved: HashMap<String, usize> = HashMap::new();
        let mut runnable = Vec::with_capacity(dispatches.len());
        let mut deferred = Vec::new();

        for mut dispatch in dispatches {
            let candidates: Vec<Arc<dyn Worker>> = match dispatch.preferred.as_deref() {
                Some(name) if registry.is_capable(name, &dispatch.goal) => {
                    registry.get(name).into_iter().collect()
                }
                _ => registry.find_capable(&dispatch.goal),
            };
            if candidates.is_empty() || dispatch.goal.is_expired() {
                runnable.push(dispatch);
                continue;
            }

            let mut best: Option<(String, f64)> = None;
            for worker in &candidates {
                let name = worker.name();
                let mut record = self.tracker.record(name).unwrap_or_default();
                record.current_load += reserved.get(name).copied().unwrap_or(0);
                if record.current_load >= self.capacity_limit(worker.as_ref()) {
                    continue;
                }
                let score = record.score();
                match &best {
                    Some((_, best_score)) if score <= *best_score => {}
                    _ => best = Some((name.to_string(), score)),
                }
            }

            match best {
                Some((name, _)) => {
                    *reserved.entry(name.clone()).or_default() += 1;
                    dispatch.preferred = Some(name);
                    runnable.push(dispatch);
                }
                None => deferred.push(dispatch),
            }
        }
        (runnable, deferred)
    }

    /// Put steps that got no worker slot back to pending for the next wave.
    /// Their retry budget is untouched.
    fn defer_steps(&self, id: Uuid, deferred: &[Dispatch]) {
        let mut book = self.book.lock();
        let Some(entry) = book.active.get_mut(&id) else {
            return;
        };
        for dispatch in deferred {
            if let Some(step) = entry.workflow.step_mut(&dispatch.step_id) {
                step.defer();
            }
        }
        debug!(
            parent: &self.span,
            workflow_id = %id,
            deferred = deferred.len(),
            "Steps deferred until worker slots free up"
        );
    }

    /// Record one attempt's outcome on its step. Returns the error when the
    /// step is now permanently failed.
    fn apply_outcome(
        &self,
        workflow: &mut Workflow,
        step_id: &str,
        outcome: ConductorResult<ExecutionResult>,
    ) -> Option<ConductorError> {
        let workflow_id = workflow.id;
        let step = workflow.step_mut(step_id)?;

        let (err, consumes_retry) = match outcome {
            Ok(result) => {
                step.attempts += 1;
                if let Some(worker) = result.metadata.get("worker").and_then(|w| w.as_str()) {
                    step.assigned_worker = Some(worker.to_string());
                }
                if result.success {
                    info!(
                        parent: &self.span,
                        workflow_id = %workflow_id,
                        step_id,
                        attempts = step.attempts,
                        "Step completed"
                    );
                    step.mark_completed(result.data);
                    return None;
                }
                let err = ConductorError::StepExecution {
                    step_id: step_id.to_string(),
                    message: result.error_message(),
                };
                (err, true)
            }
            Err(err @ ConductorError::WorkerAtCapacity { .. }) => {
                let consumes = self.config.capacity_consumes_retry;
                (err, consumes)
            }
            Err(err) => (err, true),
        };

        if err.is_retryable() && (!consumes_retry || step.retries_remaining()) {
            let delay = self.config.backoff.delay(step.retry_count);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            warn!(
                parent: &self.span,
                workflow_id = %workflow_id,
                step_id,
                retry = step.retry_count + u32::from(consumes_retry),
                max_retries = step.max_retries,
                delay_ms = millis(delay),
                error = %err,
                "Step attempt failed, retrying"
            );
            if consumes_retry {
                step.schedule_retry(err.to_string(), retry_at);
            } else {
                step.status = StepStatus::Pending;
                step.retry_at = Some(retry_at);
                step.last_error = Some(err.to_string());
            }
            return None;
        }

        error!(
            parent: &self.span,
            workflow_id = %workflow_id,
            step_id,
            attempts = step.attempts,
            error = %err,
            "Step failed permanently"
        );
        step.mark_failed(err.to_string());
        match err {
            ConductorError::StepExecution { .. } => Some(err),
            other => Some(ConductorError::StepExecution {
                step_id: step_id.to_string(),
                message: other.to_string(),
            }),
        }
    }

    fn complete_workflow(&self, id: Uuid, start: Instant) -> WorkflowResult {
        let mut book = self.book.lock();
        let Some(entry) = book.active.remove(&id) else {
            drop(book);
            return self.cancelled_result(id, start);
        };
        let mut workflow = entry.workflow;
        workflow.status = WorkflowStatus::Completed;
        workflow.completed_at = Some(Utc::now());
        let result = build_result(&workflow, None, None, start);
        info!(
            parent: &self.span,
            workflow_id = %id,
            steps = workflow.steps.len(),
            duration_ms = millis(start.elapsed()),
            "Workflow completed"
        );
        book.completed.push(workflow);
        result
    }

    fn fail_workflow(
        &self,
        id: Uuid,
        err: &ConductorError,
        failed_step: Option<String>,
        start: Instant,
    ) -> WorkflowResult {
        let mut book = self.book.lock();
        let Some(entry) = book.active.remove(&id) else {
            drop(book);
            return self.cancelled_result(id, start);
        };
        let mut workflow = entry.workflow;
        workflow.status = WorkflowStatus::Failed;
        workflow.completed_at = Some(Utc::now());
        let result = build_result(&workflow, Some(err.to_string()), failed_step, start);
        error!(parent: &self.span, workflow_id = %id, error = %err, "Workflow failed");
        book.failed.push(workflow);
        result
    }

    fn cancelled_result(&self, id: Uuid, start: Instant) -> WorkflowResult {
        let book = self.book.lock();
        match book.find(id) {
            Some(workflow) => {
                build_result(workflow, Some(ConductorError::Cancelled.to_string()), None, start)
            }
            None => detached_result(id, ConductorError::Cancelled.to_string()),
        }
    }
}

/// Failure result for a workflow with no book entry.
fn detached_result(id: Uuid, error: String) -> WorkflowResult {
    WorkflowResult {
        workflow_id: id,
        success: false,
        status: WorkflowStatus::Failed,
        data: BTreeMap::new(),
        error: Some(error),
        metadata: HashMap::new(),
    }
}

/// Compute the next wave and mark its steps running, merging dependency
/// results into each goal's context.
fn plan_wave(workflow: &mut Workflow) -> Wave {
    if workflow.is_done() {
        return Wave::Done;
    }
    let now = Utc::now();
    let ready = workflow.ready_steps(now);
    if ready.is_empty() {
        return match workflow.next_retry_at(now) {
            Some(at) => Wave::Backoff(at),
            None => Wave::Deadlock(workflow.pending_ids()),
        };
    }

    let mut dispatches = Vec::with_capacity(ready.len());
    for step_id in ready {
        let context = workflow.dependency_results(&step_id);
        let Some(step) = workflow.step_mut(&step_id) else {
            continue;
        };
        step.goal.context.extend(context);
        step.mark_running();
        dispatches.push(Dispatch {
            step_id,
            goal: step.goal.clone(),
            preferred: step.preferred_agent.clone(),
        });
    }
    Wave::Run(dispatches)
}

fn build_result(
    workflow: &Workflow,
    error: Option<String>,
    failed_step: Option<String>,
    start: Instant,
) -> WorkflowResult {
    let mut metadata = HashMap::new();
    metadata.insert("workflow_name".to_string(), workflow.name.clone().into());
    metadata.insert("status".to_string(), workflow.status.to_string().into());
    metadata.insert("total_steps".to_string(), workflow.steps.len().into());
    metadata.insert("completed_steps".to_string(), workflow.completed_count().into());
    metadata.insert(
        "duration_ms".to_string(),
        millis(start.elapsed()).into(),
    );
    let retries: u32 = workflow.steps.iter().map(|s| s.retry_count).sum();
    metadata.insert("total_retries".to_string(), retries.into());
    if let Some(step) = failed_step {
        metadata.insert("failed_step".to_string(), step.into());
    }

    WorkflowResult {
        workflow_id: workflow.id,
        success: workflow.status == WorkflowStatus::Completed && error.is_none(),
        status: workflow.status,
        data: workflow.results(),
        error,
        metadata,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::retry::BackoffPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        name: String,
        tags: Vec<CapabilityTag>,
        fail_first: u32,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(name: &str, fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                tags: vec![CapabilityTag::Analysis],
                fail_first,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Worker for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> &[CapabilityTag] {
            &self.tags
        }

        async fn execute(&self, goal: &Goal) -> ConductorResult<ExecutionResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(ConductorError::StepExecution {
                    step_id: goal.id.to_string(),
                    message: format!("scripted failure {n}"),
                });
            }
            Ok(ExecutionResult::success(serde_json::json!({
                "objective": goal.objective,
                "context_keys": goal.context.len(),
            })))
        }
    }

    struct Panicker;

    #[async_trait]
    impl Worker for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        fn capabilities(&self) -> &[CapabilityTag] {
            &[CapabilityTag::Analysis]
        }

        async fn execute(&self, _goal: &Goal) -> ConductorResult<ExecutionResult> {
            panic!("model returned garbage");
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(OrchestratorConfig::default().with_backoff(BackoffPolicy::none()))
    }

    #[tokio::test]
    async fn test_execute_goal_no_capable_worker() {
        let orch = orchestrator();
        let err = orch
            .execute_goal(&Goal::new("bake bread"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::NoCapableWorker { .. }));
    }

    #[tokio::test]
    async fn test_execute_goal_updates_performance() {
        let orch = orchestrator();
        orch.register_worker(Scripted::new("w", 1));
        let goal = Goal::new("analyze metrics");

        let first = orch.execute_goal(&goal, None).await.unwrap();
        assert!(!first.success);
        assert!(first.error.unwrap().contains("scripted failure 0"));

        let second = orch.execute_goal(&goal, None).await.unwrap();
        assert!(second.success);
        assert_eq!(second.metadata["worker"], "w");

        let record = orch.performance("w").unwrap();
        assert_eq!(record.total_executions, 2);
        assert_eq!(record.successful_executions, 1);
        assert_eq!(record.current_load, 0);
        assert_eq!(orch.worker_history("w").len(), 2);
    }

    #[tokio::test]
    async fn test_execute_goal_catches_panics() {
        let orch = orchestrator();
        orch.register_worker(Arc::new(Panicker));
        let result = orch
            .execute_goal(&Goal::new("analyze this"), None)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("model returned garbage"));
        assert_eq!(orch.performance("panicker").unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn test_execute_goal_prefers_capable_preferred() {
        let orch = orchestrator();
        orch.register_worker(Scripted::new("a", 0));
        orch.register_worker(Scripted::new("b", 0));
        let goal = Goal::new("analyze");
        let result = orch.execute_goal(&goal, Some("b")).await.unwrap();
        assert_eq!(result.metadata["worker"], "b");
        // Unknown preferred worker falls back to selection.
        let result = orch.execute_goal(&goal, Some("ghost")).await.unwrap();
        assert_eq!(result.metadata["worker"], "a");
    }

    #[tokio::test]
    async fn test_execute_goal_expired_deadline() {
        let orch = orchestrator();
        orch.register_worker(Scripted::new("w", 0));
        let goal =
            Goal::new("analyze").with_deadline(Utc::now() - chrono::Duration::seconds(1));
        let err = orch.execute_goal(&goal, None).await.unwrap_err();
        assert!(matches!(err, ConductorError::DeadlineExceeded { .. }));
        assert_eq!(orch.performance("w").unwrap().total_executions, 0);
    }

    #[tokio::test]
    async fn test_execute_unknown_workflow() {
        let orch = orchestrator();
        let result = orch.execute_workflow(Uuid::new_v4()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_execute_archived_workflow_again() {
        let orch = orchestrator();
        orch.register_worker(Scripted::new("w", 0));
        let id = orch
            .create_workflow("wf", "", vec![StepDefinition::new("analyze")], None)
            .unwrap();
        assert!(orch.execute_workflow(id).await.success);
        let again = orch.execute_workflow(id).await;
        assert!(!again.success);
        assert_eq!(again.status, WorkflowStatus::Completed);
        assert_eq!(again.data.len(), 1);
    }

    #[tokio::test]
    async fn test_context_merged_from_dependencies() {
        let orch = orchestrator();
        orch.register_worker(Scripted::new("w", 0));
        let id = orch
            .create_workflow(
                "ctx",
                "",
                vec![
                    StepDefinition::new("analyze a"),
                    StepDefinition::new("analyze b"),
                    StepDefinition::new("analyze both")
                        .depends_on(0usize)
                        .depends_on(1usize),
                ],
                None,
            )
            .unwrap();
        let result = orch.execute_workflow(id).await;
        assert!(result.success);
        let wf = orch.workflow(id).unwrap();
        let last = &wf.steps[2];
        assert_eq!(last.goal.context.len(), 2);
        assert_eq!(result.data[&last.id]["context_keys"], 2);
    }

    #[tokio::test]
    async fn test_outside_load_waits_without_spending_retries() {
        let backoff = BackoffPolicy {
            base_delay_ms: 2,
            max_delay_ms: 2,
            multiplier: 1.0,
            jitter: 0.0,
        };
        let orch = Orchestrator::new(
            OrchestratorConfig::default()
                .with_backoff(backoff)
                .with_max_concurrent_per_worker(1)
                .with_capacity_consumes_retry(false),
        );
        let worker = Scripted::new("w", 0);
        orch.register_worker(worker.clone());
        let held = orch.tracker().try_acquire("w", 1).unwrap();

        let id = orch
            .create_workflow(
                "wf",
                "",
                vec![StepDefinition::new("analyze").with_max_retries(0)],
                None,
            )
            .unwrap();
        let (result, ()) = tokio::join!(orch.execute_workflow(id), async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            drop(held);
        });

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.workflow(id).unwrap().steps[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume_flags() {
        let orch = orchestrator();
        let id = orch
            .create_workflow("wf", "", vec![StepDefinition::new("analyze")], None)
            .unwrap();
        assert!(orch.pause_workflow(id));
        assert!(!orch.pause_workflow(id));
        assert_eq!(orch.workflow(id).unwrap().status, WorkflowStatus::Paused);
        assert!(orch.resume_workflow(id));
        assert_eq!(orch.workflow(id).unwrap().status, WorkflowStatus::Pending);
        assert!(!orch.resume_workflow(id));
        assert!(!orch.pause_workflow(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_cancel_archives_as_failed() {
        let orch = orchestrator();
        let id = orch
            .create_workflow("wf", "", vec![StepDefinition::new("analyze")], None)
            .unwrap();
        assert!(orch.cancel_workflow(id));
        assert!(!orch.cancel_workflow(id));
        let status = orch.get_status();
        assert_eq!(status.active_workflows, 0);
        assert_eq!(status.failed_workflows, 1);
        let wf = orch.workflow(id).unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.metadata["cancelled"], true);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let orch = orchestrator();
        orch.register_worker(Scripted::new("w", 0));
        let id = orch
            .create_workflow("wf", "", vec![StepDefinition::new("analyze")], None)
            .unwrap();
        orch.execute_workflow(id).await;

        let status = orch.get_status();
        assert_eq!(status.registered_workers, 1);
        assert_eq!(status.completed_workflows, 1);
        assert_eq!(status.success_rate, 1.0);
        let metrics = &status.per_worker_metrics["w"];
        assert!(metrics.active);
        assert_eq!(metrics.total_executions, 1);
        assert_eq!(metrics.capabilities, vec![CapabilityTag::Analysis]);

        let json = status.to_json();
        assert_eq!(json["registered_workers"], 1);
        assert!(json["per_worker_metrics"]["w"].is_object());
    }

    #[tokio::test]
    async fn test_shutdown_deactivates_workers() {
        let orch = orchestrator();
        orch.register_worker(Scripted::new("w", 0));
        orch.shutdown();
        assert!(orch.capable_workers(&Goal::new("analyze")).is_empty());
        assert_eq!(orch.get_status().registered_workers, 1);
        assert!(!orch.get_status().per_worker_metrics["w"].active);
    }

    #[test]
    fn test_panic_message_payloads() {
        let s: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let s: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");
        let s: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(s.as_ref()), "unknown panic payload");
    }
}
