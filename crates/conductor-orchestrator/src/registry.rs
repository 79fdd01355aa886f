use crate::capability::CapabilityMatcher;
use crate::goal::Goal;
use crate::performance::PerformanceTracker;
use crate::worker::Worker;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Span};

struct RegisteredWorker {
    worker: Arc<dyn Worker>,
    active: bool,
    /// Position in registration order, used to break score ties.
    order: u64,
}

/// Central registry of available workers, answering capability queries.
pub struct AgentRegistry {
    workers: HashMap<String, RegisteredWorker>,
    next_order: u64,
    matcher: CapabilityMatcher,
    tracker: Arc<PerformanceTracker>,
    span: Span,
}

impl AgentRegistry {
    pub fn new(matcher: CapabilityMatcher, tracker: Arc<PerformanceTracker>) -> Self {
        Self {
            workers: HashMap::new(),
            next_order: 0,
            matcher,
            tracker,
            span: info_span!("agent_registry"),
        }
    }

    /// Emit all registry events inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Insert a worker, replacing any worker with the same name.
    ///
    /// A replacement keeps the original registration position and statistics.
    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        let name = worker.name().to_string();
        self.tracker.register(&name);
        if let Some(existing) = self.workers.get_mut(&name) {
            existing.worker = worker;
            existing.active = true;
            warn!(parent: &self.span, worker = %name, "Overwriting registered worker");
            return;
        }
        info!(
            parent: &self.span,
            worker = %name,
            capabilities = ?worker.capabilities(),
            "Registered worker"
        );
        let order = self.next_order;
        self.next_order += 1;
        self.workers.insert(
            name,
            RegisteredWorker {
                worker,
                active: true,
                order,
            },
        );
    }

    /// Remove a worker and its statistics. Returns whether it was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        if self.workers.remove(name).is_some() {
            self.tracker.unregister(name);
            info!(parent: &self.span, worker = %name, "Unregistered worker");
            true
        } else {
            warn!(parent: &self.span, worker = %name, "Unregister of unknown worker ignored");
            false
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).map(|w| Arc::clone(&w.worker))
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.workers.get(name).is_some_and(|w| w.active)
    }

    /// Toggle selectability of a worker without removing it.
    pub fn set_active(&mut self, name: &str, active: bool) -> bool {
        match self.workers.get_mut(name) {
            Some(entry) => {
                entry.active = active;
                debug!(parent: &self.span, worker = %name, active, "Worker activity changed");
                true
            }
            None => false,
        }
    }

    /// Deactivate every worker (used on shutdown).
    pub fn deactivate_all(&mut self) {
        for entry in self.workers.values_mut() {
            entry.active = false;
        }
        info!(parent: &self.span, count = self.workers.len(), "All workers deactivated");
    }

    /// Active workers able to handle `goal`, in registration order.
    pub fn find_capable(&self, goal: &Goal) -> Vec<Arc<dyn Worker>> {
        let mut capable: Vec<&RegisteredWorker> = self
            .workers
            .values()
            .filter(|w| w.active && w.worker.can_handle(goal, &self.matcher))
            .collect();
        capable.sort_by_key(|w| w.order);
        capable.into_iter().map(|w| Arc::clone(&w.worker)).collect()
    }

    /// Capable workers paired with their current score, in registration order.
    pub fn ranked(&self, goal: &Goal) -> Vec<(Arc<dyn Worker>, f64)> {
        self.find_capable(goal)
            .into_iter()
            .map(|w| {
                let score = self.tracker.score(w.name());
                (w, score)
            })
            .collect()
    }

    /// The highest-scoring capable worker. Ties go to the earliest registered.
    pub fn select_best(&self, goal: &Goal) -> Option<Arc<dyn Worker>> {
        let mut best: Option<(Arc<dyn Worker>, f64)> = None;
        for (worker, score) in self.ranked(goal) {
            match &best {
                Some((_, best_score)) if score <= *best_score => {}
                _ => best = Some((worker, score)),
            }
        }
        if let Some((worker, score)) = &best {
            debug!(
                parent: &self.span,
                worker = %worker.name(),
                score,
                objective = %goal.objective,
                "Selected worker"
            );
        }
        best.map(|(worker, _)| worker)
    }

    /// Whether `name` is registered, active, and able to handle `goal`.
    pub fn is_capable(&self, name: &str, goal: &Goal) -> bool {
        self.workers
            .get(name)
            .is_some_and(|w| w.active && w.worker.can_handle(goal, &self.matcher))
    }

    /// Worker names in registration order.
    pub fn worker_names(&self) -> Vec<String> {
        let mut entries: Vec<(&String, u64)> =
            self.workers.iter().map(|(n, w)| (n, w.order)).collect();
        entries.sort_by_key(|(_, order)| *order);
        entries.into_iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn matcher(&self) -> &CapabilityMatcher {
        &self.matcher
    }

    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        &self.tracker
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
