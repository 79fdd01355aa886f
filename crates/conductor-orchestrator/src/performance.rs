use crate::goal::Goal;
use crate::history::{ExecutionHistory, ExecutionRecord};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Rolling statistics for one worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub total_executions: u64,
    pub successful_executions: u64,
    /// Sum of all execution times in seconds.
    pub total_execution_secs: f64,
    /// Goals currently in flight.
    pub current_load: usize,
}

impl PerformanceRecord {
    /// A record with history but no load. `successful` is clamped to `total`.
    pub fn new(total: u64, successful: u64, total_execution_secs: f64) -> Self {
        Self {
            total_executions: total,
            successful_executions: successful.min(total),
            total_execution_secs: total_execution_secs.max(0.0),
            current_load: 0,
        }
    }

    /// Fraction of successful executions. A worker that never ran scores 1.0.
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            1.0
        } else {
            self.successful_executions as f64 / self.total_executions as f64
        }
    }

    /// Mean execution time in seconds, 0.0 before the first execution.
    pub fn avg_execution_secs(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.total_execution_secs / self.total_executions as f64
        }
    }

    /// Selection score: `0.5·success + 0.3/(avg_secs + 1) + 0.2/(load + 1)`.
    pub fn score(&self) -> f64 {
        0.5 * self.success_rate()
            + 0.3 * (1.0 / (self.avg_execution_secs() + 1.0))
            + 0.2 * (1.0 / (self.current_load as f64 + 1.0))
    }

    fn record_completion(&mut self, success: bool, elapsed: Duration) {
        self.total_executions += 1;
        if success {
            self.successful_executions += 1;
        }
        self.total_execution_secs += elapsed.as_secs_f64();
    }
}

struct WorkerStats {
    record: PerformanceRecord,
    history: ExecutionHistory,
}

/// Per-worker statistics feeding the selection heuristic.
///
/// Load accounting goes through [`LoadGuard`], so a dispatch that is dropped
/// mid-flight still releases its slot.
pub struct PerformanceTracker {
    stats: RwLock<HashMap<String, WorkerStats>>,
    history_capacity: usize,
}

impl PerformanceTracker {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            stats: RwLock::new(HashMap::new()),
            history_capacity,
        }
    }

    /// Start tracking `name`. Existing statistics are kept.
    pub fn register(&self, name: &str) {
        let mut stats = self.stats.write();
        stats
            .entry(name.to_string())
            .or_insert_with(|| self.empty_stats());
    }

    /// Drop all statistics for `name`.
    pub fn unregister(&self, name: &str) {
        self.stats.write().remove(name);
    }

    /// Seed the record for `name`, e.g. from persisted statistics.
    /// The in-flight load is preserved.
    pub fn restore(&self, name: &str, record: PerformanceRecord) {
        let mut stats = self.stats.write();
        let entry = stats
            .entry(name.to_string())
            .or_insert_with(|| self.empty_stats());
        let load = entry.record.current_load;
        entry.record = PerformanceRecord {
            current_load: load,
            ..record
        };
    }

    pub fn record(&self, name: &str) -> Option<PerformanceRecord> {
        self.stats.read().get(name).map(|s| s.record.clone())
    }

    pub fn score(&self, name: &str) -> f64 {
        self.record(name).unwrap_or_default().score()
    }

    pub fn load(&self, name: &str) -> usize {
        self.stats
            .read()
            .get(name)
            .map(|s| s.record.current_load)
            .unwrap_or(0)
    }

    /// Reserve one execution slot for `name` unless it already runs `limit` goals.
    pub fn try_acquire(self: &Arc<Self>, name: &str, limit: usize) -> Option<LoadGuard> {
        let mut stats = self.stats.write();
        let entry = stats
            .entry(name.to_string())
            .or_insert_with(|| self.empty_stats());
        if entry.record.current_load >= limit {
            return None;
        }
        entry.record.current_load += 1;
        Some(LoadGuard {
            tracker: Arc::clone(self),
            name: name.to_string(),
            released: false,
        })
    }

    /// Past executions of `name`, oldest first.
    pub fn history(&self, name: &str) -> Vec<ExecutionRecord> {
        self.stats
            .read()
            .get(name)
            .map(|s| s.history.entries())
            .unwrap_or_default()
    }

    /// Records of every tracked worker, keyed by name.
    pub fn snapshot(&self) -> BTreeMap<String, PerformanceRecord> {
        self.stats
            .read()
            .iter()
            .map(|(name, s)| (name.clone(), s.record.clone()))
            .collect()
    }

    fn empty_stats(&self) -> WorkerStats {
        WorkerStats {
            record: PerformanceRecord::default(),
            history: ExecutionHistory::new(self.history_capacity),
        }
    }

    fn release(&self, name: &str) {
        if let Some(entry) = self.stats.write().get_mut(name) {
            entry.record.current_load = entry.record.current_load.saturating_sub(1);
        }
    }

    fn complete(&self, name: &str, record: ExecutionRecord, elapsed: Duration) {
        let mut stats = self.stats.write();
        if let Some(entry) = stats.get_mut(name) {
            entry.record.current_load = entry.record.current_load.saturating_sub(1);
            entry.record.record_completion(record.success, elapsed);
            entry.history.push(record);
        }
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(100)
    }
}

/// One reserved execution slot. Dropping it without [`LoadGuard::finish`]
/// releases the slot without recording an execution.
pub struct LoadGuard {
    tracker: Arc<PerformanceTracker>,
    name: String,
    released: bool,
}

impl LoadGuard {
    pub fn worker(&self) -> &str {
        &self.name
    }

    /// Release the slot and record the execution outcome.
    pub fn finish(mut self, goal: &Goal, success: bool, elapsed: Duration, error: Option<String>) {
        let record = ExecutionRecord {
            goal_id: goal.id,
            objective: goal.objective.clone(),
            success,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            error,
            finished_at: Utc::now(),
        };
        self.tracker.complete(&self.name, record, elapsed);
        self.released = true;
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if !self.released {
            self.tracker.release(&self.name);
        }
    }
}
