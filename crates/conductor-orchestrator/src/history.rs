use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// One past execution of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub goal_id: Uuid,
    pub objective: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Fixed-capacity execution history. The oldest entry is evicted first.
#[derive(Debug, Clone)]
pub struct ExecutionHistory {
    entries: VecDeque<ExecutionRecord>,
    capacity: usize,
}

impl ExecutionHistory {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, record: ExecutionRecord) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<ExecutionRecord> {
        self.entries.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&ExecutionRecord> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn record(objective: &str, success: bool) -> ExecutionRecord {
        ExecutionRecord {
            goal_id: Uuid::new_v4(),
            objective: objective.to_string(),
            success,
            duration_ms: 10,
            error: None,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_push_within_capacity() {
        let mut history = ExecutionHistory::new(3);
        assert!(history.is_empty());
        history.push(record("a", true));
        history.push(record("b", false));
        assert_eq!(history.len(), 2);
        assert_eq!(history.last().unwrap().objective, "b");
    }

    #[test]
    fn test_evicts_oldest() {
        let mut history = ExecutionHistory::new(2);
        history.push(record("a", true));
        history.push(record("b", true));
        history.push(record("c", true));
        let objectives: Vec<String> = history.entries().into_iter().map(|r| r.objective).collect();
        assert_eq!(objectives, vec!["b", "c"]);
        assert_eq!(history.capacity(), 2);
    }

    #[test]
    fn test_zero_capacity_bumped() {
        let mut history = ExecutionHistory::new(0);
        history.push(record("a", true));
        history.push(record("b", true));
        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().objective, "b");
    }
}
