use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Urgency of a goal. Ordered: `Low < Medium < High < Critical`.
///
/// Deserializes from either a name (`"high"`) or a number from 1 to 10.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase", try_from = "PriorityRepr")]
pub enum Priority {
    /// Background work.
    Low,
    /// Normal work.
    #[default]
    Medium,
    /// Should run ahead of normal work.
    High,
    /// Run first.
    Critical,
}

impl Priority {
    /// Maps a 1–10 score onto the named levels.
    pub fn from_score(score: u8) -> Option<Self> {
        match score {
            1..=3 => Some(Priority::Low),
            4..=6 => Some(Priority::Medium),
            7..=8 => Some(Priority::High),
            9..=10 => Some(Priority::Critical),
            _ => None,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" | "normal" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" | "urgent" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PriorityRepr {
    Score(u8),
    Name(String),
}

impl TryFrom<PriorityRepr> for Priority {
    type Error = String;

    fn try_from(repr: PriorityRepr) -> Result<Self, Self::Error> {
        match repr {
            PriorityRepr::Score(score) => Priority::from_score(score)
                .ok_or_else(|| format!("priority score {score} outside 1-10")),
            PriorityRepr::Name(name) => name.parse(),
        }
    }
}

/// A declarative unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    /// Free-text description, also used for capability routing.
    pub objective: String,
    /// Worker-defined parameters.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Ids of goals that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Results merged in from dependency goals before execution.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            objective: objective.into(),
            parameters: HashMap::new(),
            priority: Priority::default(),
            deadline: None,
            dependencies: Vec::new(),
            context: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
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

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// True once the deadline (if any) lies in the past.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| d < Utc::now())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_creation() {
        let goal = Goal::new("Search for async runtimes");
        assert_eq!(goal.priority, Priority::Medium);
        assert!(goal.dependencies.is_empty());
        assert!(goal.context.is_empty());
        assert!(!goal.is_expired());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_priority_from_score() {
        assert_eq!(Priority::from_score(1), Some(Priority::Low));
        assert_eq!(Priority::from_score(5), Some(Priority::Medium));
        assert_eq!(Priority::from_score(8), Some(Priority::High));
        assert_eq!(Priority::from_score(10), Some(Priority::Critical));
        assert_eq!(Priority::from_score(0), None);
        assert_eq!(Priority::from_score(11), None);
    }

    #[test]
    fn test_priority_deserialize_forms() {
        let p: Priority = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(p, Priority::High);
        let p: Priority = serde_json::from_str("9").unwrap();
        assert_eq!(p, Priority::Critical);
        assert!(serde_json::from_str::<Priority>("42").is_err());
        assert!(serde_json::from_str::<Priority>("\"whenever\"").is_err());
        assert_eq!(serde_json::to_string(&Priority::Low).unwrap(), "\"low\"");
    }

    #[test]
    fn test_expired_deadline() {
        let goal = Goal::new("Verify claims")
            .with_deadline(Utc::now() - chrono::Duration::seconds(5));
        assert!(goal.is_expired());
        let goal = Goal::new("Verify claims")
            .with_deadline(Utc::now() + chrono::Duration::hours(1));
        assert!(!goal.is_expired());
    }
}
