use crate::{ErrorKind, TaskError, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Final outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub step_id: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub description: String,
    pub counters: BTreeMap<String, u64>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl TaskResult {
    /// Close out a status. `error` decides success.
    pub fn from_status(status: TaskStatus, error: Option<&TaskError>) -> Self {
        let (task_id, step_id, started_at, elapsed, description, counters) = status.into_parts();
        Self {
            task_id,
            step_id,
            success: error.is_none(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: millis(elapsed),
            description,
            counters,
            error: error.map(|e| e.to_string()),
            error_kind: error.map(TaskError::kind),
        }
    }

    /// A failed result for a task that never ran or never finished.
    pub fn failed(task_id: TaskId, step_id: impl Into<String>, error: &TaskError) -> Self {
        Self::from_status(TaskStatus::new(task_id, step_id), Some(error))
    }

    /// Result for a task whose producer went away before reporting.
    pub fn abandoned(task_id: TaskId, step_id: impl Into<String>) -> Self {
        Self::failed(task_id, step_id, &TaskError::Abandoned)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_result_from_status() {
        let mut status = TaskStatus::new(Uuid::new_v4(), "align");
        status.increment("reads", 42);
        status.set_description("aligned");

        let result = TaskResult::from_status(status, None);
        assert!(result.success);
        assert_eq!(result.counter("reads"), 42);
        assert_eq!(result.description, "aligned");
        assert!(result.error.is_none());
    }

    #[test]
    fn test_abandoned_result() {
        let id = Uuid::new_v4();
        let result = TaskResult::abandoned(id, "align");
        assert_eq!(result.task_id, id);
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));

        let json = serde_json::to_string(&result).unwrap();
        let back: TaskResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
