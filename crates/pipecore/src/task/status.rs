use crate::{EventEmitter, TaskId};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Mutable progress record of a running task.
///
/// Counters only ever grow. The status is consumed by
/// `TaskResult::from_status`, so a task reaches a terminal state once.
#[derive(Debug)]
pub struct TaskStatus {
    task_id: TaskId,
    step_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    description: String,
    progress: f64,
    counters: BTreeMap<String, u64>,
    events: Option<EventEmitter>,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, step_id: impl Into<String>) -> Self {
        Self {
            task_id,
            step_id: step_id.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            description: String::new(),
            progress: 0.0,
            counters: BTreeMap::new(),
            events: None,
        }
    }

    /// Forward progress and counter updates to an event emitter.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Add `n` to a named counter and return the new value.
    pub fn increment(&mut self, counter: &str, n: u64) -> u64 {
        let value = self.counters.entry(counter.to_string()).or_insert(0);
        *value = value.saturating_add(n);
        let value = *value;
        if let Some(events) = &self.events {
            events.counter(counter, value);
        }
        value
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> &BTreeMap<String, u64> {
        &self.counters
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
        if let Some(events) = &self.events {
            events.info(self.description.clone());
        }
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Set progress as a fraction, clamped to `[0, 1]`. NaN is ignored.
    pub fn set_progress(&mut self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        self.progress = fraction.clamp(0.0, 1.0);
        if let Some(events) = &self.events {
            events.progress(self.progress);
        }
    }

    pub(crate) fn into_parts(self) -> (TaskId, String, DateTime<Utc>, Duration, String, BTreeMap<String, u64>) {
        let elapsed = self.started.elapsed();
        (
            self.task_id,
            self.step_id,
            self.started_at,
            elapsed,
            self.description,
            self.counters,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_counters_are_monotonic() {
        let mut status = TaskStatus::new(Uuid::new_v4(), "copy");
        assert_eq!(status.counter("bytes"), 0);
        assert_eq!(status.increment("bytes", 10), 10);
        assert_eq!(status.increment("bytes", 0), 10);
        assert_eq!(status.increment("bytes", u64::MAX), u64::MAX);
        assert_eq!(status.counter("bytes"), u64::MAX);
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut status = TaskStatus::new(Uuid::new_v4(), "copy");
        status.set_progress(1.5);
        assert_eq!(status.progress(), 1.0);
        status.set_progress(-0.2);
        assert_eq!(status.progress(), 0.0);
        status.set_progress(f64::NAN);
        assert_eq!(status.progress(), 0.0);
    }
}
