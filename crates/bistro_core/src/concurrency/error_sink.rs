//! Central sink for failures that have no caller to return to.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// A failure recorded by the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Name of the task or step that failed.
    pub task: String,
    /// Human-readable cause.
    pub message: String,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

/// Collects failures from background tasks and best-effort steps.
///
/// Every report is logged at `error` level and kept in a bounded ring so
/// a UI or test can inspect recent failures.
#[derive(Debug)]
pub struct ErrorSink {
    recent: Mutex<VecDeque<TaskFailure>>,
    capacity: usize,
    total: AtomicU64,
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::with_capacity(256)
    }
}

impl ErrorSink {
    /// Creates a sink keeping the last `capacity` failures.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            total: AtomicU64::new(0),
        }
    }

    /// Records a failure.
    pub fn report(&self, task: &str, message: impl Into<String>) {
        let failure = TaskFailure {
            task: task.to_string(),
            message: message.into(),
            at: Utc::now(),
        };
        tracing::error!(task = %failure.task, error = %failure.message, "task failed");
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(failure);
    }

    /// Failures still held, oldest first.
    pub fn recent(&self) -> Vec<TaskFailure> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Total failures reported since creation.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Removes and returns all held failures.
    pub fn drain(&self) -> Vec<TaskFailure> {
        self.recent.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let sink = ErrorSink::with_capacity(2);
        sink.report("a", "one");
        sink.report("b", "two");
        sink.report("c", "three");

        let recent = sink.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].task, "b");
        assert_eq!(recent[1].message, "three");
        assert_eq!(sink.total(), 3);

        assert_eq!(sink.drain().len(), 2);
        assert!(sink.recent().is_empty());
    }
}
