//! Process-local ordered list of pending deferred calls.

use std::collections::BTreeSet;
use std::sync::Arc;

/// A deferred call waiting for its fire time.
///
/// Ordered by fire time first and service name second, so two services
/// scheduling for the same nanosecond are distinct entries and removal by
/// `(service, fire_at)` always finds the right one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DelayedTask {
    // Field order defines the derived ordering.
    /// Unix nanosecond fire time.
    pub fire_at: i64,
    /// Service the call targets.
    pub service: Arc<str>,
}

impl DelayedTask {
    /// Create a task.
    pub fn new(service: impl Into<Arc<str>>, fire_at: i64) -> Self {
        Self {
            fire_at,
            service: service.into(),
        }
    }
}

/// Pending tasks, ascending by `(fire_at, service)`.
///
/// A cache of the durable delay hashes, never the source of truth: it can
/// always be rebuilt from them.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    tasks: BTreeSet<DelayedTask>,
}

impl TaskQueue {
    // ---
    /// Insert a task; returns false if the same key was already pending.
    pub(crate) fn insert(&mut self, task: DelayedTask) -> bool {
        self.tasks.insert(task)
    }

    /// Remove the task with exactly this key; returns whether it was pending.
    pub(crate) fn remove(&mut self, task: &DelayedTask) -> bool {
        self.tasks.remove(task)
    }

    /// Earliest pending task.
    pub(crate) fn peek(&self) -> Option<&DelayedTask> {
        self.tasks.first()
    }

    /// Pop the earliest task if it is due at `now` (unix nanos).
    pub(crate) fn pop_due(&mut self, now: i64) -> Option<DelayedTask> {
        // ---
        match self.tasks.first() {
            Some(head) if head.fire_at <= now => self.tasks.pop_first(),
            _ => None,
        }
    }

    /// Replace the whole content.
    pub(crate) fn replace(&mut self, tasks: impl IntoIterator<Item = DelayedTask>) {
        self.tasks = tasks.into_iter().collect();
    }

    /// Add every task not already pending.
    pub(crate) fn merge(&mut self, tasks: impl IntoIterator<Item = DelayedTask>) {
        self.tasks.extend(tasks);
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// All pending tasks in firing order.
    pub(crate) fn snapshot(&self) -> Vec<DelayedTask> {
        self.tasks.iter().cloned().collect()
    }
}
