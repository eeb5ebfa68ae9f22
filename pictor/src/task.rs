//! Task handles.
//!
//! An [`ImageTask`] is the submitter-facing handle for one in-flight load.
//! The handle can change the task's priority, cancel it, and snapshot its
//! progress; everything else happens inside the pipeline, which retains the
//! task until its terminal callback fires.

use crate::pipeline::orchestrator::PipelineEvent;
use crate::request::RequestPriority;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a task.
///
/// Task IDs are monotonically increasing and unique within a process
/// lifetime; they correlate log messages and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Snapshot of a task's download progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskProgress {
    /// Bytes received so far.
    pub completed: u64,
    /// Expected total bytes, when the server reported one.
    pub total: u64,
}

impl TaskProgress {
    /// Completed fraction in `[0, 1]`, when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.completed as f64 / self.total as f64)
        }
    }
}

/// State shared between the handle, the orchestrator, and delivery.
pub(crate) struct TaskShared {
    id: TaskId,
    cancelled: AtomicBool,
    completed: AtomicU64,
    total: AtomicU64,
    priority: AtomicU8,
}

impl TaskShared {
    pub(crate) fn new(priority: RequestPriority) -> Self {
        Self {
            id: TaskId::new(),
            cancelled: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            total: AtomicU64::new(0),
            priority: AtomicU8::new(priority.as_u8()),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns true only for the transition that actually cancelled.
    pub(crate) fn mark_cancelled(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_progress(&self, completed: u64, total: u64) {
        self.completed.store(completed, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    pub(crate) fn progress(&self) -> TaskProgress {
        TaskProgress {
            completed: self.completed.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_priority(&self, priority: RequestPriority) {
        self.priority.store(priority.as_u8(), Ordering::Relaxed);
    }

    pub(crate) fn priority(&self) -> RequestPriority {
        RequestPriority::from_u8(self.priority.load(Ordering::Relaxed))
    }
}

/// Handle for one submitted load.
///
/// Dropping the handle does not cancel the load; cancellation is explicit.
pub struct ImageTask {
    shared: Arc<TaskShared>,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl ImageTask {
    pub(crate) fn new(
        shared: Arc<TaskShared>,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        Self { shared, events }
    }

    /// Returns the task's identifier.
    pub fn id(&self) -> TaskId {
        self.shared.id()
    }

    /// Materializes the current progress counters.
    pub fn progress(&self) -> TaskProgress {
        self.shared.progress()
    }

    /// Returns the task's current priority.
    pub fn priority(&self) -> RequestPriority {
        self.shared.priority()
    }

    /// Returns true once [`ImageTask::cancel`] has run.
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Changes the task's priority. The owning session re-sorts waiting work
    /// accordingly; in-flight work is unaffected.
    pub fn set_priority(&self, priority: RequestPriority) {
        self.shared.set_priority(priority);
        let _ = self.events.send(PipelineEvent::SetPriority {
            task_id: self.id(),
            priority,
        });
    }

    /// Cancels the task. Idempotent and instantaneous: after the first call
    /// the task will receive no completion callback, only the metrics hook.
    pub fn cancel(&self) {
        if self.shared.mark_cancelled() {
            let _ = self
                .events
                .send(PipelineEvent::CancelTask { task_id: self.id() });
        }
    }
}

impl std::fmt::Debug for ImageTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageTask")
            .field("id", &self.shared.id())
            .field("priority", &self.shared.priority())
            .field("is_cancelled", &self.shared.is_cancelled())
            .finish()
    }
}
