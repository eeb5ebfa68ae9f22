//! Bounded, priority-aware operation queues.
//!
//! Each pipeline stage that must not run unbounded work (network, decode,
//! processing) admits operations through an [`OperationQueue`]: a FIFO with a
//! maximum in-flight count. Waiting operations start in priority order with
//! ties broken by enqueue time; a priority change re-sorts the waiting region
//! only, in-flight operations are never preempted.
//!
//! An admitted operation receives an [`OperationHandle`] and must finish it
//! exactly once; the handle finishes itself on drop so a panicking operation
//! cannot wedge the queue. Cancelling a waiting operation removes it before
//! it ever starts; cancelling an in-flight operation invokes its cancel hook
//! and the operation is still expected to finish its handle.

use crate::request::RequestPriority;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

static OPERATION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an operation across all queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(u64);

impl OperationId {
    fn new() -> Self {
        Self(OPERATION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value, for logging.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

type Work = Box<dyn FnOnce(OperationHandle) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

struct WaitingOperation {
    id: OperationId,
    priority: RequestPriority,
    seq: u64,
    work: Work,
    cancel_hook: Option<CancelHook>,
}

struct InFlightOperation {
    cancel_hook: Option<CancelHook>,
}

struct QueueState {
    waiting: Vec<WaitingOperation>,
    in_flight: HashMap<OperationId, InFlightOperation>,
    next_seq: u64,
}

struct Inner {
    label: &'static str,
    capacity: usize,
    state: Mutex<QueueState>,
}

/// A FIFO admission queue with a bounded in-flight count.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<Inner>,
}

impl OperationQueue {
    /// Creates a queue with the given in-flight cap.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize, label: &'static str) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            inner: Arc::new(Inner {
                label,
                capacity,
                state: Mutex::new(QueueState {
                    waiting: Vec::new(),
                    in_flight: HashMap::new(),
                    next_seq: 0,
                }),
            }),
        }
    }

    /// Enqueues an operation.
    ///
    /// `work` runs when the operation is admitted, receiving the handle it
    /// must finish. `cancel_hook` is invoked only if the operation is
    /// cancelled while in flight.
    pub fn enqueue(
        &self,
        priority: RequestPriority,
        cancel_hook: impl FnOnce() + Send + 'static,
        work: impl FnOnce(OperationHandle) + Send + 'static,
    ) -> OperationId {
        let id = OperationId::new();
        {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiting.push(WaitingOperation {
                id,
                priority,
                seq,
                work: Box::new(work),
                cancel_hook: Some(Box::new(cancel_hook)),
            });
            trace!(
                queue = self.inner.label,
                id = %id,
                priority = ?priority,
                waiting = state.waiting.len(),
                "Operation enqueued"
            );
        }
        self.pump();
        id
    }

    /// Cancels an operation.
    ///
    /// Waiting operations are removed immediately and never start. In-flight
    /// operations get their cancel hook invoked; they still own their handle
    /// and must finish it.
    pub fn cancel(&self, id: OperationId) {
        let hook = {
            let mut state = self.inner.state.lock();
            if let Some(pos) = state.waiting.iter().position(|op| op.id == id) {
                state.waiting.remove(pos);
                debug!(queue = self.inner.label, id = %id, "Waiting operation cancelled");
                None
            } else if let Some(op) = state.in_flight.get_mut(&id) {
                debug!(queue = self.inner.label, id = %id, "In-flight operation cancelled");
                op.cancel_hook.take()
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Updates the priority of a waiting operation.
    ///
    /// In-flight operations are unaffected; the waiting region is re-sorted
    /// at the next admission.
    pub fn set_priority(&self, id: OperationId, priority: RequestPriority) {
        let mut state = self.inner.state.lock();
        if let Some(op) = state.waiting.iter_mut().find(|op| op.id == id) {
            op.priority = priority;
        }
    }

    /// Returns the number of operations currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Returns the number of operations waiting for admission.
    pub fn waiting_count(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    /// Returns the configured in-flight cap.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Admits waiting operations while capacity allows.
    fn pump(&self) {
        loop {
            let (id, work) = {
                let mut state = self.inner.state.lock();
                if state.in_flight.len() >= self.inner.capacity || state.waiting.is_empty() {
                    return;
                }
                // Highest priority first; FIFO within a priority level.
                let best = state
                    .waiting
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| {
                        a.priority
                            .cmp(&b.priority)
                            .then(b.seq.cmp(&a.seq))
                    })
                    .map(|(idx, _)| idx);
                let Some(idx) = best else { return };
                let op = state.waiting.remove(idx);
                state.in_flight.insert(
                    op.id,
                    InFlightOperation {
                        cancel_hook: op.cancel_hook,
                    },
                );
                (op.id, op.work)
            };
            trace!(queue = self.inner.label, id = %id, "Operation started");
            // Run the work outside the lock: it may spawn, or finish
            // synchronously and re-enter the queue.
            work(OperationHandle {
                queue: Arc::clone(&self.inner),
                id,
                finished: false,
            });
        }
    }

    fn finish(&self, id: OperationId) {
        let removed = self.inner.state.lock().in_flight.remove(&id).is_some();
        if removed {
            trace!(queue = self.inner.label, id = %id, "Operation finished");
            self.pump();
        }
    }
}

/// Handle owned by a running operation.
///
/// Finishing releases the operation's in-flight slot and admits the next
/// waiting operation. Dropping an unfinished handle finishes it, so the slot
/// is released even if the operation's task dies.
pub struct OperationHandle {
    queue: Arc<Inner>,
    id: OperationId,
    finished: bool,
}

impl OperationHandle {
    /// Marks the operation complete. Consumes the handle; calling it twice is
    /// impossible by construction.
    pub fn finish(mut self) {
        self.finish_inner();
    }

    /// Returns the operation's identifier.
    pub fn id(&self) -> OperationId {
        self.id
    }

    fn finish_inner(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        OperationQueue {
            inner: Arc::clone(&self.queue),
        }
        .finish(self.id);
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        self.finish_inner();
    }
}
