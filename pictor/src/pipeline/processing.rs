//! Processing sessions: shared processor runs.
//!
//! Two tasks asking for the same transformation of the same decoded image
//! share one processing run. Identity is (processor identifier, image
//! identity); the run is cancelled automatically when its subscriber set
//! empties.

use crate::cancellation::CancellationSource;
use crate::image::ImageContainer;
use crate::process::ImageProcessor;
use crate::queue::OperationId;
use crate::request::RequestPriority;
use crate::task::TaskId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static PROCESSING_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a processing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessingId(u64);

impl ProcessingId {
    pub(crate) fn new() -> Self {
        Self(PROCESSING_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProcessingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "processing-{}", self.0)
    }
}

/// Identity of a shared processing run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ProcessingKey {
    /// Processor identity (value equality).
    pub processor: String,
    /// Identity of the input image (pointer identity of the shared pixels).
    pub image_identity: usize,
}

impl ProcessingKey {
    pub fn new(processor: &dyn ImageProcessor, input: &ImageContainer) -> Self {
        Self {
            processor: processor.identifier().to_owned(),
            image_identity: input.identity(),
        }
    }
}

/// One shared processor run within a load session.
pub(crate) struct ProcessingSession {
    pub id: ProcessingId,
    pub key: ProcessingKey,
    /// The image being processed; its `is_final` flag decides whether the
    /// result is terminal or a progress event.
    pub input: ImageContainer,
    pub subscribers: HashSet<TaskId>,
    pub operation: OperationId,
    pub cancel_source: Arc<CancellationSource>,
}

impl ProcessingSession {
    /// Max priority over the given subscriber priorities; queue admission
    /// uses this.
    pub fn priority_of<I>(priorities: I) -> RequestPriority
    where
        I: IntoIterator<Item = RequestPriority>,
    {
        priorities
            .into_iter()
            .max()
            .unwrap_or(RequestPriority::VeryLow)
    }

    /// Removes a subscriber. Returns true when the set emptied.
    pub fn unsubscribe(&mut self, task_id: TaskId) -> bool {
        self.subscribers.remove(&task_id);
        self.subscribers.is_empty()
    }
}
