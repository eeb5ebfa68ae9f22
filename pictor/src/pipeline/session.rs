//! Load sessions: shared state for one logical load.
//!
//! A session coalesces every task whose request maps to the same load key.
//! It owns the accumulated byte buffer, the lazily created decoder, the
//! in-flight operation handles, and the per-task processing sessions. All
//! mutation happens on the pipeline context; the buffer sits behind a mutex
//! only so decode operations can snapshot it at start time.

use crate::cancellation::{CancellationSource, CancellationToken};
use crate::decode::Decoder;
use crate::image::ImageContainer;
use crate::loader::DataResponse;
use crate::metrics::SessionMetrics;
use crate::pipeline::processing::{ProcessingId, ProcessingKey, ProcessingSession};
use crate::queue::OperationId;
use crate::request::{ImageRequest, LoadKey, RequestPriority};
use crate::resumable::ResumableData;
use crate::task::{TaskId, TaskShared};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a load session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Session identity in the dedup table.
///
/// With deduplication disabled every task gets a unique identity, so no
/// coalescing can occur.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum SessionKey {
    Shared(LoadKey),
    Unique(u64),
}

/// Where the session is in its lifecycle. Drives what incoming stage events
/// mean and which teardown work is still required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionPhase {
    AwaitingAdmission,
    ProbingDiskCache,
    Downloading,
    Decoding,
    Delivering,
}

/// One task's registration against a session.
pub(crate) struct Subscriber {
    pub shared: Arc<TaskShared>,
    /// The subscriber's own request; processors differ per task.
    pub request: ImageRequest,
    /// Processing session currently working a *partial* image for this task.
    /// Used for per-task backpressure: further partials are dropped while
    /// one is outstanding.
    pub outstanding_partial: Option<ProcessingId>,
}

/// Shared state for one logical load.
pub(crate) struct LoadSession {
    pub id: SessionId,
    pub key: SessionKey,
    pub phase: SessionPhase,
    /// Request that created the session; used for stages that need one
    /// representative request (decoder creation, disk keys).
    pub request: ImageRequest,
    pub subscribers: HashMap<TaskId, Subscriber>,
    /// Accumulated response bytes. Appended on the pipeline context; decode
    /// operations snapshot it at their start time.
    pub buffer: Arc<Mutex<BytesMut>>,
    /// Latest transport response metadata.
    pub response: Option<DataResponse>,
    /// Created once, on the first non-empty data. `None` either before that
    /// point or while a decode operation temporarily owns it.
    pub decoder: Option<Box<dyn Decoder>>,
    /// True once decoder creation has been attempted, successful or not.
    pub decoder_attempted: bool,
    /// At most one decode operation runs per session.
    pub decode_in_flight: bool,
    /// Set when download completion arrived while a partial decode was still
    /// running; the final decode starts as soon as the decoder returns.
    pub pending_final_decode: bool,
    /// Highest scan number delivered so far, for monotonicity.
    pub last_scan_number: u32,
    /// The final decoded image, once produced.
    pub decoded_final: Option<ImageContainer>,
    /// Shared processing runs keyed by (processor identity, image identity).
    pub processing: HashMap<ProcessingId, ProcessingSession>,
    pub processing_index: HashMap<ProcessingKey, ProcessingId>,
    /// Cancels every nested operation when the last subscriber leaves.
    pub cancel_source: Arc<CancellationSource>,
    pub priority: RequestPriority,
    /// Resumable snapshot taken when the download started.
    pub resumable: Option<ResumableData>,
    pub server_confirmed_resume: bool,
    /// True when the bytes came from the disk cache (skip re-storing them).
    pub from_disk_cache: bool,
    /// Queue handles for cancellation and priority updates.
    pub network_operation: Option<OperationId>,
    pub decode_operation: Option<OperationId>,
    pub metrics: SessionMetrics,
}

impl LoadSession {
    pub fn new(key: SessionKey, request: ImageRequest) -> Self {
        let id = SessionId::new();
        Self {
            id,
            key,
            phase: SessionPhase::AwaitingAdmission,
            request,
            subscribers: HashMap::new(),
            buffer: Arc::new(Mutex::new(BytesMut::new())),
            response: None,
            decoder: None,
            decoder_attempted: false,
            decode_in_flight: false,
            pending_final_decode: false,
            last_scan_number: 0,
            decoded_final: None,
            processing: HashMap::new(),
            processing_index: HashMap::new(),
            cancel_source: Arc::new(CancellationSource::new()),
            priority: request_priority_floor(),
            resumable: None,
            server_confirmed_resume: false,
            from_disk_cache: false,
            network_operation: None,
            decode_operation: None,
            metrics: SessionMetrics::new(id.as_u64()),
        }
    }

    /// Token observed by every nested operation of this session.
    pub fn token(&self) -> CancellationToken {
        self.cancel_source.token()
    }

    pub fn subscribe(&mut self, shared: Arc<TaskShared>, request: ImageRequest) {
        let task_id = shared.id();
        self.subscribers.insert(
            task_id,
            Subscriber {
                shared,
                request,
                outstanding_partial: None,
            },
        );
        self.recompute_priority();
    }

    /// Removes a subscriber. Returns true when it was the last one.
    pub fn unsubscribe(&mut self, task_id: TaskId) -> bool {
        self.subscribers.remove(&task_id);
        self.recompute_priority();
        self.subscribers.is_empty()
    }

    /// Recomputes `priority = max(subscriber priorities)`. Returns true when
    /// the effective priority changed.
    pub fn recompute_priority(&mut self) -> bool {
        let new = self
            .subscribers
            .values()
            .map(|s| s.request.priority())
            .max()
            .unwrap_or_else(request_priority_floor);
        let changed = new != self.priority;
        self.priority = new;
        changed
    }

    /// Current buffer length in bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn subscriber_ids(&self) -> Vec<TaskId> {
        self.subscribers.keys().copied().collect()
    }
}

fn request_priority_floor() -> RequestPriority {
    RequestPriority::VeryLow
}
