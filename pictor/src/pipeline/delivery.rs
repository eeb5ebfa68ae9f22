//! The delivery context.
//!
//! Completion, progress, and metrics callbacks all run on one dedicated
//! task, distinct from the pipeline context. A single consumer preserves
//! per-task ordering (progress in chunk order, partials before the final,
//! exactly one terminal) and keeps user callbacks from ever blocking session
//! bookkeeping.

use crate::error::ImageLoadError;
use crate::image::ImageResponse;
use crate::metrics::TaskMetrics;
use crate::task::{TaskId, TaskShared};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Progress callback: invoked with a partial image (when progressive
/// decoding produced one) and the current byte counters.
pub type ProgressHandler = Box<dyn FnMut(Option<&ImageResponse>, u64, u64) + Send>;

/// Completion callback: invoked exactly once with the terminal result,
/// unless the task was cancelled (then never).
pub type CompletionHandler = Box<dyn FnOnce(Result<ImageResponse, ImageLoadError>) + Send>;

/// Metrics hook: invoked after every terminal, including cancellation.
pub type MetricsHandler = Arc<dyn Fn(&TaskMetrics) + Send + Sync>;

/// Callbacks registered for one task.
pub(crate) struct TaskHandlers {
    pub on_progress: Option<ProgressHandler>,
    pub on_completion: Option<CompletionHandler>,
}

pub(crate) enum DeliveryMessage {
    /// Registers a task's handlers; sent before the task is submitted.
    Register {
        shared: Arc<TaskShared>,
        handlers: TaskHandlers,
    },
    /// Byte progress, optionally carrying a progressive partial image.
    Progress {
        task_id: TaskId,
        response: Option<ImageResponse>,
        completed: u64,
        total: u64,
    },
    /// Terminal result. `None` means the task was cancelled: handlers are
    /// dropped without a completion callback and only metrics fire.
    Terminal {
        task_id: TaskId,
        result: Option<Result<ImageResponse, ImageLoadError>>,
        metrics: TaskMetrics,
    },
}

struct DeliveryRecord {
    shared: Arc<TaskShared>,
    handlers: TaskHandlers,
}

/// Runs the delivery loop until the channel closes.
pub(crate) async fn run_delivery(
    mut rx: mpsc::UnboundedReceiver<DeliveryMessage>,
    on_task_metrics: Option<MetricsHandler>,
) {
    let mut records: HashMap<TaskId, DeliveryRecord> = HashMap::new();

    while let Some(message) = rx.recv().await {
        match message {
            DeliveryMessage::Register { shared, handlers } => {
                trace!(task = %shared.id(), "Registered delivery handlers");
                records.insert(shared.id(), DeliveryRecord { shared, handlers });
            }
            DeliveryMessage::Progress {
                task_id,
                response,
                completed,
                total,
            } => {
                let Some(record) = records.get_mut(&task_id) else {
                    continue;
                };
                if record.shared.is_cancelled() {
                    continue;
                }
                if let Some(on_progress) = record.handlers.on_progress.as_mut() {
                    on_progress(response.as_ref(), completed, total);
                }
            }
            DeliveryMessage::Terminal {
                task_id,
                result,
                metrics,
            } => {
                let record = records.remove(&task_id);
                match result {
                    // Cancelled tasks get no completion callback. A task can
                    // also race its own cancel against a natural terminal;
                    // the cancelled flag wins.
                    None => debug!(task = %task_id, "Task cancelled before delivery"),
                    Some(result) => {
                        if let Some(mut record) = record.filter(|r| !r.shared.is_cancelled()) {
                            if let Some(on_completion) = record.handlers.on_completion.take() {
                                on_completion(result);
                            }
                        }
                    }
                }
                if let Some(handler) = on_task_metrics.as_ref() {
                    handler(&metrics);
                }
            }
        }
    }
}
