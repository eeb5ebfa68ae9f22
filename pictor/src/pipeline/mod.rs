//! The image loading pipeline.
//!
//! [`ImagePipeline`] turns [`ImageRequest`]s into decoded, post-processed
//! in-memory images. Requests for the same resource are coalesced into one
//! load session; sessions flow through rate limiting, a disk-cache probe,
//! a bounded network download, decoding, and per-task processing, and fan
//! their results out to every subscribed task.
//!
//! # Architecture
//!
//! ```text
//! load_image ──► pipeline context (serial event loop, owns all state)
//!                   │        ▲
//!            stage tasks ────┘   (network / decode / process queues)
//!                   │
//!            delivery context (progress, completion, metrics callbacks)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pictor::{ImagePipeline, ImageRequest, PipelineConfig, PipelineContext};
//! use pictor::{HttpDataLoader, StandardDecoderFactory, MemoryImageCache};
//! use std::sync::Arc;
//!
//! let context = PipelineContext::new(
//!     Arc::new(HttpDataLoader::new()?),
//!     Arc::new(StandardDecoderFactory),
//! )
//! .with_memory_cache(Arc::new(MemoryImageCache::with_defaults()));
//!
//! let pipeline = ImagePipeline::new(context, PipelineConfig::default());
//! let task = pipeline.load_image(
//!     ImageRequest::new("https://example.com/hero.png"),
//!     None,
//!     Some(Box::new(|result| println!("done: {}", result.is_ok()))),
//! );
//! ```

pub mod config;
mod delivery;
pub(crate) mod orchestrator;
pub(crate) mod processing;
pub(crate) mod session;

pub use config::PipelineConfig;
pub use delivery::{CompletionHandler, MetricsHandler, ProgressHandler};
pub use processing::ProcessingId;
pub use session::SessionId;

use crate::cache::{DataCache, ImageCache};
use crate::decode::DecoderFactory;
use crate::loader::DataLoader;
use crate::request::ImageRequest;
use crate::task::{ImageTask, TaskShared};
use delivery::{DeliveryMessage, TaskHandlers};
use orchestrator::{Orchestrator, PipelineEvent};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Injected capabilities for a pipeline instance.
#[derive(Clone)]
pub struct PipelineContext {
    /// Transport for fetching raw bytes.
    pub data_loader: Arc<dyn DataLoader>,
    /// Factory for per-session decoders.
    pub decoder_factory: Arc<dyn DecoderFactory>,
    /// Decoded-response cache, consulted before any session is created.
    pub memory_cache: Option<Arc<dyn ImageCache>>,
    /// Raw-bytes cache, probed before the network.
    pub data_cache: Option<Arc<dyn DataCache>>,
    /// Invoked on the delivery context after each task terminates.
    pub on_task_metrics: Option<MetricsHandler>,
}

impl PipelineContext {
    /// Creates a context with the two required capabilities and no caches.
    pub fn new(data_loader: Arc<dyn DataLoader>, decoder_factory: Arc<dyn DecoderFactory>) -> Self {
        Self {
            data_loader,
            decoder_factory,
            memory_cache: None,
            data_cache: None,
            on_task_metrics: None,
        }
    }

    /// Attaches a memory cache.
    pub fn with_memory_cache(mut self, cache: Arc<dyn ImageCache>) -> Self {
        self.memory_cache = Some(cache);
        self
    }

    /// Attaches a disk (raw-bytes) cache.
    pub fn with_data_cache(mut self, cache: Arc<dyn DataCache>) -> Self {
        self.data_cache = Some(cache);
        self
    }

    /// Installs a metrics handler.
    pub fn with_metrics_handler(mut self, handler: MetricsHandler) -> Self {
        self.on_task_metrics = Some(handler);
        self
    }
}

/// A running image loading pipeline.
///
/// Cheap to clone; all clones feed the same pipeline context. The context
/// and delivery tasks exit once every clone (and every in-flight stage) is
/// dropped.
#[derive(Clone)]
pub struct ImagePipeline {
    events_tx: mpsc::UnboundedSender<PipelineEvent>,
    delivery_tx: mpsc::UnboundedSender<DeliveryMessage>,
}

impl ImagePipeline {
    /// Spawns the pipeline and delivery contexts on the current tokio
    /// runtime and returns the handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(context: PipelineContext, config: PipelineConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        tokio::spawn(delivery::run_delivery(
            delivery_rx,
            context.on_task_metrics.clone(),
        ));

        let orchestrator = Orchestrator::new(
            config,
            context.data_loader,
            context.decoder_factory,
            context.memory_cache,
            context.data_cache,
            events_tx.clone(),
            delivery_tx.clone(),
        );
        tokio::spawn(orchestrator.run(events_rx));

        Self {
            events_tx,
            delivery_tx,
        }
    }

    /// Submits a load. Returns the task handle; callbacks run on the
    /// delivery context.
    pub fn load_image(
        &self,
        request: ImageRequest,
        on_progress: Option<ProgressHandler>,
        on_completion: Option<CompletionHandler>,
    ) -> ImageTask {
        let shared = Arc::new(TaskShared::new(request.priority()));
        let _ = self.delivery_tx.send(DeliveryMessage::Register {
            shared: Arc::clone(&shared),
            handlers: TaskHandlers {
                on_progress,
                on_completion,
            },
        });
        let _ = self.events_tx.send(PipelineEvent::Submit {
            shared: Arc::clone(&shared),
            request,
        });
        ImageTask::new(shared, self.events_tx.clone())
    }

    /// Convenience wrapper: loads a URL with default request settings.
    pub fn load_url(&self, url: impl Into<String>, on_completion: CompletionHandler) -> ImageTask {
        self.load_image(ImageRequest::new(url), None, Some(on_completion))
    }
}
