//! pictor — a concurrent, deduplicating image loading pipeline.
//!
//! The pipeline turns image requests into decoded, post-processed in-memory
//! images while keeping five concerns correct at once:
//!
//! 1. **Deduplication** — in-flight requests for the same logical resource
//!    share one load session.
//! 2. **Multi-stage pipelining** — network, decode, and processing run
//!    behind bounded concurrency queues.
//! 3. **Cancellation** — propagates across stages, with interrupted
//!    downloads parked for conditional range resumption.
//! 4. **Backpressure** — progressive decoding coalesces partial images so
//!    fast producers never overrun slower consumers.
//! 5. **Bookkeeping** — per-task priority, progress, and metrics over a
//!    shared session.
//!
//! See the [`pipeline`] module for the public surface and architecture
//! notes.

pub mod cache;
pub mod cancellation;
pub mod decode;
pub mod error;
pub mod image;
pub mod loader;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod queue;
pub mod rate_limiter;
pub mod request;
pub mod resumable;
pub mod task;

pub use crate::cache::{DataCache, DiskCacheConfig, DiskDataCache, ImageCache, MemoryImageCache};
pub use crate::cancellation::{CancellationSource, CancellationToken};
pub use crate::decode::{Decoder, DecoderFactory, StandardDecoderFactory};
pub use crate::error::{DataError, ImageLoadError};
pub use crate::image::{ImageContainer, ImageResponse};
pub use crate::loader::{DataLoader, DataRequest, DataResponse, DataSink, HttpDataLoader};
pub use crate::metrics::{SessionMetrics, TaskMetrics};
pub use crate::pipeline::{
    CompletionHandler, ImagePipeline, MetricsHandler, PipelineConfig, PipelineContext,
    ProgressHandler,
};
pub use crate::process::{ImageProcessor, ResizeProcessor};
pub use crate::request::{ImageRequest, RequestOptions, RequestPriority};
pub use crate::task::{ImageTask, TaskId, TaskProgress};

/// Version of the pictor library.
///
/// Synchronized across the workspace; injected at compile time from
/// `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
