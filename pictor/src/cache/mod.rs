//! Cache capabilities consumed by the pipeline.
//!
//! Two layers with different currencies: the memory cache holds decoded,
//! post-processed responses keyed by request; the disk cache holds the raw
//! downloaded bytes keyed by URL string. Both are injected — the pipeline
//! only depends on the traits here, and each has a default implementation.

mod disk;
mod memory;

pub use disk::{DiskCacheConfig, DiskDataCache};
pub use memory::MemoryImageCache;

use crate::image::ImageResponse;
use crate::request::ImageRequest;
use bytes::Bytes;
use futures::future::BoxFuture;

/// Decoded-image cache. Synchronous; consulted on the pipeline context, so
/// implementations must be fast and internally thread-safe.
pub trait ImageCache: Send + Sync + 'static {
    /// Looks up the response for a request.
    fn get(&self, request: &ImageRequest) -> Option<ImageResponse>;

    /// Stores a successful response.
    fn put(&self, request: &ImageRequest, response: ImageResponse);
}

/// Raw-bytes cache with async lookups. Keys are URL strings.
pub trait DataCache: Send + Sync + 'static {
    /// Looks up cached bytes for a key. The returned future runs off the
    /// pipeline context and may be dropped to abort the lookup.
    fn lookup(&self, key: &str) -> BoxFuture<'static, Option<Bytes>>;

    /// Stores bytes for a key. Fire-and-forget; failures are the
    /// implementation's to log.
    fn store(&self, key: &str, data: Bytes);
}
