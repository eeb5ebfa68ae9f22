//! Image request model.
//!
//! An [`ImageRequest`] describes what to load (URL), how urgently
//! ([`RequestPriority`]), how the memory cache participates
//! ([`RequestOptions`]), and an optional post-decode processor. Requests
//! that would fetch identical bytes share a [`LoadKey`], which is what the
//! pipeline deduplicates on; the processor is deliberately excluded from the
//! load key because it only affects post-processing, not the bytes fetched.

use crate::process::ImageProcessor;
use std::sync::Arc;

/// Priority level for scheduling a task's work.
///
/// Orders queue admission and rate-limiter draining; a load session runs at
/// the maximum priority of its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RequestPriority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl RequestPriority {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            RequestPriority::VeryLow => 0,
            RequestPriority::Low => 1,
            RequestPriority::Normal => 2,
            RequestPriority::High => 3,
            RequestPriority::VeryHigh => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestPriority::VeryLow,
            1 => RequestPriority::Low,
            3 => RequestPriority::High,
            4 => RequestPriority::VeryHigh,
            _ => RequestPriority::Normal,
        }
    }
}

/// Memory-cache participation flags for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Whether the pipeline may serve this request from the memory cache.
    pub is_memory_cache_read_allowed: bool,
    /// Whether a successful response may be written to the memory cache.
    pub is_memory_cache_write_allowed: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            is_memory_cache_read_allowed: true,
            is_memory_cache_write_allowed: true,
        }
    }
}

/// A request for a decoded, optionally post-processed image.
#[derive(Clone)]
pub struct ImageRequest {
    url: String,
    priority: RequestPriority,
    options: RequestOptions,
    processor: Option<Arc<dyn ImageProcessor>>,
}

impl ImageRequest {
    /// Creates a request for the given URL with default priority and options.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            priority: RequestPriority::default(),
            options: RequestOptions::default(),
            processor: None,
        }
    }

    /// Sets the scheduling priority.
    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the memory-cache participation flags.
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Attaches a post-decode processor.
    pub fn with_processor(mut self, processor: Arc<dyn ImageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Returns the request URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the current priority.
    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    pub(crate) fn set_priority(&mut self, priority: RequestPriority) {
        self.priority = priority;
    }

    /// Returns the memory-cache flags.
    pub fn options(&self) -> RequestOptions {
        self.options
    }

    /// Returns the attached processor, if any.
    pub fn processor(&self) -> Option<&Arc<dyn ImageProcessor>> {
        self.processor.as_ref()
    }

    /// Returns the processor's identity string, if a processor is attached.
    pub fn processor_identifier(&self) -> Option<&str> {
        self.processor.as_deref().map(|p| p.identifier())
    }

    /// Derives the deduplication key: requests with equal load keys would
    /// fetch identical bytes.
    pub fn load_key(&self) -> LoadKey {
        LoadKey {
            url: self.url.clone(),
            policy: self.policy_bits(),
        }
    }

    /// Derives the memory-cache key: URL plus processor identity, since the
    /// cached value is the post-processed image.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            url: self.url.clone(),
            processor: self
                .processor_identifier()
                .map(str::to_owned)
                .unwrap_or_default(),
        }
    }

    /// Whether the resource is eligible for disk caching and resumption.
    pub fn is_cacheable(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }

    fn policy_bits(&self) -> u8 {
        let mut bits = 0u8;
        if self.options.is_memory_cache_read_allowed {
            bits |= 0b01;
        }
        if self.options.is_memory_cache_write_allowed {
            bits |= 0b10;
        }
        bits
    }
}

impl std::fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRequest")
            .field("url", &self.url)
            .field("priority", &self.priority)
            .field("options", &self.options)
            .field("processor", &self.processor_identifier())
            .finish()
    }
}

/// Fingerprint over the request fields that affect the bytes fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadKey {
    url: String,
    policy: u8,
}

/// Memory-cache key: URL plus processor identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    url: String,
    processor: String,
}
