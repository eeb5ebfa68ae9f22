//! Pipeline configuration.

/// Feature toggles and queue caps for a pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Coalesce tasks whose requests share a load key into one session.
    pub is_deduplication_enabled: bool,
    /// Gate new sessions through the token-bucket rate limiter.
    pub is_rate_limiter_enabled: bool,
    /// Schedule partial decodes while data is still arriving.
    pub is_progressive_decoding_enabled: bool,
    /// Park interrupted downloads for conditional range resumption.
    pub is_resumable_data_enabled: bool,
    /// Pass animated payloads through unprocessed.
    pub is_animated_image_data_enabled: bool,
    /// Maximum concurrent network loads.
    pub data_loading_queue_capacity: usize,
    /// Maximum concurrent decodes.
    pub decoding_queue_capacity: usize,
    /// Maximum concurrent processing runs.
    pub processing_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            is_deduplication_enabled: true,
            is_rate_limiter_enabled: true,
            is_progressive_decoding_enabled: false,
            is_resumable_data_enabled: true,
            is_animated_image_data_enabled: false,
            data_loading_queue_capacity: 6,
            decoding_queue_capacity: 1,
            processing_queue_capacity: 2,
        }
    }
}
