//! Post-decode image processors.

use crate::image::ImageContainer;
use crate::request::ImageRequest;
use image::imageops::FilterType;
use image::DynamicImage;

/// A post-decode transformation applied per task.
///
/// Processors are compared by [`ImageProcessor::identifier`]: two processors
/// with equal identifiers are assumed to produce equal output for equal
/// input, which lets the pipeline share one processing run between tasks.
pub trait ImageProcessor: Send + Sync + 'static {
    /// Stable identity string. Must encode every parameter that affects the
    /// output (e.g. `"resize-128x128"`).
    fn identifier(&self) -> &str;

    /// Transforms the decoded image. Returning `None` fails the owning task
    /// with a processing error; other tasks on the same load are unaffected.
    fn process(&self, container: &ImageContainer, request: &ImageRequest)
        -> Option<DynamicImage>;
}

/// Scales images to exact pixel dimensions.
pub struct ResizeProcessor {
    width: u32,
    height: u32,
    identifier: String,
}

impl ResizeProcessor {
    /// Creates a processor that resizes to `width` x `height`.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            identifier: format!("resize-{}x{}", width, height),
        }
    }
}

impl ImageProcessor for ResizeProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(
        &self,
        container: &ImageContainer,
        _request: &ImageRequest,
    ) -> Option<DynamicImage> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        Some(
            container
                .image
                .resize_exact(self.width, self.height, FilterType::Triangle),
        )
    }
}
