//! Decoded image containers.

use image::DynamicImage;
use std::sync::Arc;

/// A decoded image plus decode-stage metadata.
///
/// Partial (progressive) images carry a monotonic `scan_number`; the final
/// image of a load has `is_final` set and always follows any partials.
#[derive(Clone)]
pub struct ImageContainer {
    /// The decoded pixels. Shared so fan-out to many subscribers is cheap.
    pub image: Arc<DynamicImage>,
    /// True for the final image of a load, false for progressive previews.
    pub is_final: bool,
    /// Monotonic ordering token for progressive partials.
    pub scan_number: Option<u32>,
    /// True when the payload is an animated format (e.g. GIF). Animated
    /// payloads can bypass processing so the raw data is preserved.
    pub is_animated: bool,
}

impl ImageContainer {
    /// Creates a final, non-animated container.
    pub fn final_image(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
            is_final: true,
            scan_number: None,
            is_animated: false,
        }
    }

    /// Creates a progressive partial container.
    pub fn partial(image: DynamicImage, scan_number: Option<u32>) -> Self {
        Self {
            image: Arc::new(image),
            is_final: false,
            scan_number,
            is_animated: false,
        }
    }

    /// Stable identity of the decoded pixels, used to share processing runs
    /// operating on the same source image.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.image) as *const () as usize
    }
}

impl std::fmt::Debug for ImageContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageContainer")
            .field("dimensions", &(self.image.width(), self.image.height()))
            .field("is_final", &self.is_final)
            .field("scan_number", &self.scan_number)
            .field("is_animated", &self.is_animated)
            .finish()
    }
}

/// The terminal payload delivered to completion handlers and stored in the
/// memory cache.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    /// The decoded (and, if requested, processed) image.
    pub container: ImageContainer,
    /// URL the image was loaded from.
    pub url: String,
}

impl ImageResponse {
    /// Convenience accessor for the decoded pixels.
    pub fn image(&self) -> &Arc<DynamicImage> {
        &self.container.image
    }
}
