//! Decoder abstraction and the `image`-crate-backed default.
//!
//! A [`DecoderFactory`] sniffs the first non-empty bytes of a load and
//! produces a [`Decoder`] that the session reuses for the rest of the load.
//! Progressive decoders may yield partial images with monotonic scan
//! numbers; the default factory decodes only on final data, which is the
//! honest capability of the `image` crate's one-shot decoders.

use crate::image::ImageContainer;
use crate::loader::DataResponse;
use crate::request::ImageRequest;
use image::ImageFormat;
use std::sync::Arc;
use tracing::debug;

/// Stateful decoder for one load session.
///
/// Created once per session on the first non-empty data and reused for all
/// subsequent partial and final decodes.
pub trait Decoder: Send + 'static {
    /// Decodes `data`. `is_final` is true when `data` is the complete
    /// resource; partial calls may return `None` when no new image can be
    /// produced yet.
    fn decode(&mut self, data: &[u8], is_final: bool) -> Option<ImageContainer>;
}

/// Constructs decoders from a request plus a sample of the incoming data.
pub trait DecoderFactory: Send + Sync + 'static {
    /// Returns a decoder for the load, or `None` when the data is not a
    /// recognizable image (the load then fails with a decoding error once
    /// final data arrives).
    fn make_decoder(
        &self,
        request: &ImageRequest,
        response: Option<&DataResponse>,
        sample: &[u8],
    ) -> Option<Box<dyn Decoder>>;
}

/// Default factory backed by the `image` crate.
///
/// Sniffs the format from the sample bytes; decodes once, on final data.
pub struct StandardDecoderFactory;

impl DecoderFactory for StandardDecoderFactory {
    fn make_decoder(
        &self,
        request: &ImageRequest,
        _response: Option<&DataResponse>,
        sample: &[u8],
    ) -> Option<Box<dyn Decoder>> {
        match image::guess_format(sample) {
            Ok(format) => Some(Box::new(StandardDecoder { format })),
            Err(_) => {
                debug!(url = request.url(), "Unrecognized image format");
                None
            }
        }
    }
}

struct StandardDecoder {
    format: ImageFormat,
}

impl Decoder for StandardDecoder {
    fn decode(&mut self, data: &[u8], is_final: bool) -> Option<ImageContainer> {
        if !is_final {
            // One-shot decoding only; partial scans are a progressive
            // decoder's job.
            return None;
        }
        match image::load_from_memory_with_format(data, self.format) {
            Ok(decoded) => Some(ImageContainer {
                image: Arc::new(decoded),
                is_final: true,
                scan_number: None,
                is_animated: self.format == ImageFormat::Gif,
            }),
            Err(e) => {
                debug!(format = ?self.format, error = %e, "Image decode failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::new_rgba8(4, 4)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("encoding a tiny PNG should succeed");
        bytes
    }

    #[test]
    fn test_factory_recognizes_png() {
        let factory = StandardDecoderFactory;
        let request = ImageRequest::new("https://example.com/a.png");
        let bytes = png_bytes();

        assert!(factory.make_decoder(&request, None, &bytes).is_some());
    }

    #[test]
    fn test_factory_rejects_garbage() {
        let factory = StandardDecoderFactory;
        let request = ImageRequest::new("https://example.com/a.bin");

        assert!(factory
            .make_decoder(&request, None, &[0x00, 0x01, 0x02, 0x03])
            .is_none());
    }

    #[test]
    fn test_decoder_round_trip() {
        let factory = StandardDecoderFactory;
        let request = ImageRequest::new("https://example.com/a.png");
        let bytes = png_bytes();

        let mut decoder = factory
            .make_decoder(&request, None, &bytes)
            .expect("PNG should be recognized");
        let container = decoder.decode(&bytes, true).expect("decode should succeed");

        assert!(container.is_final);
        assert!(!container.is_animated);
        assert_eq!((container.image.width(), container.image.height()), (4, 4));
    }

    #[test]
    fn test_decoder_skips_partial_data() {
        let factory = StandardDecoderFactory;
        let request = ImageRequest::new("https://example.com/a.png");
        let bytes = png_bytes();

        let mut decoder = factory
            .make_decoder(&request, None, &bytes)
            .expect("PNG should be recognized");
        assert!(decoder.decode(&bytes[..8], false).is_none());
    }

    #[test]
    fn test_decoder_fails_on_truncated_final_data() {
        let factory = StandardDecoderFactory;
        let request = ImageRequest::new("https://example.com/a.png");
        let bytes = png_bytes();

        let mut decoder = factory
            .make_decoder(&request, None, &bytes)
            .expect("PNG should be recognized");
        assert!(decoder.decode(&bytes[..8], true).is_none());
    }
}
