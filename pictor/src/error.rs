//! Error types for the image loading pipeline.
//!
//! Errors are categorized by the stage that produced them. Download and
//! decode failures are session-wide (every subscriber of the load receives
//! the same error); processing failures affect only the owning task.
//! Cancellation is not an error and never reaches a completion handler.

use thiserror::Error;

/// Transport-level failure reported by a data loader.
///
/// Wraps whatever the underlying transport produced (connection refused,
/// timeout, HTTP error status) as a message plus an optional status code.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DataError {
    message: String,
    status_code: Option<u16>,
}

impl DataError {
    /// Creates a new transport error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
        }
    }

    /// Creates a transport error carrying an HTTP status code.
    pub fn with_status(message: impl Into<String>, status_code: u16) -> Self {
        Self {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Returns the HTTP status code, if the transport got far enough to see one.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }
}

/// Terminal failure delivered to a task's completion handler.
#[derive(Debug, Clone, Error)]
pub enum ImageLoadError {
    /// The network transport failed. Session-wide.
    #[error("data loading failed: {0}")]
    DataLoadingFailed(#[from] DataError),

    /// The decoder produced no image for final-stage bytes, or no decoder
    /// could be constructed from the data. Session-wide.
    #[error("image decoding failed")]
    DecodingFailed,

    /// The processor returned no image. Per-task.
    #[error("image processing failed")]
    ProcessingFailed,
}
