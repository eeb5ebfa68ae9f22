//! Data loading abstraction.
//!
//! A [`DataLoader`] is the injected transport: given a [`DataRequest`] it
//! pushes zero or more chunks and exactly one completion into a
//! [`DataSink`], off the pipeline context. The pipeline re-enters its serial
//! context through the sink's channel, so loaders never touch session state.

mod http;

pub use http::HttpDataLoader;

use crate::cancellation::CancellationToken;
use crate::error::DataError;
use crate::pipeline::orchestrator::PipelineEvent;
use crate::pipeline::session::SessionId;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

/// HTTP status code for a successful range resumption.
pub const STATUS_PARTIAL_CONTENT: u16 = 206;

/// Directive to resume a previously interrupted download.
#[derive(Debug, Clone)]
pub struct ResumeDirective {
    /// Byte offset already held locally; maps to `Range: bytes={offset}-`.
    pub offset: u64,
    /// Resource version the local bytes belong to; maps to `If-Range`.
    pub validator: String,
}

/// A transport-level request.
#[derive(Debug, Clone)]
pub struct DataRequest {
    /// Resource URL.
    pub url: String,
    /// Present when the pipeline holds resumable data for this URL.
    pub resume: Option<ResumeDirective>,
}

impl DataRequest {
    /// Creates a plain request with no resume directive.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            resume: None,
        }
    }
}

/// Transport response metadata, delivered alongside every chunk.
#[derive(Debug, Clone)]
pub struct DataResponse {
    /// Resource URL (after redirects).
    pub url: String,
    /// HTTP status code; 206 signals a negotiated resumption.
    pub status_code: u16,
    /// Total expected resource length in bytes, when the server reports one.
    /// For partial content this is the full length, not the remainder.
    pub expected_length: Option<u64>,
    /// Resource version token (`ETag` or `Last-Modified`), used for
    /// conditional range requests.
    pub validator: Option<String>,
}

impl DataResponse {
    /// True when the server honored a range request.
    pub fn is_partial_content(&self) -> bool {
        self.status_code == STATUS_PARTIAL_CONTENT
    }
}

/// Channel through which a loader reports chunks and completion.
///
/// Completion consumes the sink, so a loader cannot report twice.
pub struct DataSink {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl DataSink {
    pub(crate) fn new(session_id: SessionId, tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self { session_id, tx }
    }

    /// Reports one chunk of response data.
    pub fn chunk(&self, data: Bytes, response: DataResponse) {
        let _ = self.tx.send(PipelineEvent::DataChunk {
            session_id: self.session_id,
            data,
            response,
        });
    }

    /// Reports the end of the load, successful or not.
    pub fn complete(self, result: Result<(), DataError>) {
        let _ = self.tx.send(PipelineEvent::DataFinished {
            session_id: self.session_id,
            result,
        });
    }
}

/// Injected transport capability.
pub trait DataLoader: Send + Sync + 'static {
    /// Loads `request`, pushing chunks and completion into `sink`.
    ///
    /// Runs off the pipeline context. Implementations should observe `token`
    /// and stop promptly when it cancels; an abandoned sink is harmless (the
    /// owning session is already gone).
    fn load_data(
        &self,
        request: DataRequest,
        sink: DataSink,
        token: CancellationToken,
    ) -> BoxFuture<'static, ()>;
}
