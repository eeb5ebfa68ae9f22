//! Streaming HTTP data loader backed by `reqwest`.

use super::{DataLoader, DataRequest, DataResponse, DataSink};
use crate::cancellation::CancellationToken;
use crate::error::DataError;
use futures::future::BoxFuture;
use reqwest::header;
use tracing::{debug, trace, warn};

/// Default User-Agent for outgoing requests; some image hosts reject
/// requests without one.
const DEFAULT_USER_AGENT: &str = concat!("pictor/", env!("CARGO_PKG_VERSION"));

/// HTTP transport with connection pooling and streamed response bodies.
///
/// Applies `Range`/`If-Range` headers when the request carries a resume
/// directive and surfaces the server's validator (`ETag` falling back to
/// `Last-Modified`) so interrupted downloads can be resumed later.
#[derive(Clone)]
pub struct HttpDataLoader {
    client: reqwest::Client,
}

impl HttpDataLoader {
    /// Creates a loader with pooling tuned for many small image fetches.
    pub fn new() -> Result<Self, DataError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(DEFAULT_USER_AGENT)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| DataError::new(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Creates a loader around an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl DataLoader for HttpDataLoader {
    fn load_data(
        &self,
        request: DataRequest,
        sink: DataSink,
        token: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut builder = client.get(&request.url);
            if let Some(resume) = &request.resume {
                trace!(
                    url = request.url,
                    offset = resume.offset,
                    "Issuing conditional range request"
                );
                builder = builder
                    .header(header::RANGE, format!("bytes={}-", resume.offset))
                    .header(header::IF_RANGE, resume.validator.clone());
            }

            let send = builder.send();
            let mut response = tokio::select! {
                result = send => match result {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(url = request.url, error = %e, "HTTP request failed");
                        sink.complete(Err(DataError::new(format!("request failed: {}", e))));
                        return;
                    }
                },
                _ = token.cancelled() => {
                    debug!(url = request.url, "HTTP request cancelled before response");
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                warn!(url = request.url, status = status.as_u16(), "HTTP error status");
                sink.complete(Err(DataError::with_status(
                    format!("HTTP {} from {}", status, request.url),
                    status.as_u16(),
                )));
                return;
            }

            let metadata = response_metadata(&request.url, &response);
            debug!(
                url = request.url,
                status = metadata.status_code,
                expected_length = metadata.expected_length,
                resumed = metadata.is_partial_content(),
                "HTTP response received"
            );

            loop {
                let chunk = tokio::select! {
                    chunk = response.chunk() => chunk,
                    _ = token.cancelled() => {
                        debug!(url = request.url, "HTTP body read cancelled");
                        return;
                    }
                };
                match chunk {
                    Ok(Some(data)) => sink.chunk(data, metadata.clone()),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(url = request.url, error = %e, "HTTP body read failed");
                        sink.complete(Err(DataError::new(format!(
                            "failed to read response: {}",
                            e
                        ))));
                        return;
                    }
                }
            }

            sink.complete(Ok(()));
        })
    }
}

fn response_metadata(url: &str, response: &reqwest::Response) -> DataResponse {
    let header_str = |name: header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };

    // Partial responses report the remaining length in Content-Length; the
    // full length lives after the slash in Content-Range.
    let status_code = response.status().as_u16();
    let expected_length = if status_code == super::STATUS_PARTIAL_CONTENT {
        header_str(header::CONTENT_RANGE).and_then(|v| parse_content_range_total(&v))
    } else {
        response.content_length()
    };

    DataResponse {
        url: url.to_owned(),
        status_code,
        expected_length,
        validator: header_str(header::ETAG).or_else(|| header_str(header::LAST_MODIFIED)),
    }
}

/// Parses the total length out of `Content-Range: bytes 500-1499/1500`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}
