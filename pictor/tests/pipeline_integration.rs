//! End-to-end pipeline scenarios against mock transports and decoders.
//!
//! The mock loader serves a deterministic byte pattern in timed chunks and
//! understands conditional range requests, which lets these tests drive
//! deduplication, cancellation, resumption, progressive decoding, and
//! processing fan-out without touching the network.

use bytes::Bytes;
use futures::future::BoxFuture;
use image::DynamicImage;
use parking_lot::Mutex;
use pictor::{
    CancellationToken, CompletionHandler, DataCache, DataError, DataLoader, DataRequest,
    DataResponse, DataSink, Decoder, DecoderFactory, ImageContainer, ImageLoadError, ImagePipeline,
    ImageProcessor, ImageRequest, ImageResponse, PipelineConfig, PipelineContext, ProgressHandler,
    TaskMetrics,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Fresh URL per test: the resumable store is process-wide, so tests must
/// not share resources.
fn unique_url() -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "https://images.example.com/img-{}.png",
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// Byte at position `i` of every mock resource, so resumed downloads can be
/// checked for correct reassembly.
fn pattern_byte(i: usize) -> u8 {
    (i % 251) as u8
}

fn pattern(range: std::ops::Range<usize>) -> Vec<u8> {
    range.map(pattern_byte).collect()
}

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

struct MockLoader {
    total: usize,
    chunk_size: usize,
    chunk_delay: Duration,
    validator: Option<String>,
    supports_resume: bool,
    /// Complete with an error once this many bytes have been served.
    fail_after_bytes: Option<usize>,
    calls: AtomicUsize,
    requests: Mutex<Vec<DataRequest>>,
}

impl MockLoader {
    fn new(total: usize, chunk_size: usize) -> Self {
        Self {
            total,
            chunk_size,
            chunk_delay: Duration::from_millis(40),
            validator: Some("\"v1\"".to_owned()),
            supports_resume: true,
            fail_after_bytes: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn recorded_requests(&self) -> Vec<DataRequest> {
        self.requests.lock().clone()
    }
}

impl DataLoader for MockLoader {
    fn load_data(
        &self,
        request: DataRequest,
        sink: DataSink,
        token: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let total = self.total;
        let chunk_size = self.chunk_size;
        let delay = self.chunk_delay;
        let validator = self.validator.clone();
        let supports_resume = self.supports_resume;
        let fail_after = self.fail_after_bytes;

        Box::pin(async move {
            let (status, mut pos) = match &request.resume {
                Some(resume) if supports_resume => (206, resume.offset as usize),
                _ => (200, 0),
            };
            let response = DataResponse {
                url: request.url.clone(),
                status_code: status,
                expected_length: Some(total as u64),
                validator,
            };

            while pos < total {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return,
                }
                let n = chunk_size.min(total - pos);
                let data = pattern(pos..pos + n);
                pos += n;
                sink.chunk(Bytes::from(data), response.clone());
                if fail_after.is_some_and(|limit| pos >= limit) {
                    sink.complete(Err(DataError::new("injected transport failure")));
                    return;
                }
            }
            sink.complete(Ok(()));
        })
    }
}

struct MockDecoderFactory {
    scan_thresholds: Vec<usize>,
    reject: bool,
    final_decodes: Arc<AtomicUsize>,
    last_final_data: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MockDecoderFactory {
    fn new() -> Self {
        Self {
            scan_thresholds: Vec::new(),
            reject: false,
            final_decodes: Arc::new(AtomicUsize::new(0)),
            last_final_data: Arc::new(Mutex::new(None)),
        }
    }

    fn with_scans(mut self, thresholds: Vec<usize>) -> Self {
        self.scan_thresholds = thresholds;
        self
    }

    fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::new()
        }
    }

    fn final_decode_count(&self) -> usize {
        self.final_decodes.load(Ordering::SeqCst)
    }

    fn last_final_data(&self) -> Option<Vec<u8>> {
        self.last_final_data.lock().clone()
    }
}

impl DecoderFactory for MockDecoderFactory {
    fn make_decoder(
        &self,
        _request: &ImageRequest,
        _response: Option<&DataResponse>,
        _sample: &[u8],
    ) -> Option<Box<dyn Decoder>> {
        if self.reject {
            return None;
        }
        Some(Box::new(MockDecoder {
            scan_thresholds: self.scan_thresholds.clone(),
            produced_scans: 0,
            final_decodes: Arc::clone(&self.final_decodes),
            last_final_data: Arc::clone(&self.last_final_data),
        }))
    }
}

struct MockDecoder {
    scan_thresholds: Vec<usize>,
    produced_scans: u32,
    final_decodes: Arc<AtomicUsize>,
    last_final_data: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Decoder for MockDecoder {
    fn decode(&mut self, data: &[u8], is_final: bool) -> Option<ImageContainer> {
        if is_final {
            self.final_decodes.fetch_add(1, Ordering::SeqCst);
            *self.last_final_data.lock() = Some(data.to_vec());
            return Some(ImageContainer::final_image(DynamicImage::new_rgba8(2, 2)));
        }
        let reached = self
            .scan_thresholds
            .iter()
            .filter(|threshold| data.len() >= **threshold)
            .count() as u32;
        if reached > self.produced_scans {
            self.produced_scans = reached;
            Some(ImageContainer::partial(
                DynamicImage::new_rgba8(1, 1),
                Some(reached),
            ))
        } else {
            None
        }
    }
}

struct CountingProcessor {
    identifier: String,
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl CountingProcessor {
    fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_owned(),
            calls: Arc::new(AtomicUsize::new(0)),
            fail: false,
        }
    }

    fn failing(identifier: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(identifier)
        }
    }
}

impl ImageProcessor for CountingProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(
        &self,
        container: &ImageContainer,
        _request: &ImageRequest,
    ) -> Option<DynamicImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            None
        } else {
            Some((*container.image).clone())
        }
    }
}

struct MockDataCache {
    entries: Mutex<HashMap<String, Bytes>>,
}

impl MockDataCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

impl DataCache for MockDataCache {
    fn lookup(&self, key: &str) -> BoxFuture<'static, Option<Bytes>> {
        let cached = self.entries.lock().get(key).cloned();
        Box::pin(async move { cached })
    }

    fn store(&self, key: &str, data: Bytes) {
        self.entries.lock().insert(key.to_owned(), data);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type CompletionResult = Result<ImageResponse, ImageLoadError>;

fn completion_channel() -> (CompletionHandler, oneshot::Receiver<CompletionResult>) {
    let (tx, rx) = oneshot::channel();
    let handler: CompletionHandler = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (handler, rx)
}

fn progress_channel() -> (ProgressHandler, mpsc::UnboundedReceiver<(Option<u32>, u64)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: ProgressHandler = Box::new(move |response, completed, _total| {
        let scan = response.and_then(|r| r.container.scan_number);
        let _ = tx.send((scan, completed));
    });
    (handler, rx)
}

async fn expect_completion(rx: oneshot::Receiver<CompletionResult>) -> CompletionResult {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("completion should arrive in time")
        .expect("completion channel should not drop")
}

fn metrics_collector() -> (Arc<Mutex<Vec<TaskMetrics>>>, PipelineContext, Arc<MockLoader>) {
    let loader = Arc::new(MockLoader::new(1500, 500));
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let context = PipelineContext::new(Arc::clone(&loader) as Arc<dyn DataLoader>, Arc::new(MockDecoderFactory::new()))
        .with_metrics_handler(Arc::new(move |metrics: &TaskMetrics| {
            sink.lock().push(metrics.clone());
        }));
    (collected, context, loader)
}

fn build_pipeline(
    loader: &Arc<MockLoader>,
    factory: Arc<MockDecoderFactory>,
    config: PipelineConfig,
) -> ImagePipeline {
    let context = PipelineContext::new(Arc::clone(loader) as Arc<dyn DataLoader>, factory);
    ImagePipeline::new(context, config)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dedup_coalescing_five_tasks_one_fetch() {
    pictor::logging::init_logging();
    let url = unique_url();
    let loader = Arc::new(MockLoader::new(1500, 500));
    let factory = Arc::new(MockDecoderFactory::new());
    let decode_counter = Arc::clone(&factory);
    let pipeline = build_pipeline(&loader, factory, PipelineConfig::default());

    let mut completions = Vec::new();
    for _ in 0..5 {
        let (handler, rx) = completion_channel();
        let _task = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler));
        completions.push(rx);
    }

    let mut images = Vec::new();
    for rx in completions {
        let result = expect_completion(rx).await;
        images.push(Arc::clone(result.expect("load should succeed").image()));
    }

    assert_eq!(loader.call_count(), 1, "coalesced loads share one fetch");
    assert_eq!(decode_counter.final_decode_count(), 1);
    for image in &images[1..] {
        assert!(
            Arc::ptr_eq(&images[0], image),
            "all subscribers receive the same decoded image"
        );
    }
}

#[tokio::test]
async fn test_partial_cancel_keeps_other_subscriber() {
    let url = unique_url();
    let loader = Arc::new(MockLoader::new(1500, 500));
    let factory = Arc::new(MockDecoderFactory::new());
    let pipeline = build_pipeline(&loader, factory, PipelineConfig::default());

    let cancelled_completed = Arc::new(AtomicUsize::new(0));
    let cancelled_flag = Arc::clone(&cancelled_completed);
    let handler: CompletionHandler = Box::new(move |_| {
        cancelled_flag.fetch_add(1, Ordering::SeqCst);
    });
    let task1 = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler));

    let (handler2, rx2) = completion_channel();
    let _task2 = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler2));

    // Cancel before the download can possibly finish (3 chunks x 40ms).
    tokio::time::sleep(Duration::from_millis(20)).await;
    task1.cancel();

    let result = expect_completion(rx2).await;
    assert!(result.is_ok(), "surviving subscriber still gets the image");
    assert_eq!(loader.call_count(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        cancelled_completed.load(Ordering::SeqCst),
        0,
        "cancelled task receives no completion callback"
    );
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let url = unique_url();
    let loader = Arc::new(MockLoader::new(1500, 500));
    let factory = Arc::new(MockDecoderFactory::new());
    let pipeline = build_pipeline(&loader, factory, PipelineConfig::default());

    let completions = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&completions);
    let handler: CompletionHandler = Box::new(move |_| {
        flag.fetch_add(1, Ordering::SeqCst);
    });
    let task = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler));

    tokio::time::sleep(Duration::from_millis(20)).await;
    for _ in 0..4 {
        task.cancel();
    }
    assert!(task.is_cancelled());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(completions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_resumable_download_after_cancel() {
    let url = unique_url();
    let (metrics, context, loader) = metrics_collector();
    let pipeline = ImagePipeline::new(context, PipelineConfig::default());

    // First attempt: cancel once the first 500-byte chunk has arrived.
    let (progress, mut progress_rx) = progress_channel();
    let task = pipeline.load_image(ImageRequest::new(url.as_str()), Some(progress), None);

    let (_scan, completed) = tokio::time::timeout(Duration::from_secs(5), progress_rx.recv())
        .await
        .expect("progress should arrive")
        .expect("progress channel open");
    assert_eq!(completed, 500);
    task.cancel();

    // Give the teardown (and resumable save) time to run.
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Second attempt: the pipeline should issue a conditional range request
    // and reassemble the full resource from both attempts.
    let (handler, rx) = completion_channel();
    let _task2 = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler));
    let result = expect_completion(rx).await;
    assert!(result.is_ok());

    let requests = loader.recorded_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].resume.is_none());
    let resume = requests[1]
        .resume
        .as_ref()
        .expect("second request should carry a resume directive");
    assert_eq!(resume.offset, 500);
    assert_eq!(resume.validator, "\"v1\"");

    // The second task's metrics confirm the negotiated resumption.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let metrics = metrics.lock();
    let resumed = metrics
        .iter()
        .filter_map(|m| m.session.as_ref())
        .find(|s| s.was_resumed)
        .expect("one session should have resumed");
    assert_eq!(resumed.resumed_data_count, 500);
    assert!(resumed.server_confirmed_resume);
    // Bytes fetched over the two attempts add up to the full resource.
    assert_eq!(resumed.downloaded_data_count, 1000);
}

#[tokio::test]
async fn test_resumed_bytes_reassemble_exactly() {
    let url = unique_url();
    let loader = Arc::new(MockLoader::new(1500, 500));
    let factory = Arc::new(MockDecoderFactory::new());
    let factory_probe = Arc::clone(&factory);
    let pipeline = build_pipeline(&loader, factory, PipelineConfig::default());

    let (progress, mut progress_rx) = progress_channel();
    let task = pipeline.load_image(ImageRequest::new(url.as_str()), Some(progress), None);
    let _ = tokio::time::timeout(Duration::from_secs(5), progress_rx.recv())
        .await
        .expect("progress should arrive");
    task.cancel();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (handler, rx) = completion_channel();
    let _task2 = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler));
    expect_completion(rx).await.expect("resumed load succeeds");

    let final_data = factory_probe
        .last_final_data()
        .expect("final decode should have run");
    assert_eq!(final_data.len(), 1500);
    assert_eq!(final_data, pattern(0..1500), "prefix + remainder reassemble");
}

#[tokio::test]
async fn test_memory_cache_hit_skips_loader() {
    let url = unique_url();
    let loader = Arc::new(MockLoader::new(1500, 500));
    let factory = Arc::new(MockDecoderFactory::new());
    let metrics = Arc::new(Mutex::new(Vec::<TaskMetrics>::new()));
    let metrics_sink = Arc::clone(&metrics);

    let context = PipelineContext::new(
        Arc::clone(&loader) as Arc<dyn DataLoader>,
        factory,
    )
    .with_memory_cache(Arc::new(pictor::MemoryImageCache::with_defaults()))
    .with_metrics_handler(Arc::new(move |m: &TaskMetrics| {
        metrics_sink.lock().push(m.clone());
    }));
    let pipeline = ImagePipeline::new(context, PipelineConfig::default());

    let (handler, rx) = completion_channel();
    let _task = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler));
    expect_completion(rx).await.expect("first load succeeds");

    let (handler2, rx2) = completion_channel();
    let _task2 = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler2));
    expect_completion(rx2).await.expect("cached load succeeds");

    assert_eq!(loader.call_count(), 1, "second load never touches the loader");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let metrics = metrics.lock();
    assert!(
        metrics.iter().any(|m| m.is_memory_cache_hit),
        "second task should be a memory cache hit"
    );
}

#[tokio::test]
async fn test_progressive_partials_are_monotonic_then_final() {
    let url = unique_url();
    let loader = Arc::new(MockLoader::new(10_000, 2000));
    let factory = Arc::new(MockDecoderFactory::new().with_scans(vec![2000, 5000, 8000]));
    let config = PipelineConfig {
        is_progressive_decoding_enabled: true,
        ..PipelineConfig::default()
    };
    let pipeline = build_pipeline(&loader, factory, config);

    let (progress, mut progress_rx) = progress_channel();
    let (handler, rx) = completion_channel();
    let _task = pipeline.load_image(ImageRequest::new(url.as_str()), Some(progress), Some(handler));

    let result = expect_completion(rx).await.expect("load succeeds");
    assert!(result.container.is_final);

    let mut scans = Vec::new();
    while let Ok(event) = progress_rx.try_recv() {
        if let (Some(scan), _) = event {
            scans.push(scan);
        }
    }
    assert!(
        !scans.is_empty() && scans.len() <= 3,
        "between one and three partials, got {:?}",
        scans
    );
    assert!(
        scans.windows(2).all(|pair| pair[0] <= pair[1]),
        "scan numbers must be monotonic: {:?}",
        scans
    );
}

#[tokio::test]
async fn test_processing_dedup_shares_one_run() {
    let url = unique_url();
    let loader = Arc::new(MockLoader::new(1500, 500));
    let factory = Arc::new(MockDecoderFactory::new());
    let pipeline = build_pipeline(&loader, factory, PipelineConfig::default());

    let processor = Arc::new(CountingProcessor::new("tint-blue"));
    let calls = Arc::clone(&processor.calls);

    let mut completions = Vec::new();
    for _ in 0..2 {
        let (handler, rx) = completion_channel();
        let request =
            ImageRequest::new(url.as_str()).with_processor(Arc::clone(&processor) as Arc<dyn ImageProcessor>);
        let _task = pipeline.load_image(request, None, Some(handler));
        completions.push(rx);
    }

    let mut images = Vec::new();
    for rx in completions {
        let result = expect_completion(rx).await.expect("processed load succeeds");
        images.push(Arc::clone(result.image()));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1, "one shared processing run");
    assert!(Arc::ptr_eq(&images[0], &images[1]));
}

#[tokio::test]
async fn test_processing_failure_is_per_task() {
    let url = unique_url();
    let loader = Arc::new(MockLoader::new(1500, 500));
    let factory = Arc::new(MockDecoderFactory::new());
    let pipeline = build_pipeline(&loader, factory, PipelineConfig::default());

    let failing = Arc::new(CountingProcessor::failing("broken"));
    let (handler_failing, rx_failing) = completion_channel();
    let _task1 = pipeline.load_image(
        ImageRequest::new(url.as_str()).with_processor(failing as Arc<dyn ImageProcessor>),
        None,
        Some(handler_failing),
    );

    let (handler_plain, rx_plain) = completion_channel();
    let _task2 = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler_plain));

    let failed = expect_completion(rx_failing).await;
    assert!(matches!(failed, Err(ImageLoadError::ProcessingFailed)));

    let plain = expect_completion(rx_plain).await;
    assert!(plain.is_ok(), "other subscriber keeps its result");
    assert_eq!(loader.call_count(), 1);
}

#[tokio::test]
async fn test_data_loading_failure_is_session_wide() {
    let url = unique_url();
    let mut loader = MockLoader::new(1500, 500);
    loader.fail_after_bytes = Some(1000);
    let loader = Arc::new(loader);
    let factory = Arc::new(MockDecoderFactory::new());
    let pipeline = build_pipeline(&loader, factory, PipelineConfig::default());

    let mut completions = Vec::new();
    for _ in 0..2 {
        let (handler, rx) = completion_channel();
        let _task = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler));
        completions.push(rx);
    }

    for rx in completions {
        let result = expect_completion(rx).await;
        assert!(matches!(result, Err(ImageLoadError::DataLoadingFailed(_))));
    }
    assert_eq!(loader.call_count(), 1);
}

#[tokio::test]
async fn test_unrecognized_data_fails_decoding() {
    let url = unique_url();
    let loader = Arc::new(MockLoader::new(600, 300));
    let factory = Arc::new(MockDecoderFactory::rejecting());
    let pipeline = build_pipeline(&loader, factory, PipelineConfig::default());

    let (handler, rx) = completion_channel();
    let _task = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler));

    let result = expect_completion(rx).await;
    assert!(matches!(result, Err(ImageLoadError::DecodingFailed)));
}

#[tokio::test]
async fn test_dedup_disabled_fetches_separately() {
    let url = unique_url();
    let loader = Arc::new(MockLoader::new(600, 300));
    let factory = Arc::new(MockDecoderFactory::new());
    let config = PipelineConfig {
        is_deduplication_enabled: false,
        ..PipelineConfig::default()
    };
    let pipeline = build_pipeline(&loader, factory, config);

    let mut completions = Vec::new();
    for _ in 0..2 {
        let (handler, rx) = completion_channel();
        let _task = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler));
        completions.push(rx);
    }
    for rx in completions {
        expect_completion(rx).await.expect("load succeeds");
    }

    assert_eq!(loader.call_count(), 2, "no coalescing with dedup disabled");
}

#[tokio::test]
async fn test_data_cache_round_trip() {
    let url = unique_url();
    let cache = Arc::new(MockDataCache::new());

    // First pipeline: network load populates the data cache.
    let loader = Arc::new(MockLoader::new(900, 300));
    let context = PipelineContext::new(
        Arc::clone(&loader) as Arc<dyn DataLoader>,
        Arc::new(MockDecoderFactory::new()),
    )
    .with_data_cache(Arc::clone(&cache) as Arc<dyn DataCache>);
    let pipeline = ImagePipeline::new(context, PipelineConfig::default());

    let (handler, rx) = completion_channel();
    let _task = pipeline.load_image(ImageRequest::new(url.as_str()), None, Some(handler));
    expect_completion(rx).await.expect("network load succeeds");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cache.contains(url.as_str()), "final bytes persisted to data cache");

    // Second pipeline, same cache: served from disk, loader untouched.
    let loader2 = Arc::new(MockLoader::new(900, 300));
    let context2 = PipelineContext::new(
        Arc::clone(&loader2) as Arc<dyn DataLoader>,
        Arc::new(MockDecoderFactory::new()),
    )
    .with_data_cache(Arc::clone(&cache) as Arc<dyn DataCache>);
    let pipeline2 = ImagePipeline::new(context2, PipelineConfig::default());

    let (handler2, rx2) = completion_channel();
    let _task2 = pipeline2.load_image(ImageRequest::new(url.as_str()), None, Some(handler2));
    expect_completion(rx2).await.expect("cached load succeeds");
    assert_eq!(loader2.call_count(), 0);
}

#[tokio::test]
async fn test_terminal_callback_fires_exactly_once() {
    let url = unique_url();
    let loader = Arc::new(MockLoader::new(600, 300));
    let factory = Arc::new(MockDecoderFactory::new());
    let pipeline = build_pipeline(&loader, factory, PipelineConfig::default());

    let completions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completions);
    let handler: CompletionHandler = Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let _task = pipeline.load_url(url.as_str(), handler);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}
