//! The pipeline orchestrator: a single serial event loop that owns every
//! session-state mutation.
//!
//! All I/O, decode, and process completions re-enter this loop as
//! [`PipelineEvent`] messages, which makes each state transition a linear
//! sequence without locks. Stage work itself runs elsewhere: network loads
//! behind the network queue, decodes and processing behind their queues on
//! the blocking pool, disk probes as plain tasks. Nothing here awaits stage
//! completion; the loop only reacts to messages.
//!
//! ```text
//! Submit ──► memory cache ──► session (find-or-create)
//!                                │
//!                    rate limiter admission
//!                                │
//!                        disk-cache probe ── hit ──► final decode
//!                                │ miss                    │
//!                        network download ──► decode ──► processing ──► delivery
//! ```

use crate::cache::{DataCache, ImageCache};
use crate::cancellation::CancellationSource;
use crate::decode::{Decoder, DecoderFactory};
use crate::error::{DataError, ImageLoadError};
use crate::image::{ImageContainer, ImageResponse};
use crate::loader::{DataLoader, DataRequest, DataResponse, DataSink, ResumeDirective};
use crate::metrics::TaskMetrics;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::delivery::DeliveryMessage;
use crate::pipeline::processing::{ProcessingId, ProcessingKey, ProcessingSession};
use crate::pipeline::session::{LoadSession, SessionId, SessionKey, SessionPhase};
use crate::queue::OperationQueue;
use crate::rate_limiter::{Admission, RateLimiter};
use crate::request::{ImageRequest, RequestPriority};
use crate::resumable::{ResumableData, ResumableDataStore};
use crate::task::{TaskId, TaskShared};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Messages processed by the pipeline context.
pub(crate) enum PipelineEvent {
    Submit {
        shared: Arc<TaskShared>,
        request: ImageRequest,
    },
    CancelTask {
        task_id: TaskId,
    },
    SetPriority {
        task_id: TaskId,
        priority: RequestPriority,
    },
    RateLimiterTick,
    DiskProbeFinished {
        session_id: SessionId,
        data: Option<Bytes>,
    },
    DataChunk {
        session_id: SessionId,
        data: Bytes,
        response: DataResponse,
    },
    DataFinished {
        session_id: SessionId,
        result: Result<(), DataError>,
    },
    DecodeFinished {
        session_id: SessionId,
        decoder: Option<Box<dyn Decoder>>,
        container: Option<ImageContainer>,
        is_final: bool,
    },
    ProcessFinished {
        session_id: SessionId,
        processing_id: ProcessingId,
        output: Option<image::DynamicImage>,
    },
}

enum TaskOutcome {
    Success(ImageResponse),
    Failure(ImageLoadError),
    Cancelled,
}

pub(crate) struct Orchestrator {
    config: PipelineConfig,
    loader: Arc<dyn DataLoader>,
    decoder_factory: Arc<dyn DecoderFactory>,
    memory_cache: Option<Arc<dyn ImageCache>>,
    data_cache: Option<Arc<dyn DataCache>>,
    events_tx: mpsc::UnboundedSender<PipelineEvent>,
    delivery_tx: mpsc::UnboundedSender<DeliveryMessage>,
    sessions: HashMap<SessionId, LoadSession>,
    session_index: HashMap<SessionKey, SessionId>,
    task_index: HashMap<TaskId, SessionId>,
    task_metrics: HashMap<TaskId, TaskMetrics>,
    resumable: &'static ResumableDataStore,
    rate_limiter: RateLimiter<SessionId>,
    rate_tick_scheduled: bool,
    network_queue: OperationQueue,
    decode_queue: OperationQueue,
    processing_queue: OperationQueue,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        loader: Arc<dyn DataLoader>,
        decoder_factory: Arc<dyn DecoderFactory>,
        memory_cache: Option<Arc<dyn ImageCache>>,
        data_cache: Option<Arc<dyn DataCache>>,
        events_tx: mpsc::UnboundedSender<PipelineEvent>,
        delivery_tx: mpsc::UnboundedSender<DeliveryMessage>,
    ) -> Self {
        let network_queue = OperationQueue::new(config.data_loading_queue_capacity, "network");
        let decode_queue = OperationQueue::new(config.decoding_queue_capacity, "decode");
        let processing_queue = OperationQueue::new(config.processing_queue_capacity, "processing");
        Self {
            config,
            loader,
            decoder_factory,
            memory_cache,
            data_cache,
            events_tx,
            delivery_tx,
            sessions: HashMap::new(),
            session_index: HashMap::new(),
            task_index: HashMap::new(),
            task_metrics: HashMap::new(),
            resumable: ResumableDataStore::shared(),
            rate_limiter: RateLimiter::with_defaults(),
            rate_tick_scheduled: false,
            network_queue,
            decode_queue,
            processing_queue,
        }
    }

    /// Runs the event loop until every sender is dropped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PipelineEvent>) {
        info!("Pipeline context started");
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
        debug!("Pipeline context stopped");
    }

    fn handle(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Submit { shared, request } => self.handle_submit(shared, request),
            PipelineEvent::CancelTask { task_id } => self.handle_cancel(task_id),
            PipelineEvent::SetPriority { task_id, priority } => {
                self.handle_set_priority(task_id, priority)
            }
            PipelineEvent::RateLimiterTick => self.handle_rate_tick(),
            PipelineEvent::DiskProbeFinished { session_id, data } => {
                self.handle_disk_probe_finished(session_id, data)
            }
            PipelineEvent::DataChunk {
                session_id,
                data,
                response,
            } => self.handle_data_chunk(session_id, data, response),
            PipelineEvent::DataFinished { session_id, result } => {
                self.handle_data_finished(session_id, result)
            }
            PipelineEvent::DecodeFinished {
                session_id,
                decoder,
                container,
                is_final,
            } => self.handle_decode_finished(session_id, decoder, container, is_final),
            PipelineEvent::ProcessFinished {
                session_id,
                processing_id,
                output,
            } => self.handle_process_finished(session_id, processing_id, output),
        }
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    fn handle_submit(&mut self, shared: Arc<TaskShared>, request: ImageRequest) {
        let task_id = shared.id();
        let mut metrics = TaskMetrics::new(task_id.as_u64());

        if shared.is_cancelled() {
            metrics.was_cancelled = true;
            metrics.end_date = Some(Utc::now());
            let _ = self.delivery_tx.send(DeliveryMessage::Terminal {
                task_id,
                result: None,
                metrics,
            });
            return;
        }

        if request.options().is_memory_cache_read_allowed {
            if let Some(cache) = self.memory_cache.as_ref() {
                if let Some(response) = cache.get(&request) {
                    debug!(task = %task_id, url = request.url(), "Memory cache hit");
                    metrics.is_memory_cache_hit = true;
                    metrics.end_date = Some(Utc::now());
                    let _ = self.delivery_tx.send(DeliveryMessage::Terminal {
                        task_id,
                        result: Some(Ok(response)),
                        metrics,
                    });
                    return;
                }
            }
        }

        let key = if self.config.is_deduplication_enabled {
            SessionKey::Shared(request.load_key())
        } else {
            SessionKey::Unique(task_id.as_u64())
        };

        let existing = self
            .session_index
            .get(&key)
            .copied()
            .filter(|id| self.sessions.contains_key(id));

        match existing {
            Some(session_id) => {
                metrics.was_subscribed_to_existing_session = true;
                self.task_metrics.insert(task_id, metrics);
                self.task_index.insert(task_id, session_id);

                let (priority_changed, final_image) = {
                    let Some(session) = self.sessions.get_mut(&session_id) else {
                        return;
                    };
                    debug!(task = %task_id, session = %session_id, "Joined existing session");
                    session.subscribe(shared, request);
                    (true, session.decoded_final.clone())
                };
                if priority_changed {
                    self.propagate_session_priority(session_id);
                }
                if let Some(container) = final_image {
                    self.dispatch_processing(session_id, task_id, container);
                }
            }
            None => {
                self.task_metrics.insert(task_id, metrics);
                let mut session = LoadSession::new(key.clone(), request.clone());
                session.subscribe(shared, request);
                let session_id = session.id;
                self.session_index.insert(key, session_id);
                self.task_index.insert(task_id, session_id);
                self.sessions.insert(session_id, session);
                debug!(task = %task_id, session = %session_id, "Created load session");
                self.admit_session(session_id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Admission and rate limiting
    // ------------------------------------------------------------------

    fn admit_session(&mut self, session_id: SessionId) {
        if !self.config.is_rate_limiter_enabled {
            self.start_disk_probe(session_id);
            return;
        }
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        match self.rate_limiter.try_admit(session.token(), session_id) {
            Admission::Ready => self.start_disk_probe(session_id),
            Admission::Enqueued => {
                trace!(session = %session_id, "Rate limited; queued for admission");
                self.schedule_rate_tick();
            }
        }
    }

    fn schedule_rate_tick(&mut self) {
        if self.rate_tick_scheduled {
            return;
        }
        let Some(delay) = self.rate_limiter.next_ready_delay() else {
            return;
        };
        self.rate_tick_scheduled = true;
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
            let _ = tx.send(PipelineEvent::RateLimiterTick);
        });
    }

    fn handle_rate_tick(&mut self) {
        self.rate_tick_scheduled = false;
        for session_id in self.rate_limiter.drain_ready() {
            if self.sessions.contains_key(&session_id) {
                self.start_disk_probe(session_id);
            }
        }
        if self.rate_limiter.has_pending() {
            self.schedule_rate_tick();
        }
    }

    // ------------------------------------------------------------------
    // Disk probe
    // ------------------------------------------------------------------

    fn start_disk_probe(&mut self, session_id: SessionId) {
        let probe = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            session.phase = SessionPhase::ProbingDiskCache;
            if self.data_cache.is_some() && session.request.is_cacheable() {
                session.metrics.disk_probe_start_date = Some(Utc::now());
                Some((session.request.url().to_owned(), session.token()))
            } else {
                None
            }
        };

        let (url, token) = match probe {
            Some(probe) => probe,
            None => return self.start_download(session_id),
        };
        let Some(cache) = self.data_cache.as_ref() else {
            return self.start_download(session_id);
        };
        let lookup = cache.lookup(&url);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                data = lookup => {
                    let _ = tx.send(PipelineEvent::DiskProbeFinished { session_id, data });
                }
                _ = token.cancelled() => {}
            }
        });
    }

    fn handle_disk_probe_finished(&mut self, session_id: SessionId, data: Option<Bytes>) {
        let hit = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            session.metrics.disk_probe_end_date = Some(Utc::now());
            match data {
                Some(bytes) => {
                    debug!(session = %session_id, bytes = bytes.len(), "Disk cache hit");
                    session.from_disk_cache = true;
                    session.buffer.lock().extend_from_slice(&bytes);
                    session.phase = SessionPhase::Decoding;
                    true
                }
                None => false,
            }
        };
        if hit {
            self.start_decode(session_id, true);
        } else {
            self.start_download(session_id);
        }
    }

    // ------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------

    fn start_download(&mut self, session_id: SessionId) {
        let (data_request, op_cancel, priority) = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            session.phase = SessionPhase::Downloading;
            session.metrics.network_start_date = Some(Utc::now());

            let mut data_request = DataRequest::new(session.request.url());
            if self.config.is_resumable_data_enabled && session.request.is_cacheable() {
                if let Some(entry) = self.resumable.take(session.request.url()) {
                    debug!(
                        session = %session_id,
                        offset = entry.offset(),
                        previously_confirmed = entry.server_confirmed,
                        "Attempting resumable download"
                    );
                    data_request.resume = Some(ResumeDirective {
                        offset: entry.offset(),
                        validator: entry.validator.clone(),
                    });
                    session.resumable = Some(entry);
                }
            }

            let op_cancel = Arc::new(CancellationSource::new());
            {
                let op_cancel = Arc::clone(&op_cancel);
                session.token().register(move || op_cancel.cancel());
            }
            (data_request, op_cancel, session.priority)
        };

        let loader = Arc::clone(&self.loader);
        let sink = DataSink::new(session_id, self.events_tx.clone());
        let op_token = op_cancel.token();
        let hook_cancel = Arc::clone(&op_cancel);
        let op_id = self.network_queue.enqueue(
            priority,
            move || hook_cancel.cancel(),
            move |handle| {
                tokio::spawn(async move {
                    loader.load_data(data_request, sink, op_token).await;
                    handle.finish();
                });
            },
        );
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.network_operation = Some(op_id);
        }
    }

    fn handle_data_chunk(&mut self, session_id: SessionId, data: Bytes, response: DataResponse) {
        let factory = Arc::clone(&self.decoder_factory);
        let delivery_tx = self.delivery_tx.clone();
        let progressive = self.config.is_progressive_decoding_enabled;

        let schedule_partial = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            if session.phase != SessionPhase::Downloading {
                return;
            }

            let is_first_chunk = session.response.is_none();
            if is_first_chunk {
                if let Some(entry) = session.resumable.take() {
                    if response.is_partial_content() {
                        // The server honored the range request: the parked
                        // bytes are a valid prefix of this resource version.
                        session.buffer.lock().extend_from_slice(&entry.data);
                        session.server_confirmed_resume = true;
                        session.metrics.was_resumed = true;
                        session.metrics.resumed_data_count = entry.offset();
                        session.metrics.server_confirmed_resume = true;
                        info!(
                            session = %session_id,
                            resumed_bytes = entry.offset(),
                            "Server confirmed resumption"
                        );
                    } else {
                        debug!(session = %session_id, "Server refused resumption");
                        session.metrics.was_resumed = true;
                    }
                }
            }

            session.buffer.lock().extend_from_slice(&data);
            session.metrics.downloaded_data_count += data.len() as u64;
            session.response = Some(response.clone());

            if !session.decoder_attempted && session.buffered_len() > 0 {
                session.decoder_attempted = true;
                let sample = session.buffer.lock().clone();
                session.decoder =
                    factory.make_decoder(&session.request, session.response.as_ref(), &sample);
                if session.decoder.is_none() {
                    trace!(session = %session_id, "No decoder for incoming data yet");
                }
            }

            let completed = session.buffered_len() as u64;
            let total = response.expected_length.unwrap_or(0);
            for subscriber in session.subscribers.values() {
                subscriber.shared.set_progress(completed, total);
                let _ = delivery_tx.send(DeliveryMessage::Progress {
                    task_id: subscriber.shared.id(),
                    response: None,
                    completed,
                    total,
                });
            }

            progressive
                && !session.decode_in_flight
                && session.decoder.is_some()
                && response
                    .expected_length
                    .is_some_and(|expected| completed < expected)
        };

        if schedule_partial {
            self.start_decode(session_id, false);
        }
    }

    fn handle_data_finished(&mut self, session_id: SessionId, result: Result<(), DataError>) {
        enum Next {
            FailLoad(DataError),
            StartFinalDecode,
            Wait,
        }

        let next = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            if session.phase != SessionPhase::Downloading {
                return;
            }
            session.metrics.network_end_date = Some(Utc::now());
            session.network_operation = None;
            match result {
                Err(e) => {
                    warn!(session = %session_id, error = %e, "Download failed");
                    Next::FailLoad(e)
                }
                Ok(()) => {
                    debug!(
                        session = %session_id,
                        bytes = session.buffered_len(),
                        "Download complete"
                    );
                    session.phase = SessionPhase::Decoding;
                    if session.decode_in_flight {
                        session.pending_final_decode = true;
                        Next::Wait
                    } else {
                        Next::StartFinalDecode
                    }
                }
            }
        };

        match next {
            Next::FailLoad(e) => {
                self.save_resumable(session_id);
                self.fail_session(session_id, ImageLoadError::DataLoadingFailed(e));
            }
            Next::StartFinalDecode => self.start_decode(session_id, true),
            Next::Wait => {}
        }
    }

    // ------------------------------------------------------------------
    // Decoding
    // ------------------------------------------------------------------

    fn start_decode(&mut self, session_id: SessionId, is_final: bool) {
        let factory = Arc::clone(&self.decoder_factory);
        enum Prepared {
            Run {
                decoder: Box<dyn Decoder>,
                buffer: Arc<parking_lot::Mutex<bytes::BytesMut>>,
                token: crate::cancellation::CancellationToken,
                priority: RequestPriority,
            },
            FailDecode,
            Skip,
        }

        let prepared = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            if session.decode_in_flight {
                if is_final {
                    session.pending_final_decode = true;
                }
                Prepared::Skip
            } else {
                // The disk-cache path reaches the decoder lazily: no chunks
                // ever flowed, so the factory runs here on the full buffer.
                if is_final && !session.decoder_attempted {
                    session.decoder_attempted = true;
                    let sample = session.buffer.lock().clone();
                    session.decoder =
                        factory.make_decoder(&session.request, session.response.as_ref(), &sample);
                }
                match session.decoder.take() {
                    Some(decoder) => {
                        session.decode_in_flight = true;
                        if is_final {
                            session.phase = SessionPhase::Decoding;
                            session.metrics.decode_start_date = Some(Utc::now());
                        }
                        Prepared::Run {
                            decoder,
                            buffer: Arc::clone(&session.buffer),
                            token: session.token(),
                            priority: session.priority,
                        }
                    }
                    None if is_final => Prepared::FailDecode,
                    None => Prepared::Skip,
                }
            }
        };

        match prepared {
            Prepared::Run {
                decoder,
                buffer,
                token,
                priority,
            } => {
                let tx = self.events_tx.clone();
                let op_id = self.decode_queue.enqueue(priority, || {}, move |handle| {
                    tokio::spawn(async move {
                        if token.is_cancelled() {
                            handle.finish();
                            let _ = tx.send(PipelineEvent::DecodeFinished {
                                session_id,
                                decoder: Some(decoder),
                                container: None,
                                is_final,
                            });
                            return;
                        }
                        // Snapshot at operation start, not enqueue: the
                        // decode sees the freshest data.
                        let snapshot = buffer.lock().clone().freeze();
                        let mut decoder = decoder;
                        let result = tokio::task::spawn_blocking(move || {
                            let container = decoder.decode(&snapshot, is_final);
                            (decoder, container)
                        })
                        .await;
                        handle.finish();
                        let (decoder, container) = match result {
                            Ok((decoder, container)) => (Some(decoder), container),
                            Err(e) => {
                                warn!(session = %session_id, error = %e, "Decode task panicked");
                                (None, None)
                            }
                        };
                        let _ = tx.send(PipelineEvent::DecodeFinished {
                            session_id,
                            decoder,
                            container,
                            is_final,
                        });
                    });
                });
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.decode_operation = Some(op_id);
                }
            }
            Prepared::FailDecode => {
                warn!(session = %session_id, "No decoder could be constructed");
                self.fail_session(session_id, ImageLoadError::DecodingFailed);
            }
            Prepared::Skip => {}
        }
    }

    fn handle_decode_finished(
        &mut self,
        session_id: SessionId,
        decoder: Option<Box<dyn Decoder>>,
        container: Option<ImageContainer>,
        is_final: bool,
    ) {
        enum Next {
            FailDecode,
            Fanout(ImageContainer, Vec<TaskId>),
            PartialFanout(ImageContainer, Vec<TaskId>, bool),
            StartFinal,
            Nothing,
        }

        let next = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            session.decode_in_flight = false;
            session.decode_operation = None;
            if session.decoder.is_none() {
                session.decoder = decoder;
            }

            if is_final {
                session.metrics.decode_end_date = Some(Utc::now());
                match container {
                    None => Next::FailDecode,
                    Some(mut container) => {
                        container.is_final = true;
                        session.decoded_final = Some(container.clone());
                        session.phase = SessionPhase::Delivering;
                        debug!(
                            session = %session_id,
                            width = container.image.width(),
                            height = container.image.height(),
                            "Final image decoded"
                        );
                        Next::Fanout(container, session.subscriber_ids())
                    }
                }
            } else {
                match container {
                    Some(container) => {
                        // Partial images may be skipped but never reordered.
                        let deliver = match container.scan_number {
                            Some(scan) if scan < session.last_scan_number => false,
                            Some(scan) => {
                                session.last_scan_number = scan;
                                true
                            }
                            None => true,
                        };
                        Next::PartialFanout(
                            container,
                            if deliver {
                                session.subscriber_ids()
                            } else {
                                Vec::new()
                            },
                            session.pending_final_decode,
                        )
                    }
                    None => {
                        if session.pending_final_decode {
                            session.pending_final_decode = false;
                            Next::StartFinal
                        } else {
                            Next::Nothing
                        }
                    }
                }
            }
        };

        match next {
            Next::FailDecode => self.fail_session(session_id, ImageLoadError::DecodingFailed),
            Next::Fanout(container, task_ids) => {
                self.persist_to_data_cache(session_id);
                for task_id in task_ids {
                    self.dispatch_processing(session_id, task_id, container.clone());
                }
            }
            Next::PartialFanout(container, task_ids, pending_final) => {
                for task_id in task_ids {
                    self.dispatch_processing(session_id, task_id, container.clone());
                }
                if pending_final {
                    if let Some(session) = self.sessions.get_mut(&session_id) {
                        session.pending_final_decode = false;
                    }
                    self.start_decode(session_id, true);
                }
            }
            Next::StartFinal => self.start_decode(session_id, true),
            Next::Nothing => {}
        }
    }

    /// Writes the session's complete bytes through to the disk cache and
    /// clears any resumable entry: a delivered final image supersedes both.
    fn persist_to_data_cache(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        let url = session.request.url().to_owned();
        if session.request.is_cacheable() {
            if !session.from_disk_cache {
                if let Some(cache) = self.data_cache.as_ref() {
                    let bytes = session.buffer.lock().clone().freeze();
                    cache.store(&url, bytes);
                }
            }
            self.resumable.remove(&url);
        }
    }

    // ------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------

    fn dispatch_processing(
        &mut self,
        session_id: SessionId,
        task_id: TaskId,
        container: ImageContainer,
    ) {
        let is_final = container.is_final;
        let animated_enabled = self.config.is_animated_image_data_enabled;

        enum Plan {
            Passthrough,
            Joined {
                operation: crate::queue::OperationId,
                priority: RequestPriority,
            },
            Create {
                processor: Arc<dyn crate::process::ImageProcessor>,
                request: ImageRequest,
                key: ProcessingKey,
                priority: RequestPriority,
                cancel: Arc<CancellationSource>,
            },
            Drop,
        }

        let plan = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            let Some(subscriber) = session.subscribers.get_mut(&task_id) else {
                return;
            };

            match subscriber.request.processor().cloned() {
                None => Plan::Passthrough,
                Some(_) if container.is_animated && animated_enabled => Plan::Passthrough,
                Some(processor) => {
                    if !is_final && subscriber.outstanding_partial.is_some() {
                        // Per-task backpressure: one partial processing run
                        // at a time; further partials are dropped.
                        trace!(task = %task_id, "Dropping partial; processing busy");
                        Plan::Drop
                    } else {
                        if is_final {
                            // The final image overrides any outstanding
                            // partial processing for this task.
                            if let Some(previous) = subscriber.outstanding_partial.take() {
                                if let Some(ps) = session.processing.get_mut(&previous) {
                                    if ps.unsubscribe(task_id) {
                                        if let Some(ps) = session.processing.remove(&previous) {
                                            session.processing_index.remove(&ps.key);
                                            ps.cancel_source.cancel();
                                            self.processing_queue.cancel(ps.operation);
                                        }
                                    }
                                }
                            }
                        }
                        let key = ProcessingKey::new(processor.as_ref(), &container);
                        if let Some(&existing) = session.processing_index.get(&key) {
                            if let Some(ps) = session.processing.get_mut(&existing) {
                                ps.subscribers.insert(task_id);
                                if !is_final {
                                    if let Some(subscriber) =
                                        session.subscribers.get_mut(&task_id)
                                    {
                                        subscriber.outstanding_partial = Some(existing);
                                    }
                                }
                                let priority = ProcessingSession::priority_of(
                                    ps.subscribers.iter().filter_map(|id| {
                                        session.subscribers.get(id).map(|s| s.request.priority())
                                    }),
                                );
                                Plan::Joined {
                                    operation: ps.operation,
                                    priority,
                                }
                            } else {
                                Plan::Drop
                            }
                        } else {
                            let cancel = Arc::new(CancellationSource::new());
                            {
                                let cancel = Arc::clone(&cancel);
                                session.token().register(move || cancel.cancel());
                            }
                            let request = session
                                .subscribers
                                .get(&task_id)
                                .map(|s| s.request.clone())
                                .unwrap_or_else(|| session.request.clone());
                            let priority = request.priority();
                            Plan::Create {
                                processor,
                                request,
                                key,
                                priority,
                                cancel,
                            }
                        }
                    }
                }
            }
        };

        match plan {
            Plan::Passthrough => self.deliver_unprocessed(session_id, task_id, container),
            Plan::Drop => {}
            Plan::Joined {
                operation,
                priority,
            } => {
                trace!(task = %task_id, "Joined processing session");
                self.processing_queue.set_priority(operation, priority);
                if is_final {
                    self.mark_process_start(task_id);
                }
            }
            Plan::Create {
                processor,
                request,
                key,
                priority,
                cancel,
            } => {
                let processing_id = ProcessingId::new();
                let token = cancel.token();
                let tx = self.events_tx.clone();
                let input = container.clone();
                let op_id = self.processing_queue.enqueue(
                    priority,
                    {
                        let cancel = Arc::clone(&cancel);
                        move || cancel.cancel()
                    },
                    move |handle| {
                        tokio::spawn(async move {
                            if token.is_cancelled() {
                                handle.finish();
                                let _ = tx.send(PipelineEvent::ProcessFinished {
                                    session_id,
                                    processing_id,
                                    output: None,
                                });
                                return;
                            }
                            let output = tokio::task::spawn_blocking(move || {
                                processor.process(&input, &request)
                            })
                            .await
                            .ok()
                            .flatten();
                            handle.finish();
                            let _ = tx.send(PipelineEvent::ProcessFinished {
                                session_id,
                                processing_id,
                                output,
                            });
                        });
                    },
                );
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    let mut subscribers = std::collections::HashSet::new();
                    subscribers.insert(task_id);
                    session.processing_index.insert(key.clone(), processing_id);
                    session.processing.insert(
                        processing_id,
                        ProcessingSession {
                            id: processing_id,
                            key,
                            input: container,
                            subscribers,
                            operation: op_id,
                            cancel_source: cancel,
                        },
                    );
                    if !is_final {
                        if let Some(subscriber) = session.subscribers.get_mut(&task_id) {
                            subscriber.outstanding_partial = Some(processing_id);
                        }
                    }
                }
                if is_final {
                    self.mark_process_start(task_id);
                }
            }
        }
    }

    fn handle_process_finished(
        &mut self,
        session_id: SessionId,
        processing_id: ProcessingId,
        output: Option<image::DynamicImage>,
    ) {
        let (input, members) = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            let Some(ps) = session.processing.remove(&processing_id) else {
                return;
            };
            trace!(session = %session_id, processing = %ps.id, "Processing run finished");
            session.processing_index.remove(&ps.key);
            let members: Vec<TaskId> = ps.subscribers.iter().copied().collect();
            for member in &members {
                if let Some(subscriber) = session.subscribers.get_mut(member) {
                    if subscriber.outstanding_partial == Some(processing_id) {
                        subscriber.outstanding_partial = None;
                    }
                }
            }
            (ps.input, members)
        };

        let is_final = input.is_final;
        let shared_output = output.map(Arc::new);

        for task_id in members {
            let still_subscribed = self
                .sessions
                .get(&session_id)
                .is_some_and(|s| s.subscribers.contains_key(&task_id));
            if !still_subscribed {
                continue;
            }
            match (&shared_output, is_final) {
                (Some(image), true) => {
                    self.mark_process_end(task_id);
                    let container = ImageContainer {
                        image: Arc::clone(image),
                        is_final: true,
                        scan_number: None,
                        is_animated: input.is_animated,
                    };
                    self.complete_task(session_id, task_id, container);
                }
                (Some(image), false) => {
                    let container = ImageContainer {
                        image: Arc::clone(image),
                        is_final: false,
                        scan_number: input.scan_number,
                        is_animated: input.is_animated,
                    };
                    self.send_partial(session_id, task_id, container);
                }
                (None, true) => {
                    self.mark_process_end(task_id);
                    self.finish_task(
                        session_id,
                        task_id,
                        TaskOutcome::Failure(ImageLoadError::ProcessingFailed),
                    );
                }
                (None, false) => {
                    debug!(task = %task_id, "Partial processing produced no image");
                }
            }
        }
    }

    fn mark_process_start(&mut self, task_id: TaskId) {
        if let Some(metrics) = self.task_metrics.get_mut(&task_id) {
            metrics.process_start_date = Some(Utc::now());
        }
    }

    fn mark_process_end(&mut self, task_id: TaskId) {
        if let Some(metrics) = self.task_metrics.get_mut(&task_id) {
            metrics.process_end_date = Some(Utc::now());
        }
    }

    // ------------------------------------------------------------------
    // Delivery and termination
    // ------------------------------------------------------------------

    fn deliver_unprocessed(
        &mut self,
        session_id: SessionId,
        task_id: TaskId,
        container: ImageContainer,
    ) {
        if container.is_final {
            self.complete_task(session_id, task_id, container);
        } else {
            self.send_partial(session_id, task_id, container);
        }
    }

    fn send_partial(&self, session_id: SessionId, task_id: TaskId, container: ImageContainer) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        let Some(subscriber) = session.subscribers.get(&task_id) else {
            return;
        };
        let progress = subscriber.shared.progress();
        let response = ImageResponse {
            container,
            url: session.request.url().to_owned(),
        };
        let _ = self.delivery_tx.send(DeliveryMessage::Progress {
            task_id,
            response: Some(response),
            completed: progress.completed,
            total: progress.total,
        });
    }

    /// Terminal success for one task: memory-cache write, then delivery.
    fn complete_task(&mut self, session_id: SessionId, task_id: TaskId, container: ImageContainer) {
        let response = {
            let Some(session) = self.sessions.get(&session_id) else {
                return;
            };
            let Some(subscriber) = session.subscribers.get(&task_id) else {
                return;
            };
            let response = ImageResponse {
                container,
                url: session.request.url().to_owned(),
            };
            if subscriber.request.options().is_memory_cache_write_allowed {
                if let Some(cache) = self.memory_cache.as_ref() {
                    cache.put(&subscriber.request, response.clone());
                }
            }
            response
        };
        self.finish_task(session_id, task_id, TaskOutcome::Success(response));
    }

    /// Delivers a terminal to one task and unsubscribes it. Tears the
    /// session down when the last subscriber leaves.
    fn finish_task(&mut self, session_id: SessionId, task_id: TaskId, outcome: TaskOutcome) {
        self.task_index.remove(&task_id);
        let mut metrics = self
            .task_metrics
            .remove(&task_id)
            .unwrap_or_else(|| TaskMetrics::new(task_id.as_u64()));
        metrics.end_date = Some(Utc::now());
        if matches!(outcome, TaskOutcome::Cancelled) {
            metrics.was_cancelled = true;
        }

        let (last, priority_changed) = {
            match self.sessions.get_mut(&session_id) {
                Some(session) => {
                    // Drop the task out of any shared processing runs;
                    // emptied runs are cancelled.
                    let mut emptied = Vec::new();
                    for (pid, ps) in session.processing.iter_mut() {
                        if ps.subscribers.remove(&task_id) && ps.subscribers.is_empty() {
                            emptied.push(*pid);
                        }
                    }
                    for pid in emptied {
                        if let Some(ps) = session.processing.remove(&pid) {
                            session.processing_index.remove(&ps.key);
                            ps.cancel_source.cancel();
                            self.processing_queue.cancel(ps.operation);
                        }
                    }
                    let last = session.unsubscribe(task_id);
                    metrics.session = Some(session.metrics.clone());
                    (last, !last)
                }
                None => (false, false),
            }
        };

        if last {
            let was_cancelled = matches!(outcome, TaskOutcome::Cancelled);
            if let Some(session_metrics) = self.teardown_session(session_id, was_cancelled) {
                metrics.session = Some(session_metrics);
            }
        } else if priority_changed {
            self.propagate_session_priority(session_id);
        }

        let result = match outcome {
            TaskOutcome::Success(response) => Some(Ok(response)),
            TaskOutcome::Failure(error) => Some(Err(error)),
            TaskOutcome::Cancelled => None,
        };
        let _ = self.delivery_tx.send(DeliveryMessage::Terminal {
            task_id,
            result,
            metrics,
        });
    }

    /// Fails every current subscriber with the same session-wide error.
    fn fail_session(&mut self, session_id: SessionId, error: ImageLoadError) {
        let task_ids = match self.sessions.get(&session_id) {
            Some(session) => session.subscriber_ids(),
            None => return,
        };
        warn!(session = %session_id, error = %error, "Session failed");
        for task_id in task_ids {
            self.finish_task(session_id, task_id, TaskOutcome::Failure(error.clone()));
        }
    }

    /// Removes the session and cancels everything nested under it.
    fn teardown_session(
        &mut self,
        session_id: SessionId,
        was_cancelled: bool,
    ) -> Option<crate::metrics::SessionMetrics> {
        if was_cancelled {
            self.save_resumable(session_id);
        }
        let mut session = self.sessions.remove(&session_id)?;
        self.session_index.remove(&session.key);
        session.metrics.was_cancelled |= was_cancelled;
        session.metrics.end_date = Some(Utc::now());

        session.cancel_source.cancel();
        if let Some(op) = session.network_operation.take() {
            self.network_queue.cancel(op);
        }
        if let Some(op) = session.decode_operation.take() {
            self.decode_queue.cancel(op);
        }
        for ps in session.processing.values() {
            ps.cancel_source.cancel();
            self.processing_queue.cancel(ps.operation);
        }
        debug!(
            session = %session_id,
            cancelled = was_cancelled,
            "Session removed"
        );
        Some(session.metrics.clone())
    }

    /// Parks the buffered bytes for later resumption, when the download got
    /// far enough to be worth a range request.
    fn save_resumable(&mut self, session_id: SessionId) {
        if !self.config.is_resumable_data_enabled {
            return;
        }
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        if session.phase != SessionPhase::Downloading || !session.request.is_cacheable() {
            return;
        }
        let Some(validator) = session
            .response
            .as_ref()
            .and_then(|r| r.validator.clone())
        else {
            return;
        };
        let data = session.buffer.lock().clone().freeze();
        if data.is_empty() {
            return;
        }
        debug!(
            session = %session_id,
            bytes = data.len(),
            "Parking resumable data"
        );
        self.resumable.save(
            session.request.url(),
            ResumableData {
                validator,
                data,
                server_confirmed: session.server_confirmed_resume,
            },
        );
    }

    // ------------------------------------------------------------------
    // Cancellation and priority
    // ------------------------------------------------------------------

    fn handle_cancel(&mut self, task_id: TaskId) {
        let Some(&session_id) = self.task_index.get(&task_id) else {
            // Already terminal, or never made it past submission.
            return;
        };
        debug!(task = %task_id, session = %session_id, "Task cancelled");
        self.finish_task(session_id, task_id, TaskOutcome::Cancelled);
    }

    fn handle_set_priority(&mut self, task_id: TaskId, priority: RequestPriority) {
        let Some(&session_id) = self.task_index.get(&task_id) else {
            return;
        };
        let changed = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            if let Some(subscriber) = session.subscribers.get_mut(&task_id) {
                subscriber.request.set_priority(priority);
                subscriber.shared.set_priority(priority);
            }
            session.recompute_priority();
            true
        };
        if changed {
            self.propagate_session_priority(session_id);
        }
    }

    /// Pushes the session's current priority onto its waiting queue items.
    fn propagate_session_priority(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        let priority = session.priority;
        let network = session.network_operation;
        let decode = session.decode_operation;
        let processing: Vec<(crate::queue::OperationId, RequestPriority)> = session
            .processing
            .values()
            .map(|ps| {
                let priority = ProcessingSession::priority_of(ps.subscribers.iter().filter_map(
                    |id| session.subscribers.get(id).map(|s| s.request.priority()),
                ));
                (ps.operation, priority)
            })
            .collect();

        if let Some(op) = network {
            self.network_queue.set_priority(op, priority);
        }
        if let Some(op) = decode {
            self.decode_queue.set_priority(op, priority);
        }
        for (op, priority) in processing {
            self.processing_queue.set_priority(op, priority);
        }
    }
}
