//! Integration tests for the scheduling core.
//!
//! Every test drives a real [`ConversionService`] with in-memory stores, a
//! hand-set memory probe and a scripted processor, so they run offline and
//! finish in well under a second each.
//!
//! Run with:
//!   cargo test --test scheduling -- --nocapture
//!
//! Set `RUST_LOG=edgequake_jobs=debug` to see scheduler decisions.

use async_trait::async_trait;
use edgequake_jobs::{
    ArtifactSlot, CancelAck, ContentKey, ConversionError, ConversionRequest, ConversionService,
    ConvertTask, DurableUploadManager, ErrorKind, JobError, JobProcessor, ManualMemoryProbe,
    MemoryBand, MemoryObjectStore, ObjectRef, ObjectStore, OperationId, OperationObserver,
    OperationStatus, SchedulerConfig, Segment,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};

// ── Test helpers ─────────────────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Processor that writes `[<segment>]` into the scratch store, with
/// configurable failures, latency and an optional gate.
struct ScriptedProcessor {
    scratch: Arc<MemoryObjectStore>,
    /// Chunks whose first page is listed here fail as unrecoverable.
    failing_pages: HashSet<u32>,
    /// Failure for whole-document runs.
    whole_failure: Option<ConversionError>,
    /// Failure for every run, chunk or whole.
    always: Option<ConversionError>,
    /// The first this-many calls fail with `ResourceExhausted`.
    exhaust_first: usize,
    delay: Duration,
    gate: Option<Gate>,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

struct Gate {
    entered: Notify,
    /// One permit lets one waiting conversion through.
    release: Semaphore,
}

impl ScriptedProcessor {
    fn new(scratch: Arc<MemoryObjectStore>) -> Self {
        Self {
            scratch,
            failing_pages: HashSet::new(),
            whole_failure: None,
            always: None,
            exhaust_first: 0,
            delay: Duration::from_millis(1),
            gate: None,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn fail_chunks_starting_at(mut self, pages: &[u32]) -> Self {
        self.failing_pages = pages.iter().copied().collect();
        self
    }

    fn fail_whole(mut self, err: ConversionError) -> Self {
        self.whole_failure = Some(err);
        self
    }

    fn fail_always(mut self, err: ConversionError) -> Self {
        self.always = Some(err);
        self
    }

    fn exhaust_first(mut self, calls: usize) -> Self {
        self.exhaust_first = calls;
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn gated(mut self) -> Self {
        self.gate = Some(Gate {
            entered: Notify::new(),
            release: Semaphore::new(0),
        });
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobProcessor for ScriptedProcessor {
    async fn convert(
        &self,
        _input: &ObjectRef,
        task: &ConvertTask,
    ) -> Result<ObjectRef, ConversionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            if let Ok(permit) = gate.release.acquire().await {
                permit.forget();
            }
        }
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if call < self.exhaust_first {
            return Err(ConversionError::ResourceExhausted("out of memory".into()));
        }
        if let Some(err) = &self.always {
            return Err(err.clone());
        }
        match (task.segment, &self.whole_failure) {
            (Some(Segment::Pages { first, .. }), _) if self.failing_pages.contains(&first) => Err(
                ConversionError::UnrecoverableInput(format!("corrupt page {first}")),
            ),
            (None, Some(err)) => Err(err.clone()),
            (segment, _) => {
                let label = segment.map_or_else(|| "whole".to_string(), |s| s.to_string());
                Ok(self.scratch.insert(format!("[{label}]").into_bytes()))
            }
        }
    }
}

/// Durable store whose puts are refused for matching content.
struct OutageStore {
    inner: Arc<MemoryObjectStore>,
    refuses: fn(&[u8]) -> bool,
}

impl OutageStore {
    fn new(inner: Arc<MemoryObjectStore>, refuses: fn(&[u8]) -> bool) -> Arc<Self> {
        Arc::new(Self { inner, refuses })
    }
}

#[async_trait]
impl ObjectStore for OutageStore {
    fn name(&self) -> &str {
        "durable"
    }

    async fn put(&self, bytes: Vec<u8>) -> Result<ObjectRef, JobError> {
        if (self.refuses)(&bytes) {
            return Err(JobError::Store {
                store: "durable".into(),
                detail: "503 service unavailable".into(),
            });
        }
        self.inner.put(bytes).await
    }

    async fn get(&self, reference: &ObjectRef) -> Result<Vec<u8>, JobError> {
        self.inner.get(reference).await
    }
}

#[derive(Default)]
struct RecordingObserver {
    completed: AtomicUsize,
    errored: Mutex<Vec<u32>>,
    finished: Mutex<Vec<OperationStatus>>,
}

impl OperationObserver for RecordingObserver {
    fn on_chunk_complete(&self, _operation: OperationId, _index: u32, _total_chunks: usize) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_chunk_error(&self, _operation: OperationId, index: u32, _error: &ConversionError) {
        self.errored.lock().push(index);
    }

    fn on_operation_finished(&self, _operation: OperationId, status: OperationStatus) {
        self.finished.lock().push(status);
    }
}

/// 120 pages over 100 kB, ten pages per chunk: twelve chunks.
fn chunking_config() -> SchedulerConfig {
    SchedulerConfig::builder()
        .chunk_size_threshold_bytes(1_000)
        .max_pages_per_chunk(10)
        .tick_interval_ms(5)
        .sample_interval_ms(5)
        .retry_delays_ms(1, 5)
        .build()
        .unwrap()
}

fn twelve_chunk_request() -> ConversionRequest {
    ConversionRequest::new(ObjectRef::new("mem://sources/report"), "pdf", "md")
        .estimated_input_bytes(100_000)
        .page_count(120)
}

/// Chunking as above, with uploads that give up after two quick attempts.
fn outage_config() -> SchedulerConfig {
    SchedulerConfig::builder()
        .chunk_size_threshold_bytes(1_000)
        .max_pages_per_chunk(10)
        .tick_interval_ms(5)
        .sample_interval_ms(5)
        .retry_delays_ms(1, 5)
        .upload_max_attempts(2)
        .upload_delays_ms(1, 2)
        .upload_attempt_timeouts_ms(100, 200)
        .build()
        .unwrap()
}

/// Ticks and samples far enough apart that only the first of each runs.
fn single_tick_config() -> SchedulerConfig {
    SchedulerConfig::builder()
        .baseline_concurrency(4)
        .max_concurrency_cap(16)
        .tick_interval_ms(60_000)
        .sample_interval_ms(60_000)
        .build()
        .unwrap()
}

fn memo_request(i: usize) -> ConversionRequest {
    ConversionRequest::new(ObjectRef::new(format!("mem://sources/memo-{i}")), "pdf", "md")
        .estimated_input_bytes(500)
}

struct Harness {
    service: ConversionService,
    processor: Arc<ScriptedProcessor>,
    /// Backing memory of the durable store.
    durable: Arc<MemoryObjectStore>,
    fallback: Arc<MemoryObjectStore>,
    probe: Arc<ManualMemoryProbe>,
}

fn harness(
    config: SchedulerConfig,
    build: impl FnOnce(ScriptedProcessor) -> ScriptedProcessor,
) -> Harness {
    harness_with(config, |durable| durable as Arc<dyn ObjectStore>, build)
}

/// `primary` wraps the in-memory durable store before it is handed to the
/// service.
fn harness_with(
    config: SchedulerConfig,
    primary: impl FnOnce(Arc<MemoryObjectStore>) -> Arc<dyn ObjectStore>,
    build: impl FnOnce(ScriptedProcessor) -> ScriptedProcessor,
) -> Harness {
    init_tracing();
    let scratch = Arc::new(MemoryObjectStore::new("scratch"));
    let durable = Arc::new(MemoryObjectStore::new("durable"));
    let fallback = Arc::new(MemoryObjectStore::new("fallback"));
    let probe = Arc::new(ManualMemoryProbe::new(0.1));
    let processor = Arc::new(build(ScriptedProcessor::new(scratch.clone())));
    let service = ConversionService::builder(config)
        .processor(processor.clone())
        .scratch_store(scratch)
        .durable_store(primary(durable.clone()))
        .fallback_store(fallback.clone())
        .memory_probe(probe.clone())
        .build()
        .unwrap();
    Harness {
        service,
        processor,
        durable,
        fallback,
        probe,
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn page_labels(skip: &[u32]) -> String {
    (0..12u32)
        .filter(|i| !skip.contains(i))
        .map(|i| format!("[pages {}-{}]", i * 10 + 1, i * 10 + 10))
        .collect()
}

// ── Chunked conversions ──────────────────────────────────────────────────────

#[tokio::test]
async fn two_failed_chunks_of_twelve_degrade() {
    let scratch = Arc::new(MemoryObjectStore::new("scratch"));
    let durable = Arc::new(MemoryObjectStore::new("durable"));
    let processor = Arc::new(ScriptedProcessor::new(scratch.clone()).fail_chunks_starting_at(&[31, 71]));
    let observer = Arc::new(RecordingObserver::default());
    init_tracing();
    let service = ConversionService::builder(chunking_config())
        .processor(processor.clone())
        .scratch_store(scratch)
        .durable_store(durable.clone())
        .memory_probe(Arc::new(ManualMemoryProbe::new(0.1)))
        .with_observer(observer.clone())
        .build()
        .unwrap();
    service.start().unwrap();

    let id = service.create_operation(twelve_chunk_request()).unwrap();
    let report = service
        .wait_for_terminal(id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Degraded);
    assert_eq!(report.progress_percent, 100);
    assert_eq!(report.chunks.total, 12);
    assert_eq!(report.chunks.completed, 10);
    assert_eq!(report.chunks.failed, 2);
    let message = report.error_message.unwrap();
    assert!(message.contains("[3, 7]"), "{message}");

    let result = durable.get(&report.result_ref.unwrap()).await.unwrap();
    assert_eq!(String::from_utf8(result).unwrap(), page_labels(&[3, 7]));

    assert_eq!(observer.completed.load(Ordering::SeqCst), 10);
    let mut errored = observer.errored.lock().clone();
    errored.sort_unstable();
    assert_eq!(errored, vec![3, 7]);
    assert_eq!(*observer.finished.lock(), vec![OperationStatus::Degraded]);
    // Unrecoverable chunks are not retried.
    assert_eq!(processor.calls(), 12);

    service.shutdown().await;
}

#[tokio::test]
async fn clean_chunked_run_combines_in_index_order() {
    // Chunks run concurrently and may settle in any order.
    let h = harness(chunking_config(), |p| p.delay(Duration::from_millis(3)));
    h.service.start().unwrap();

    let id = h.service.create_operation(twelve_chunk_request()).unwrap();
    let report = h
        .service
        .wait_for_terminal(id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Completed);
    assert!(report.error_message.is_none());
    let result = h.durable.get(&report.result_ref.unwrap()).await.unwrap();
    assert_eq!(String::from_utf8(result).unwrap(), page_labels(&[]));

    h.service.shutdown().await;
}

#[tokio::test]
async fn too_many_failures_fall_back_to_whole_document() {
    let h = harness(chunking_config(), |p| p.fail_chunks_starting_at(&[1, 11, 21, 31]));
    h.service.start().unwrap();

    let id = h.service.create_operation(twelve_chunk_request()).unwrap();
    let report = h
        .service
        .wait_for_terminal(id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Completed);
    assert_eq!(report.chunks.failed, 4);
    let result = h.durable.get(&report.result_ref.unwrap()).await.unwrap();
    assert_eq!(result, b"[whole]".to_vec());
    assert!(h.service.registry().get(id).unwrap().fallback_attempted);
    assert_eq!(h.processor.calls(), 13);

    h.service.shutdown().await;
}

#[tokio::test]
async fn failed_fallback_reports_partial_chunk_failure() {
    let h = harness(chunking_config(), |p| {
        p.fail_chunks_starting_at(&[1, 11, 21, 31])
            .fail_whole(ConversionError::UnrecoverableInput("broken xref".into()))
    });
    h.service.start().unwrap();

    let id = h.service.create_operation(twelve_chunk_request()).unwrap();
    let report = h
        .service
        .wait_for_terminal(id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Failed);
    assert_eq!(report.error_kind, Some(ErrorKind::PartialChunkFailure));
    assert!(report.result_ref.is_none());
    assert_eq!(h.processor.calls(), 13, "exactly one fallback run");

    h.service.shutdown().await;
}

// ── Retries ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn transient_errors_fail_after_max_attempts() {
    let h = harness(chunking_config(), |p| {
        p.fail_always(ConversionError::TransientIo("connection reset".into()))
    });
    h.service.start().unwrap();

    let request = ConversionRequest::new(ObjectRef::new("mem://sources/memo"), "pdf", "md")
        .estimated_input_bytes(500);
    let id = h.service.create_operation(request).unwrap();
    let report = h
        .service
        .wait_for_terminal(id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Failed);
    assert_eq!(report.error_kind, Some(ErrorKind::TransientIoError));
    assert_eq!(report.error_message.as_deref(), Some("connection reset"));
    assert_eq!(h.processor.calls(), 3);

    h.service.shutdown().await;
}

// ── Memory pressure and concurrency ─────────────────────────────────────────

#[tokio::test]
async fn emergency_band_drops_concurrency_to_one() {
    let h = harness(chunking_config(), |p| p);
    assert_eq!(h.service.get_queue_stats().max_concurrency, 4);

    h.probe.set(0.9);
    assert_eq!(h.service.sample_memory(), MemoryBand::Emergency);
    let report = h.service.tick();
    assert_eq!(report.max_concurrency, 1);

    let stats = h.service.get_queue_stats();
    assert_eq!(stats.memory_band, MemoryBand::Emergency);
    assert_eq!(stats.max_concurrency, 1);
}

#[tokio::test]
async fn active_jobs_stay_within_the_cap() {
    let config = SchedulerConfig::builder()
        .baseline_concurrency(2)
        .max_concurrency_cap(3)
        .tick_interval_ms(2)
        .build()
        .unwrap();
    let h = harness(config, |p| p.delay(Duration::from_millis(5)));
    h.service.start().unwrap();

    let ids: Vec<OperationId> = (0..24)
        .map(|i| {
            let request = ConversionRequest::new(
                ObjectRef::new(format!("mem://sources/{i}")),
                "pdf",
                "md",
            )
            .estimated_input_bytes(2_048)
            .priority(i % 3);
            h.service.create_operation(request).unwrap()
        })
        .collect();
    for id in ids {
        let report = h
            .service
            .wait_for_terminal(id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(report.status, OperationStatus::Completed);
    }

    assert!(h.processor.peak.load(Ordering::SeqCst) <= 3);
    let stats = h.service.get_queue_stats();
    assert!(stats.peak_active_jobs <= 3);
    assert_eq!(stats.active_jobs, 0);
    assert_eq!(stats.queued_jobs, 0);

    h.service.shutdown().await;
}

#[tokio::test]
async fn resource_exhaustion_keeps_concurrency_reduced() {
    let h = harness(single_tick_config(), |p| p.exhaust_first(1));
    h.service.start().unwrap();
    // Let the first periodic tick pass on an empty backlog.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.service.get_queue_stats().max_concurrency, 4);

    let id = h.service.create_operation(memo_request(0)).unwrap();
    let report = h
        .service
        .wait_for_terminal(id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Completed);
    assert_eq!(h.processor.calls(), 2, "requeued once, then converted");
    assert_eq!(h.service.get_queue_stats().max_concurrency, 3);

    h.service.shutdown().await;
}

#[tokio::test]
async fn enqueue_wakeups_do_not_grow_concurrency() {
    let h = harness(single_tick_config(), |p| p.delay(Duration::from_millis(2)));
    h.service.start().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let ids: Vec<OperationId> = (0..40)
        .map(|i| h.service.create_operation(memo_request(i)).unwrap())
        .collect();
    for id in ids {
        let report = h
            .service
            .wait_for_terminal(id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(report.status, OperationStatus::Completed);
    }

    let stats = h.service.get_queue_stats();
    assert_eq!(stats.max_concurrency, 4);
    assert!(stats.peak_active_jobs <= 4, "peak {}", stats.peak_active_jobs);
    assert!(h.processor.peak.load(Ordering::SeqCst) <= 4);

    h.service.shutdown().await;
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_before_start_runs_nothing() {
    let config = SchedulerConfig::builder()
        .chunk_size_threshold_bytes(1_000)
        .max_pages_per_chunk(2)
        .build()
        .unwrap();
    let h = harness(config, |p| p);

    let request = ConversionRequest::new(ObjectRef::new("mem://sources/deck"), "pdf", "md")
        .estimated_input_bytes(10_000)
        .page_count(10);
    let id = h.service.create_operation(request).unwrap();
    assert_eq!(h.service.get_status(id).unwrap().chunks.total, 5);
    assert_eq!(h.service.get_queue_stats().queued_jobs, 5);

    assert_eq!(h.service.cancel_operation(id).unwrap(), CancelAck::Accepted);
    let report = h.service.get_status(id).unwrap();
    assert_eq!(report.status, OperationStatus::Cancelled);
    assert!(report.result_ref.is_none());
    assert_eq!(h.service.get_queue_stats().queued_jobs, 0);

    h.service.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.processor.calls(), 0);
    assert_eq!(
        h.service.cancel_operation(id).unwrap(),
        CancelAck::AlreadyTerminal
    );
    h.service.shutdown().await;
}

#[tokio::test]
async fn cancel_during_conversion_discards_output() {
    let h = harness(chunking_config(), |p| p.gated());
    h.service.start().unwrap();

    let request = ConversionRequest::new(ObjectRef::new("mem://sources/memo"), "pdf", "md")
        .estimated_input_bytes(500);
    let id = h.service.create_operation(request).unwrap();

    let gate = h.processor.gate.as_ref().unwrap();
    gate.entered.notified().await;
    assert_eq!(h.service.cancel_operation(id).unwrap(), CancelAck::Accepted);
    assert_eq!(
        h.service.get_status(id).unwrap().status,
        OperationStatus::Cancelling
    );
    gate.release.add_permits(1);

    let report = h
        .service
        .wait_for_terminal(id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(report.status, OperationStatus::Cancelled);
    assert!(report.result_ref.is_none());
    assert_eq!(h.durable.put_count(), 0);

    h.service.shutdown().await;
}

#[tokio::test]
async fn cancel_chunked_operation_with_chunks_in_flight() {
    let config = SchedulerConfig::builder()
        .chunk_size_threshold_bytes(1_000)
        .max_pages_per_chunk(2)
        .baseline_concurrency(2)
        .max_concurrency_cap(2)
        .tick_interval_ms(5)
        .sample_interval_ms(5)
        .build()
        .unwrap();
    let h = harness(config, |p| p.gated());
    h.service.start().unwrap();

    let request = ConversionRequest::new(ObjectRef::new("mem://sources/deck"), "pdf", "md")
        .estimated_input_bytes(10_000)
        .page_count(10);
    let id = h.service.create_operation(request).unwrap();
    wait_until("two chunks converting", || {
        h.processor.running.load(Ordering::SeqCst) == 2
    })
    .await;
    let report = h.service.get_status(id).unwrap();
    assert_eq!(report.status, OperationStatus::Processing);
    assert_eq!(report.chunks.total, 5);
    assert_eq!(h.service.get_queue_stats().queued_jobs, 3);

    assert_eq!(h.service.cancel_operation(id).unwrap(), CancelAck::Accepted);
    assert_eq!(
        h.service.get_status(id).unwrap().status,
        OperationStatus::Cancelling
    );
    assert_eq!(h.service.get_queue_stats().queued_jobs, 0);

    let gate = h.processor.gate.as_ref().unwrap();
    gate.release.add_permits(2);
    let report = h
        .service
        .wait_for_terminal(id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Cancelled);
    assert!(report.result_ref.is_none());
    assert_eq!(report.chunks.completed, 0);
    assert_eq!(h.processor.calls(), 2, "queued chunks never ran");
    assert_eq!(h.durable.put_count(), 0);
    assert_eq!(h.service.get_queue_stats().active_jobs, 0);

    h.service.shutdown().await;
}

// ── Durable uploads ──────────────────────────────────────────────────────────

#[tokio::test]
async fn exhausted_primary_store_degrades_to_fallback() {
    let h = harness_with(
        outage_config(),
        |durable| OutageStore::new(durable, |_| true) as Arc<dyn ObjectStore>,
        |p| p,
    );
    h.service.start().unwrap();

    let id = h.service.create_operation(memo_request(0)).unwrap();
    let report = h
        .service
        .wait_for_terminal(id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Degraded);
    assert_eq!(report.progress_percent, 100);
    let message = report.error_message.unwrap();
    assert!(message.contains("fallback store"), "{message}");

    let result = h.fallback.get(&report.result_ref.unwrap()).await.unwrap();
    assert_eq!(result, b"[whole]".to_vec());
    assert_eq!(h.durable.put_count(), 0);
    assert_eq!(h.processor.calls(), 1);

    let uploads = h.service.upload_stats();
    assert_eq!(uploads.transfers, 2);
    assert_eq!(uploads.fallbacks, 1);
    assert_eq!(uploads.failures, 0);

    h.service.shutdown().await;
}

#[tokio::test]
async fn chunk_stored_in_fallback_is_combined() {
    // Only the first chunk's output is refused by the durable store.
    let h = harness_with(
        outage_config(),
        |durable| {
            OutageStore::new(durable, |bytes| bytes == b"[pages 1-10]".as_slice())
                as Arc<dyn ObjectStore>
        },
        |p| p,
    );
    h.service.start().unwrap();

    let id = h.service.create_operation(twelve_chunk_request()).unwrap();
    let report = h
        .service
        .wait_for_terminal(id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Completed);
    assert_eq!(report.chunks.completed, 12);
    let op = h.service.registry().get(id).unwrap();
    assert!(op.chunks[0].result_degraded);
    assert!(op.chunks[1..].iter().all(|c| !c.result_degraded));

    let result = h.durable.get(&report.result_ref.unwrap()).await.unwrap();
    assert_eq!(String::from_utf8(result).unwrap(), page_labels(&[]));
    assert_eq!(h.fallback.len(), 1);
    assert_eq!(h.service.upload_stats().fallbacks, 1);

    h.service.shutdown().await;
}

#[test]
fn repeated_upload_of_same_content_is_stored_once() {
    tokio_test::block_on(async {
        let durable = Arc::new(MemoryObjectStore::new("durable"));
        let uploads = DurableUploadManager::new(
            durable.clone(),
            Arc::new(MemoryObjectStore::new("fallback")),
            &SchedulerConfig::default(),
        );
        let op = OperationId::new();
        let bytes = b"# Chapter 1".to_vec();

        let first = uploads
            .upload(bytes.clone(), ContentKey::derive(&bytes, op, ArtifactSlot::Chunk(0)))
            .await
            .unwrap();
        let second = uploads
            .upload(bytes.clone(), ContentKey::derive(&bytes, op, ArtifactSlot::Chunk(0)))
            .await
            .unwrap();

        assert_eq!(first.reference, second.reference);
        assert!(!first.degraded);
        assert_eq!(durable.put_count(), 1);
        assert_eq!(uploads.stats().deduplicated, 1);
    });
}
