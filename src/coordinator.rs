//! Chunk coordinator: plans operations, runs their jobs and finalises them.
//!
//! [`ChunkCoordinator::submit`] decides between a single whole-document job
//! and a set of chunk jobs. As the queue's [`JobExecutor`] it then runs each
//! admitted job: convert into the scratch store, read the output back and
//! persist it through the [`DurableUploadManager`]. Results are committed in
//! [`JobExecutor::settle`], never in `execute`, so a job that loses a race
//! with cancellation commits nothing.
//!
//! Once every chunk of an operation is terminal the combine policy runs:
//!
//! | failed / total          | outcome |
//! |-------------------------|---------|
//! | 0                       | combine all, `Completed` |
//! | `<= failure_tolerance`  | combine the rest, `Degraded`, missing indices in `error_message` |
//! | `> failure_tolerance`   | one whole-document fallback job; if it fails, `Failed` / `PartialChunkFailure` |
//!
//! Cancellation is cooperative: jobs check the operation status before and
//! after conversion, and whoever observes the operation idle while
//! `Cancelling` moves it to `Cancelled`.

use crate::chunking::{resource_estimate, should_chunk, ResultCombiner, Splitter};
use crate::config::SchedulerConfig;
use crate::error::{ConversionError, ErrorKind, JobError};
use crate::memory::MemoryMonitor;
use crate::model::{
    CancelAck, Chunk, ChunkStatus, Operation, OperationId, OperationStatus, Segment, StatusReport,
};
use crate::processor::{ConvertTask, JobProcessor};
use crate::progress::SharedObserver;
use crate::queue::{Job, JobExecutor, JobId, JobOutcome, JobPurpose, ProcessingQueue, Resolution};
use crate::registry::{FieldValue, OperationRegistry};
use crate::store::{ObjectRef, ObjectStore};
use crate::upload::{ArtifactSlot, ContentKey, DurableUploadManager, UploadReceipt};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a single run of a job ended when the processor did not fail.
enum Attempt {
    Stored(UploadReceipt),
    Abandoned,
}

/// Completed-unit durations of one operation, for the ETA.
#[derive(Debug, Clone, Copy, Default)]
struct UnitTimings {
    finished: u32,
    total: Duration,
}

/// Everything the coordinator collaborates with.
pub struct CoordinatorParts {
    pub config: SchedulerConfig,
    pub registry: Arc<OperationRegistry>,
    pub queue: Arc<ProcessingQueue>,
    pub uploads: Arc<DurableUploadManager>,
    pub monitor: Arc<MemoryMonitor>,
    pub processor: Arc<dyn JobProcessor>,
    pub scratch: Arc<dyn ObjectStore>,
    pub splitter: Arc<dyn Splitter>,
    pub combiner: Arc<dyn ResultCombiner>,
    pub observer: SharedObserver,
}

pub struct ChunkCoordinator {
    config: SchedulerConfig,
    registry: Arc<OperationRegistry>,
    queue: Arc<ProcessingQueue>,
    uploads: Arc<DurableUploadManager>,
    monitor: Arc<MemoryMonitor>,
    processor: Arc<dyn JobProcessor>,
    scratch: Arc<dyn ObjectStore>,
    splitter: Arc<dyn Splitter>,
    combiner: Arc<dyn ResultCombiner>,
    observer: SharedObserver,
    /// Receipts produced by `execute`, committed by `settle`.
    outputs: DashMap<JobId, UploadReceipt>,
    timings: DashMap<OperationId, UnitTimings>,
}

impl ChunkCoordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        Self {
            config: parts.config,
            registry: parts.registry,
            queue: parts.queue,
            uploads: parts.uploads,
            monitor: parts.monitor,
            processor: parts.processor,
            scratch: parts.scratch,
            splitter: parts.splitter,
            combiner: parts.combiner,
            observer: parts.observer,
            outputs: DashMap::new(),
            timings: DashMap::new(),
        }
    }

    // ── Planning ────────────────────────────────────────────────────────────

    /// Plan a freshly created operation and put its jobs on the queue.
    pub fn submit(&self, id: OperationId) -> Result<usize, JobError> {
        let op = self.registry.get(id).ok_or(JobError::OperationNotFound(id))?;
        let band = self.monitor.current_band();

        let segments = match should_chunk(&op, band, &self.config) {
            None => Vec::new(),
            Some(reason) => match self.splitter.split(&op, &self.config) {
                Ok(segments) if segments.len() > 1 => {
                    info!(
                        "operation {} [{}]: {} chunks ({})",
                        op.id,
                        op.correlation_id,
                        segments.len(),
                        reason
                    );
                    segments
                }
                Ok(_) => Vec::new(),
                Err(e) => {
                    warn!(
                        "operation {} [{}]: split failed, converting whole document: {}",
                        op.id, op.correlation_id, e
                    );
                    Vec::new()
                }
            },
        };

        if segments.is_empty() {
            let estimate = resource_estimate(op.estimated_input_bytes, &op.target_format, &self.config);
            self.queue
                .enqueue(Job::whole_document(op.id, op.priority, estimate));
            self.observer.on_operation_start(op.id, 1);
            return Ok(1);
        }

        let total = segments.len();
        for (index, segment) in segments.into_iter().enumerate() {
            let index = index as u32;
            self.registry
                .append_chunk(op.id, Chunk::new(op.id, index, segment))?;
            let estimate = resource_estimate(segment_bytes(&op, &segment), &op.target_format, &self.config);
            self.queue
                .enqueue(Job::chunk(op.id, index, op.priority, estimate));
        }
        self.observer.on_operation_start(op.id, total);
        Ok(total)
    }

    // ── Status ──────────────────────────────────────────────────────────────

    pub fn status(&self, id: OperationId) -> Result<StatusReport, JobError> {
        let op = self.registry.get(id).ok_or(JobError::OperationNotFound(id))?;
        Ok(StatusReport::from_operation(&op, self.estimate_remaining_ms(&op)))
    }

    /// Mean unit duration × remaining units ÷ current concurrency.
    fn estimate_remaining_ms(&self, op: &Operation) -> Option<u64> {
        let timings = self.timings.get(&op.id).map(|t| *t.value())?;
        if timings.finished == 0 {
            return None;
        }
        let total_units = op.chunks.len().max(1) as u64;
        let done = if op.is_chunked() {
            (op.completed_chunks() + op.failed_chunks()) as u64
        } else {
            u64::from(timings.finished).min(1)
        };
        let remaining = total_units.saturating_sub(done);
        let mean_ms = timings.total.as_millis() as u64 / u64::from(timings.finished);
        let slots = self.queue.max_concurrency().max(1) as u64;
        Some(mean_ms.saturating_mul(remaining).div_ceil(slots))
    }

    fn record_unit_time(&self, id: OperationId, elapsed: Duration) {
        let mut entry = self.timings.entry(id).or_default();
        entry.finished += 1;
        entry.total += elapsed;
    }

    // ── Cancellation ────────────────────────────────────────────────────────

    /// Mark an operation Cancelling, drop its queued jobs and finish it if
    /// nothing of it is still running.
    pub fn cancel(&self, id: OperationId) -> Result<CancelAck, JobError> {
        let (op, changed) = self.registry.update(id, |op| {
            if op.status.is_terminal() || op.status == OperationStatus::Cancelling {
                return false;
            }
            op.status = OperationStatus::Cancelling;
            true
        })?;
        if op.status.is_terminal() {
            return Ok(CancelAck::AlreadyTerminal);
        }

        let purged = self.queue.purge_operation(id);
        if changed {
            info!(
                "operation {} [{}]: cancelling, {} queued jobs removed",
                id, op.correlation_id, purged
            );
        }
        self.finish_cancel_if_idle(id);
        Ok(CancelAck::Accepted)
    }

    fn finish_cancel_if_idle(&self, id: OperationId) {
        if self.queue.has_work_for(id) {
            return;
        }
        match self.registry.update_field(
            id,
            FieldValue::Status(OperationStatus::Cancelling),
            FieldValue::Status(OperationStatus::Cancelled),
        ) {
            Ok(true) => {
                info!("operation {}: cancelled", id);
                self.timings.remove(&id);
                self.observer.on_operation_finished(id, OperationStatus::Cancelled);
            }
            Ok(false) => {}
            Err(e) => warn!("operation {}: could not finish cancellation: {}", id, e),
        }
    }

    fn is_abandoned(&self, id: OperationId) -> bool {
        self.registry
            .get(id)
            .is_none_or(|op| op.status == OperationStatus::Cancelling || op.status.is_terminal())
    }

    // ── Execution ───────────────────────────────────────────────────────────

    async fn run(&self, job: &Job, op: &Operation) -> Result<Attempt, ConversionError> {
        let segment = match job.chunk_index {
            Some(index) => Some(
                op.chunk(index)
                    .map(|c| c.segment)
                    .ok_or_else(|| ConversionError::UnrecoverableInput(format!("no chunk {index}")))?,
            ),
            None => None,
        };
        let task = ConvertTask::for_operation(op, segment, job.attempts + 1);
        debug!(
            "{} converting operation {} [{}] {}",
            job.id,
            op.id,
            op.correlation_id,
            segment.map_or_else(|| "whole document".to_string(), |s| s.to_string())
        );

        let scratch_ref = self.processor.convert(&op.source_ref, &task).await?;

        // Boundary: do not persist work for a cancelled operation.
        if self.is_abandoned(op.id) {
            return Ok(Attempt::Abandoned);
        }

        let bytes = self
            .scratch
            .get(&scratch_ref)
            .await
            .map_err(|e| ConversionError::TransientIo(format!("reading scratch output: {e}")))?;
        let slot = match job.chunk_index {
            Some(index) => ArtifactSlot::Chunk(index),
            None => ArtifactSlot::Final,
        };
        let key = ContentKey::derive(&bytes, op.id, slot);
        self.uploads
            .upload(bytes, key)
            .await
            .map(Attempt::Stored)
            .map_err(|e| ConversionError::TransientIo(e.to_string()))
    }

    // ── Settling ────────────────────────────────────────────────────────────

    async fn settle_chunk(&self, job: &Job, index: u32, resolution: Resolution) {
        let id = job.operation_id;
        let attempts = job.attempts.max(1);
        let applied = match &resolution {
            Resolution::Completed => {
                let Some((_, receipt)) = self.outputs.remove(&job.id) else {
                    warn!("{}: completed without an output", job.id);
                    return;
                };
                self.commit_chunk(id, index, |c| {
                    c.status = ChunkStatus::Completed;
                    c.result_ref = Some(receipt.reference.clone());
                    c.result_degraded = receipt.degraded;
                    c.attempts = attempts;
                    c.last_error = None;
                })
            }
            Resolution::Failed(err) => {
                warn!("operation {}: chunk {} failed: {}", id, index, err);
                self.commit_chunk(id, index, |c| {
                    c.status = ChunkStatus::Failed;
                    c.attempts = attempts;
                    c.last_error = Some(err.to_string());
                })
            }
            Resolution::Cancelled => None,
        };

        let Some(snapshot) = applied else {
            return;
        };
        match &resolution {
            Resolution::Completed => {
                self.observer
                    .on_chunk_complete(id, index, snapshot.chunks.len())
            }
            Resolution::Failed(err) => self.observer.on_chunk_error(id, index, err),
            Resolution::Cancelled => {}
        }
        self.bump_progress(id);

        if snapshot.all_chunks_terminal() {
            self.combine(snapshot).await;
        }
    }

    /// Move a chunk to a terminal status from Active (or Queued when it
    /// failed before being marked Active).
    fn commit_chunk(
        &self,
        id: OperationId,
        index: u32,
        f: impl Fn(&mut Chunk),
    ) -> Option<Arc<Operation>> {
        for expected in [ChunkStatus::Active, ChunkStatus::Queued] {
            match self.registry.update_chunk(id, index, expected, &f) {
                Ok(Some(snapshot)) => return Some(snapshot),
                Ok(None) => continue,
                Err(e) => {
                    warn!("operation {}: chunk {} not committed: {}", id, index, e);
                    return None;
                }
            }
        }
        None
    }

    fn bump_progress(&self, id: OperationId) {
        let result = self.registry.update(id, |op| {
            if op.status != OperationStatus::Processing || !op.is_chunked() {
                return;
            }
            let done = op.completed_chunks() + op.failed_chunks();
            let pct = (done * 100 / op.chunks.len()).min(99);
            op.progress_percent = op.progress_percent.max(pct as u8);
        });
        if let Err(e) = result {
            debug!("operation {}: progress not updated: {}", id, e);
        }
    }

    async fn combine(&self, op: Arc<Operation>) {
        let total = op.chunks.len();
        let failed: Vec<u32> = op
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .map(|c| c.index)
            .collect();
        let ratio = failed.len() as f64 / total as f64;
        let succeeded = total - failed.len();

        if succeeded == 0 || ratio > self.config.failure_tolerance {
            self.start_fallback(&op, &failed).await;
            return;
        }

        let mut parts = Vec::with_capacity(succeeded);
        for chunk in op.chunks.iter().filter(|c| c.status == ChunkStatus::Completed) {
            let Some(reference) = &chunk.result_ref else {
                continue;
            };
            match self.uploads.fetch(reference, chunk.result_degraded).await {
                Ok(bytes) => parts.push((chunk.index, bytes)),
                Err(e) => {
                    self.fail(
                        op.id,
                        ErrorKind::TransientIoError,
                        format!("could not read chunk {}: {}", chunk.index, e),
                    );
                    return;
                }
            }
        }

        let combined = self.combiner.combine(parts);
        let key = ContentKey::derive(&combined, op.id, ArtifactSlot::Final);
        let receipt = match self.uploads.upload(combined, key).await {
            Ok(r) => r,
            Err(e) => {
                self.fail(op.id, ErrorKind::TransientIoError, e.to_string());
                return;
            }
        };

        let mut warnings = Vec::new();
        if !failed.is_empty() {
            warnings.push(format!(
                "chunks {:?} of {} failed; the result omits them",
                failed, total
            ));
        }
        if receipt.degraded {
            warnings.push(DEGRADED_STORE.to_string());
        }
        self.complete(op.id, receipt.reference, warnings);
    }

    async fn start_fallback(&self, op: &Operation, failed: &[u32]) {
        let won = self.registry.update_field(
            op.id,
            FieldValue::FallbackAttempted(false),
            FieldValue::FallbackAttempted(true),
        );
        if !matches!(won, Ok(true)) {
            self.fail(
                op.id,
                ErrorKind::PartialChunkFailure,
                format!("{} of {} chunks failed", failed.len(), op.chunks.len()),
            );
            return;
        }
        if self.is_abandoned(op.id) {
            self.finish_cancel_if_idle(op.id);
            return;
        }

        warn!(
            "operation {} [{}]: {} of {} chunks failed, falling back to whole document",
            op.id,
            op.correlation_id,
            failed.len(),
            op.chunks.len()
        );
        let estimate = resource_estimate(op.estimated_input_bytes, &op.target_format, &self.config);
        self.queue.enqueue(
            Job::whole_document(op.id, op.priority, estimate).with_purpose(JobPurpose::Fallback),
        );
    }

    fn settle_whole(&self, job: &Job, resolution: Resolution) {
        let id = job.operation_id;
        match resolution {
            Resolution::Completed => {
                let Some((_, receipt)) = self.outputs.remove(&job.id) else {
                    warn!("{}: completed without an output", job.id);
                    return;
                };
                let warnings = if receipt.degraded {
                    vec![DEGRADED_STORE.to_string()]
                } else {
                    Vec::new()
                };
                self.complete(id, receipt.reference, warnings);
            }
            Resolution::Failed(err) => match job.purpose {
                JobPurpose::Primary => self.fail(id, err.kind(), err.detail().to_string()),
                JobPurpose::Fallback => self.fail(
                    id,
                    ErrorKind::PartialChunkFailure,
                    format!("too many chunks failed and the whole-document fallback failed: {err}"),
                ),
            },
            Resolution::Cancelled => {}
        }
    }

    // ── Finalisation ────────────────────────────────────────────────────────

    fn complete(&self, id: OperationId, result: ObjectRef, warnings: Vec<String>) {
        let status = if warnings.is_empty() {
            OperationStatus::Completed
        } else {
            OperationStatus::Degraded
        };
        let message = (!warnings.is_empty()).then(|| warnings.join("; "));
        self.finalize(id, status, |op| {
            op.result_ref = Some(result);
            op.progress_percent = 100;
            op.error_message = message;
        });
    }

    fn fail(&self, id: OperationId, kind: ErrorKind, message: String) {
        self.finalize(id, OperationStatus::Failed, |op| {
            op.error_kind = Some(kind);
            op.error_message = Some(message);
        });
    }

    fn finalize(&self, id: OperationId, status: OperationStatus, f: impl FnOnce(&mut Operation)) {
        let result = self.registry.update(id, |op| {
            if op.status.is_terminal() || op.status == OperationStatus::Cancelling {
                return false;
            }
            op.status = status;
            f(op);
            true
        });
        match result {
            Ok((op, true)) => {
                match status {
                    OperationStatus::Completed => {
                        info!("operation {} [{}]: completed", id, op.correlation_id)
                    }
                    _ => warn!(
                        "operation {} [{}]: {:?}: {}",
                        id,
                        op.correlation_id,
                        status,
                        op.error_message.as_deref().unwrap_or("")
                    ),
                }
                self.timings.remove(&id);
                self.observer.on_operation_finished(id, status);
            }
            Ok((_, false)) => self.finish_cancel_if_idle(id),
            Err(e) => warn!("operation {}: not finalised: {}", id, e),
        }
    }
}

const DEGRADED_STORE: &str = "result stored in the fallback store";

#[async_trait]
impl JobExecutor for ChunkCoordinator {
    async fn execute(&self, job: &Job) -> JobOutcome {
        let id = job.operation_id;
        let Ok((op, live)) = self.registry.update(id, |op| {
            match op.status {
                OperationStatus::Queued => {
                    op.status = OperationStatus::Processing;
                    true
                }
                OperationStatus::Processing => true,
                _ => false,
            }
        }) else {
            return JobOutcome::Cancelled;
        };
        if !live {
            return JobOutcome::Cancelled;
        }

        if let Some(index) = job.chunk_index {
            let attempts = job.attempts + 1;
            let marked = self.registry.update_chunk(id, index, ChunkStatus::Queued, |c| {
                c.status = ChunkStatus::Active;
                c.attempts = attempts;
            });
            match marked {
                Ok(Some(_)) => {}
                Ok(None) => debug!("operation {}: chunk {} was not queued when started", id, index),
                Err(e) => debug!("operation {}: chunk {} not marked active: {}", id, index, e),
            }
        }

        let started = Instant::now();
        match self.run(job, &op).await {
            Ok(Attempt::Stored(receipt)) if !self.is_abandoned(id) => {
                self.record_unit_time(id, started.elapsed());
                self.outputs.insert(job.id, receipt);
                JobOutcome::Succeeded
            }
            Ok(_) => JobOutcome::Cancelled,
            Err(_) if self.is_abandoned(id) => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed(e),
        }
    }

    async fn settle(&self, job: &Job, resolution: Resolution) {
        let id = job.operation_id;
        if self.is_abandoned(id) {
            self.outputs.remove(&job.id);
            self.finish_cancel_if_idle(id);
            return;
        }
        match job.chunk_index {
            Some(index) => self.settle_chunk(job, index, resolution).await,
            None => self.settle_whole(job, resolution),
        }
    }

    fn requeued(&self, job: &Job) {
        if let (Some(index), Some(err)) = (job.chunk_index, &job.last_error) {
            let id = job.operation_id;
            let message = err.to_string();
            let reset = self.registry.update_chunk(id, index, ChunkStatus::Active, |c| {
                c.status = ChunkStatus::Queued;
                c.last_error = Some(message);
            });
            match reset {
                Ok(Some(_)) => {}
                Ok(None) => debug!("operation {}: requeued chunk {} was not active", id, index),
                Err(e) => debug!("operation {}: chunk {} not reset to queued: {}", id, index, e),
            }
        }
    }
}

/// Source bytes covered by `segment`.
fn segment_bytes(op: &Operation, segment: &Segment) -> u64 {
    match *segment {
        Segment::Bytes { len, .. } => len,
        Segment::Pages { .. } => match op.page_count {
            Some(pages) if pages > 0 => {
                op.estimated_input_bytes.saturating_mul(segment.units()) / u64::from(pages)
            }
            _ => op.estimated_input_bytes,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{ConcatCombiner, PageRangeSplitter};
    use crate::memory::{ManualMemoryProbe, MemoryBand};
    use crate::model::ConversionRequest;
    use crate::progress::NoopObserver;
    use crate::store::MemoryObjectStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EchoProcessor {
        scratch: Arc<MemoryObjectStore>,
    }

    #[async_trait]
    impl JobProcessor for EchoProcessor {
        async fn convert(
            &self,
            _input: &ObjectRef,
            task: &ConvertTask,
        ) -> Result<ObjectRef, ConversionError> {
            let text = task
                .segment
                .map_or_else(|| "whole".to_string(), |s| s.to_string());
            Ok(self.scratch.insert(text.into_bytes()))
        }
    }

    /// Fails its first call with `ResourceExhausted`, then writes "ok".
    struct ExhaustedOnce {
        scratch: Arc<MemoryObjectStore>,
        tripped: AtomicBool,
    }

    #[async_trait]
    impl JobProcessor for ExhaustedOnce {
        async fn convert(
            &self,
            _input: &ObjectRef,
            _task: &ConvertTask,
        ) -> Result<ObjectRef, ConversionError> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(ConversionError::ResourceExhausted("oom".into()));
            }
            Ok(self.scratch.insert(b"ok".to_vec()))
        }
    }

    type Parts = (Arc<ChunkCoordinator>, Arc<OperationRegistry>, Arc<ProcessingQueue>);

    fn coordinator(config: SchedulerConfig) -> Parts {
        coordinator_with(config, |scratch| Arc::new(EchoProcessor { scratch }) as Arc<dyn JobProcessor>)
    }

    fn coordinator_with(
        config: SchedulerConfig,
        processor: impl FnOnce(Arc<MemoryObjectStore>) -> Arc<dyn JobProcessor>,
    ) -> Parts {
        let registry = Arc::new(OperationRegistry::new());
        let queue = Arc::new(ProcessingQueue::new(&config));
        let scratch = Arc::new(MemoryObjectStore::new("scratch"));
        let uploads = Arc::new(DurableUploadManager::new(
            Arc::new(MemoryObjectStore::new("durable")),
            Arc::new(MemoryObjectStore::new("fallback")),
            &config,
        ));
        let monitor = Arc::new(MemoryMonitor::from_config(
            Arc::new(ManualMemoryProbe::new(0.1)),
            &config,
        ));
        let coordinator = Arc::new(ChunkCoordinator::new(CoordinatorParts {
            combiner: Arc::new(ConcatCombiner::new(config.chunk_separator.clone())),
            config,
            registry: Arc::clone(&registry),
            queue: Arc::clone(&queue),
            uploads,
            monitor,
            processor: processor(Arc::clone(&scratch)),
            scratch,
            splitter: Arc::new(PageRangeSplitter),
            observer: Arc::new(NoopObserver),
        }));
        (coordinator, registry, queue)
    }

    fn create(registry: &OperationRegistry, bytes: u64, pages: Option<u32>) -> OperationId {
        let mut req = ConversionRequest::new(ObjectRef::new("mem://src/0"), "pdf", "md")
            .estimated_input_bytes(bytes);
        if let Some(p) = pages {
            req = req.page_count(p);
        }
        registry.create(Operation::from_request(req))
    }

    #[test]
    fn small_operation_is_not_chunked() {
        let (coord, registry, queue) = coordinator(SchedulerConfig::default());
        let id = create(&registry, 1024, Some(3));
        assert_eq!(coord.submit(id).unwrap(), 1);
        assert!(!registry.get(id).unwrap().is_chunked());
        assert_eq!(queue.backlog_len(), 1);
    }

    #[test]
    fn large_operation_is_chunked_contiguously() {
        let config = SchedulerConfig::builder()
            .chunk_size_threshold_bytes(1_000)
            .max_pages_per_chunk(10)
            .build()
            .unwrap();
        let (coord, registry, queue) = coordinator(config);
        let id = create(&registry, 10_000, Some(35));
        assert_eq!(coord.submit(id).unwrap(), 4);

        let op = registry.get(id).unwrap();
        let indices: Vec<u32> = op.chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(op.chunks[3].segment, Segment::Pages { first: 31, last: 35 });
        assert_eq!(queue.backlog_len(), 4);
    }

    #[test]
    fn failed_split_falls_back_to_whole_document() {
        let config = SchedulerConfig::builder()
            .chunk_size_threshold_bytes(1_000)
            .build()
            .unwrap();
        let (coord, registry, queue) = coordinator(config);
        // Page count 0 cannot be split.
        let id = create(&registry, 10_000, Some(0));
        assert_eq!(coord.submit(id).unwrap(), 1);
        assert!(!registry.get(id).unwrap().is_chunked());
        assert_eq!(queue.backlog_len(), 1);
    }

    #[test]
    fn cancelling_idle_operation_is_immediate() {
        let (coord, registry, queue) = coordinator(SchedulerConfig::default());
        let id = create(&registry, 1024, None);
        coord.submit(id).unwrap();
        assert_eq!(coord.cancel(id).unwrap(), CancelAck::Accepted);
        assert_eq!(registry.get(id).unwrap().status, OperationStatus::Cancelled);
        assert_eq!(queue.backlog_len(), 0);
        assert_eq!(coord.cancel(id).unwrap(), CancelAck::AlreadyTerminal);
    }

    #[tokio::test]
    async fn whole_document_runs_to_completion() {
        let (coord, registry, queue) = coordinator(SchedulerConfig::default());
        let id = create(&registry, 1024, None);
        coord.submit(id).unwrap();

        let exec: Arc<dyn JobExecutor> = coord.clone();
        queue.tick(MemoryBand::Normal, &exec);
        queue.wait_idle().await;

        let report = coord.status(id).unwrap();
        assert_eq!(report.status, OperationStatus::Completed);
        assert_eq!(report.progress_percent, 100);
        assert_eq!(report.estimated_time_remaining_ms, Some(0));
        assert!(report.result_ref.is_some());
    }

    #[tokio::test]
    async fn resource_exhausted_chunk_goes_back_to_queued() {
        let config = SchedulerConfig::builder()
            .chunk_size_threshold_bytes(1_000)
            .max_pages_per_chunk(10)
            .build()
            .unwrap();
        let (coord, registry, queue) = coordinator_with(config, |scratch| {
            Arc::new(ExhaustedOnce {
                scratch,
                tripped: AtomicBool::new(false),
            }) as Arc<dyn JobProcessor>
        });
        let id = create(&registry, 10_000, Some(20));
        assert_eq!(coord.submit(id).unwrap(), 2);

        let exec: Arc<dyn JobExecutor> = coord.clone();
        queue.tick(MemoryBand::Normal, &exec);
        queue.wait_idle().await;

        let op = registry.get(id).unwrap();
        let queued: Vec<&Chunk> = op
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Queued)
            .collect();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].last_error.as_deref().unwrap().contains("oom"));
        assert_eq!(op.completed_chunks(), 1);
        assert_eq!(queue.backlog_len(), 1);

        queue.tick(MemoryBand::Normal, &exec);
        queue.wait_idle().await;
        assert_eq!(coord.status(id).unwrap().status, OperationStatus::Completed);
    }

    #[test]
    fn segment_bytes_prorates_pages() {
        let registry = OperationRegistry::new();
        let id = create(&registry, 1_000, Some(10));
        let op = registry.get(id).unwrap();
        assert_eq!(segment_bytes(&op, &Segment::Pages { first: 1, last: 3 }), 300);
        assert_eq!(segment_bytes(&op, &Segment::Bytes { offset: 0, len: 42 }), 42);
    }
}
