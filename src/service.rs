//! The service context: one object owning every scheduling component.
//!
//! A [`ConversionService`] is built once with [`ServiceBuilder`] and holds
//! the registry, queue, memory monitor, upload manager and coordinator.
//! Nothing is global; everything reaches its collaborators through this
//! context.
//!
//! [`ConversionService::start`] spawns two periodic tasks, memory sampling
//! and queue ticks, both owned by a `CancellationToken`. Concurrency adapts
//! once per tick; between ticks the queue's notifier triggers admission
//! passes only.
//! [`ConversionService::shutdown`] cancels them, awaits both handles and
//! then waits for in-flight jobs to settle.
//!
//! ```rust,no_run
//! use edgequake_jobs::{
//!     ConversionRequest, ConversionService, MemoryObjectStore, SchedulerConfig,
//! };
//! # use edgequake_jobs::{ConvertTask, ConversionError, JobProcessor, ObjectRef};
//! # use std::sync::Arc;
//! # struct Upper(Arc<MemoryObjectStore>);
//! # #[async_trait::async_trait]
//! # impl JobProcessor for Upper {
//! #     async fn convert(&self, _i: &ObjectRef, _t: &ConvertTask) -> Result<ObjectRef, ConversionError> {
//! #         Ok(self.0.insert(b"# done".to_vec()))
//! #     }
//! # }
//! # async fn run() -> Result<(), edgequake_jobs::JobError> {
//! let scratch = Arc::new(MemoryObjectStore::new("scratch"));
//! let sources = MemoryObjectStore::new("sources");
//! let service = ConversionService::builder(SchedulerConfig::default())
//!     .processor(Arc::new(Upper(scratch.clone())))
//!     .scratch_store(scratch)
//!     .build()?;
//! service.start()?;
//!
//! let source = sources.insert(b"%PDF-1.7".to_vec());
//! let id = service.create_operation(ConversionRequest::new(source, "pdf", "md"))?;
//! let report = service
//!     .wait_for_terminal(id, std::time::Duration::from_secs(30))
//!     .await?;
//! println!("{:?}", report.status);
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::chunking::{ConcatCombiner, PageRangeSplitter, ResultCombiner, Splitter};
use crate::config::SchedulerConfig;
use crate::coordinator::{ChunkCoordinator, CoordinatorParts};
use crate::error::JobError;
use crate::memory::{MemoryBand, MemoryMonitor, MemoryProbe, SystemMemoryProbe};
use crate::model::{CancelAck, ConversionRequest, Operation, OperationId, QueueStats, StatusReport};
use crate::processor::JobProcessor;
use crate::progress::{NoopObserver, SharedObserver};
use crate::queue::{JobExecutor, ProcessingQueue, TickReport};
use crate::registry::OperationRegistry;
use crate::store::{MemoryObjectStore, ObjectStore};
use crate::upload::{DurableUploadManager, UploadStats};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// ── Builder ─────────────────────────────────────────────────────────────────

/// Collects the collaborators of a [`ConversionService`].
///
/// Only the processor is mandatory. Stores default to in-memory ones, the
/// memory probe to [`SystemMemoryProbe`], splitting to
/// [`PageRangeSplitter`] and combining to [`ConcatCombiner`].
pub struct ServiceBuilder {
    config: SchedulerConfig,
    processor: Option<Arc<dyn JobProcessor>>,
    scratch: Option<Arc<dyn ObjectStore>>,
    primary: Option<Arc<dyn ObjectStore>>,
    fallback: Option<Arc<dyn ObjectStore>>,
    probe: Option<Arc<dyn MemoryProbe>>,
    splitter: Option<Arc<dyn Splitter>>,
    combiner: Option<Arc<dyn ResultCombiner>>,
    observer: Option<SharedObserver>,
}

impl ServiceBuilder {
    pub fn processor(mut self, processor: Arc<dyn JobProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Where the processor writes its outputs.
    pub fn scratch_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.scratch = Some(store);
        self
    }

    pub fn durable_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.primary = Some(store);
        self
    }

    /// Lower-durability store used once durable uploads are exhausted.
    pub fn fallback_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.fallback = Some(store);
        self
    }

    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn splitter(mut self, splitter: Arc<dyn Splitter>) -> Self {
        self.splitter = Some(splitter);
        self
    }

    pub fn combiner(mut self, combiner: Arc<dyn ResultCombiner>) -> Self {
        self.combiner = Some(combiner);
        self
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<ConversionService, JobError> {
        self.config.validate()?;
        let processor = self
            .processor
            .ok_or_else(|| JobError::InvalidConfig("a job processor is required".into()))?;
        let config = self.config;

        let registry = Arc::new(OperationRegistry::new());
        let queue = Arc::new(ProcessingQueue::new(&config));
        let probe = self.probe.unwrap_or_else(|| {
            Arc::new(SystemMemoryProbe::new(config.memory_limit_bytes)) as Arc<dyn MemoryProbe>
        });
        let monitor = Arc::new(MemoryMonitor::from_config(probe, &config));
        let uploads = Arc::new(DurableUploadManager::new(
            self.primary
                .unwrap_or_else(|| in_memory("durable")),
            self.fallback
                .unwrap_or_else(|| in_memory("fallback")),
            &config,
        ));

        // Wake the scheduler as soon as the band changes.
        let notify = queue.notifier();
        monitor.subscribe(move |_| notify.notify_one());

        let coordinator = Arc::new(ChunkCoordinator::new(CoordinatorParts {
            combiner: self.combiner.unwrap_or_else(|| {
                Arc::new(ConcatCombiner::new(config.chunk_separator.clone())) as Arc<dyn ResultCombiner>
            }),
            config: config.clone(),
            registry: Arc::clone(&registry),
            queue: Arc::clone(&queue),
            uploads: Arc::clone(&uploads),
            monitor: Arc::clone(&monitor),
            processor,
            scratch: self.scratch.unwrap_or_else(|| in_memory("scratch")),
            splitter: self
                .splitter
                .unwrap_or_else(|| Arc::new(PageRangeSplitter) as Arc<dyn Splitter>),
            observer: self
                .observer
                .unwrap_or_else(|| Arc::new(NoopObserver) as SharedObserver),
        }));

        Ok(ConversionService {
            config,
            registry,
            queue,
            monitor,
            uploads,
            coordinator,
            lifecycle: Mutex::new(None),
        })
    }
}

fn in_memory(name: &str) -> Arc<dyn ObjectStore> {
    Arc::new(MemoryObjectStore::new(name))
}

// ── Service ─────────────────────────────────────────────────────────────────

struct Lifecycle {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct ConversionService {
    config: SchedulerConfig,
    registry: Arc<OperationRegistry>,
    queue: Arc<ProcessingQueue>,
    monitor: Arc<MemoryMonitor>,
    uploads: Arc<DurableUploadManager>,
    coordinator: Arc<ChunkCoordinator>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl ConversionService {
    pub fn builder(config: SchedulerConfig) -> ServiceBuilder {
        ServiceBuilder {
            config,
            processor: None,
            scratch: None,
            primary: None,
            fallback: None,
            probe: None,
            splitter: None,
            combiner: None,
            observer: None,
        }
    }

    // ── Exposed API ─────────────────────────────────────────────────────────

    /// Register a conversion and queue its jobs.
    pub fn create_operation(&self, request: ConversionRequest) -> Result<OperationId, JobError> {
        let op = Operation::from_request(request);
        info!(
            "operation {} [{}]: {} -> {}, {} B, priority {}",
            op.id, op.correlation_id, op.source_format, op.target_format, op.estimated_input_bytes, op.priority
        );
        let id = self.registry.create(op);
        self.coordinator.submit(id)?;
        Ok(id)
    }

    pub fn get_status(&self, id: OperationId) -> Result<StatusReport, JobError> {
        self.coordinator.status(id)
    }

    pub fn cancel_operation(&self, id: OperationId) -> Result<CancelAck, JobError> {
        self.coordinator.cancel(id)
    }

    pub fn get_queue_stats(&self) -> QueueStats {
        self.queue.stats(self.monitor.current_band())
    }

    pub fn upload_stats(&self) -> UploadStats {
        self.uploads.stats()
    }

    /// Stream of confirmed memory bands, starting with the current one.
    pub fn band_updates(&self) -> WatchStream<MemoryBand> {
        WatchStream::new(self.monitor.band_receiver())
    }

    /// Poll until `id` is terminal or `timeout` elapses.
    pub async fn wait_for_terminal(
        &self,
        id: OperationId,
        timeout: Duration,
    ) -> Result<StatusReport, JobError> {
        let deadline = Instant::now() + timeout;
        let poll = self.config.tick_interval().clamp(Duration::from_millis(5), Duration::from_millis(100));
        loop {
            let report = self.get_status(id)?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            if Instant::now() >= deadline {
                return Err(JobError::WaitTimeout {
                    operation: id,
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            sleep(poll).await;
        }
    }

    // ── Manual driving ──────────────────────────────────────────────────────

    /// Take one memory sample now.
    pub fn sample_memory(&self) -> MemoryBand {
        self.monitor.sample()
    }

    /// Run one scheduling tick now: adapt concurrency, then admit.
    pub fn tick(&self) -> TickReport {
        let executor: Arc<dyn JobExecutor> = self.coordinator.clone();
        self.queue.tick(self.monitor.current_band(), &executor)
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    pub fn queue(&self) -> &Arc<ProcessingQueue> {
        &self.queue
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().is_some()
    }

    /// Spawn the sampling and scheduling tasks. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<(), JobError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_some() {
            return Err(JobError::Lifecycle("service already started".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| JobError::Lifecycle(format!("no tokio runtime: {e}")))?;
        let token = CancellationToken::new();

        let sampler = {
            let token = token.clone();
            let monitor = Arc::clone(&self.monitor);
            let period = self.config.sample_interval();
            runtime.spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            monitor.sample();
                        }
                    }
                }
                debug!("memory sampler stopped");
            })
        };

        let scheduler = {
            let token = token.clone();
            let queue = Arc::clone(&self.queue);
            let monitor = Arc::clone(&self.monitor);
            let executor: Arc<dyn JobExecutor> = self.coordinator.clone();
            let notify = self.queue.notifier();
            let period = self.config.tick_interval();
            runtime.spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            queue.tick(monitor.current_band(), &executor);
                        }
                        // Enqueues, freed slots and band changes only admit.
                        _ = notify.notified() => {
                            queue.admit(&executor);
                        }
                    }
                }
                debug!("scheduler stopped");
            })
        };

        info!(
            "service started (sample every {:?}, tick every {:?}, baseline concurrency {})",
            self.config.sample_interval(),
            self.config.tick_interval(),
            self.queue.baseline_concurrency()
        );
        *lifecycle = Some(Lifecycle {
            token,
            handles: vec![sampler, scheduler],
        });
        Ok(())
    }

    /// Stop the periodic tasks and wait for running jobs to settle.
    ///
    /// Queued jobs stay in the backlog; a later `start` picks them up.
    pub async fn shutdown(&self) {
        let lifecycle = self.lifecycle.lock().take();
        let Some(lifecycle) = lifecycle else {
            return;
        };
        lifecycle.token.cancel();
        for result in join_all(lifecycle.handles).await {
            if let Err(e) = result {
                debug!("lifecycle task ended abnormally: {}", e);
            }
        }
        self.queue.wait_idle().await;
        info!("service stopped");
    }
}

impl Drop for ConversionService {
    fn drop(&mut self) {
        if let Some(lifecycle) = self.lifecycle.get_mut().take() {
            lifecycle.token.cancel();
        }
    }
}
