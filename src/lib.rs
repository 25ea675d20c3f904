//! # edgequake-jobs
//!
//! Memory-aware job scheduling for document conversion services.
//!
//! Converting documents on a memory-limited host fails in boring ways: too
//! many large conversions start at once and the process is killed, one
//! corrupt page sinks a 300-page job, or an artifact vanishes with the
//! container that produced it. This crate is the scheduling core that keeps
//! those failures contained. The conversion itself is pluggable through
//! [`JobProcessor`].
//!
//! ## Overview
//!
//! ```text
//! create_operation
//!  │
//!  ├─ ChunkCoordinator   whole document, or split into page/byte chunks
//!  ├─ ProcessingQueue    priority backlog, adaptive max concurrency,
//!  │                     memory budget, skip-not-block admission
//!  │    ▲
//!  │    └─ MemoryMonitor Normal / Warning / Critical / Emergency bands
//!  ├─ JobProcessor       your conversion, output to a scratch store
//!  ├─ DurableUploadMgr   content-addressed, retried, fallback store
//!  └─ ChunkCoordinator   combine in index order, Completed / Degraded / Failed
//! ```
//!
//! All shared state lives in [`OperationRegistry`], which only accepts
//! compare-and-set updates. [`ConversionService`] owns every component and
//! the two periodic tasks (memory sampling, admission ticks).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_jobs::{
//!     ConversionError, ConversionRequest, ConversionService, ConvertTask, JobProcessor,
//!     MemoryObjectStore, ObjectRef, SchedulerConfig,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Shout(Arc<MemoryObjectStore>);
//!
//! #[async_trait::async_trait]
//! impl JobProcessor for Shout {
//!     async fn convert(&self, _input: &ObjectRef, task: &ConvertTask)
//!         -> Result<ObjectRef, ConversionError>
//!     {
//!         Ok(self.0.insert(format!("converted to {}", task.target_format).into_bytes()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scratch = Arc::new(MemoryObjectStore::new("scratch"));
//!     let service = ConversionService::builder(SchedulerConfig::default())
//!         .processor(Arc::new(Shout(scratch.clone())))
//!         .scratch_store(scratch)
//!         .build()?;
//!     service.start()?;
//!
//!     let id = service.create_operation(
//!         ConversionRequest::new(ObjectRef::new("s3://in/report.pdf"), "pdf", "md")
//!             .estimated_input_bytes(48 << 20)
//!             .page_count(320),
//!     )?;
//!     let report = service.wait_for_terminal(id, Duration::from_secs(60)).await?;
//!     println!("{:?} {}%", report.status, report.progress_percent);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `jobsim` load simulator (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-jobs = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod chunking;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod model;
pub mod processor;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod service;
pub mod store;
pub mod upload;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use chunking::{
    ChunkReason, ConcatCombiner, PageRangeSplitter, ResultCombiner, SplitError, Splitter,
};
pub use config::{ChunkSeparator, SchedulerConfig, SchedulerConfigBuilder};
pub use coordinator::ChunkCoordinator;
pub use error::{ConversionError, ErrorKind, JobError};
pub use memory::{
    BandThresholds, BandTransition, ManualMemoryProbe, MemoryBand, MemoryMonitor, MemoryProbe,
    Reclaimer, SystemMemoryProbe,
};
pub use model::{
    CancelAck, Chunk, ChunkCounts, ChunkStatus, ConversionRequest, Operation, OperationId,
    OperationStatus, Priority, QueueStats, Segment, StatusReport,
};
pub use processor::{ConvertTask, JobProcessor};
pub use progress::{NoopObserver, OperationObserver, SharedObserver};
pub use queue::{
    Job, JobExecutor, JobId, JobOutcome, JobPurpose, JobState, ProcessingQueue, Resolution,
    TickReport,
};
pub use registry::{FieldValue, OperationRegistry};
pub use retry::Backoff;
pub use service::{ConversionService, ServiceBuilder};
pub use store::{LocalDirStore, MemoryObjectStore, ObjectRef, ObjectStore};
pub use upload::{ArtifactSlot, ContentKey, DurableUploadManager, UploadReceipt, UploadStats};
