//! Data model: operations, chunks and the reports derived from them.
//!
//! An [`Operation`] is one end-to-end conversion request. When it is too
//! large (or memory is tight) the coordinator splits it into [`Chunk`]s, each
//! covering one [`Segment`] of the source. Chunk `index` is 0-based and
//! defines recombination order; indices of one operation are contiguous and
//! unique.
//!
//! Operations are stored as immutable snapshots (`Arc<Operation>`) in the
//! [`crate::registry::OperationRegistry`]; every mutation produces a new
//! snapshot via compare-and-set, so readers always see an internally
//! consistent value.

use crate::error::ErrorKind;
use crate::memory::MemoryBand;
use crate::store::ObjectRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Scheduling priority. Higher values are admitted first.
pub type Priority = i32;

/// Opaque operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ── Operation ────────────────────────────────────────────────────────────

/// Lifecycle of an operation.
///
/// ```text
/// Queued ──▶ Processing ──▶ Completed | Degraded | Failed
///   │  ╲          │
///   │   ╲         ▼
///   │    ╲──▶ Cancelling ──▶ Cancelled
///   ▼
/// Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Processing,
    Completed,
    Degraded,
    Failed,
    Cancelling,
    Cancelled,
}

impl OperationStatus {
    /// `true` for the four states an operation can never leave.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed
                | OperationStatus::Degraded
                | OperationStatus::Failed
                | OperationStatus::Cancelled
        )
    }

    /// Forward-only transition table.
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        match self {
            Queued => matches!(next, Processing | Cancelling | Failed),
            Processing => matches!(next, Completed | Degraded | Failed | Cancelling),
            Cancelling => matches!(next, Cancelled),
            Completed | Degraded | Failed | Cancelled => false,
        }
    }
}

/// Snapshot of one conversion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub status: OperationStatus,
    /// 0–100; never decreases while the operation is processing.
    pub progress_percent: u8,
    pub priority: Priority,
    pub source_ref: ObjectRef,
    pub source_format: String,
    pub target_format: String,
    pub options: BTreeMap<String, String>,
    pub estimated_input_bytes: u64,
    pub page_count: Option<u32>,
    pub result_ref: Option<ObjectRef>,
    /// Empty for single-shot operations.
    pub chunks: Vec<Chunk>,
    /// Set once the whole-document fallback job has been submitted.
    pub fallback_attempted: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Build a fresh `Queued` operation from a request.
    pub fn from_request(request: ConversionRequest) -> Self {
        Self {
            id: OperationId::new(),
            status: OperationStatus::Queued,
            progress_percent: 0,
            priority: request.priority,
            source_ref: request.source_ref,
            source_format: request.source_format,
            target_format: request.target_format,
            options: request.options,
            estimated_input_bytes: request.estimated_input_bytes,
            page_count: request.page_count,
            result_ref: None,
            chunks: Vec::new(),
            fallback_attempted: false,
            error_kind: None,
            error_message: None,
            correlation_id: request
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_chunked(&self) -> bool {
        !self.chunks.is_empty()
    }

    pub fn completed_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count()
    }

    pub fn failed_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .count()
    }

    /// `true` once every chunk is Completed or Failed (vacuously false when unchunked).
    pub fn all_chunks_terminal(&self) -> bool {
        self.is_chunked() && self.chunks.iter().all(|c| c.status.is_terminal())
    }

    pub fn chunk(&self, index: u32) -> Option<&Chunk> {
        self.chunks.get(index as usize)
    }
}

// ── Chunk ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Failed)
    }
}

/// The part of the source a chunk covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Segment {
    /// Page range, 1-indexed and inclusive.
    Pages { first: u32, last: u32 },
    /// Byte range of the source object.
    Bytes { offset: u64, len: u64 },
}

impl Segment {
    /// Number of pages or bytes covered.
    pub fn units(&self) -> u64 {
        match *self {
            Segment::Pages { first, last } => u64::from(last.saturating_sub(first)) + 1,
            Segment::Bytes { len, .. } => len,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Pages { first, last } if first == last => write!(f, "page {first}"),
            Segment::Pages { first, last } => write!(f, "pages {first}-{last}"),
            Segment::Bytes { offset, len } => write!(f, "bytes {offset}+{len}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub operation_id: OperationId,
    pub segment: Segment,
    pub status: ChunkStatus,
    pub result_ref: Option<ObjectRef>,
    /// The result lives in the fallback store rather than the durable one.
    pub result_degraded: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl Chunk {
    pub fn new(operation_id: OperationId, index: u32, segment: Segment) -> Self {
        Self {
            index,
            operation_id,
            segment,
            status: ChunkStatus::Queued,
            result_ref: None,
            result_degraded: false,
            attempts: 0,
            last_error: None,
        }
    }
}

// ── Requests & reports ───────────────────────────────────────────────────

/// Input to `create_operation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub source_ref: ObjectRef,
    pub source_format: String,
    pub target_format: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: Priority,
    /// Size of the source in bytes, used by the chunking decision.
    #[serde(default)]
    pub estimated_input_bytes: u64,
    /// Page count when the source format is paginated.
    #[serde(default)]
    pub page_count: Option<u32>,
    /// Caller-supplied trace id; generated when absent.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ConversionRequest {
    pub fn new(
        source_ref: ObjectRef,
        source_format: impl Into<String>,
        target_format: impl Into<String>,
    ) -> Self {
        Self {
            source_ref,
            source_format: source_format.into(),
            target_format: target_format.into(),
            options: BTreeMap::new(),
            priority: 0,
            estimated_input_bytes: 0,
            page_count: None,
            correlation_id: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn estimated_input_bytes(mut self, bytes: u64) -> Self {
        self.estimated_input_bytes = bytes;
        self
    }

    pub fn page_count(mut self, pages: u32) -> Self {
        self.page_count = Some(pages);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// What `get_status` returns to the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    pub progress_percent: u8,
    pub chunks: ChunkCounts,
    /// `None` until at least one unit of work has finished.
    pub estimated_time_remaining_ms: Option<u64>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub result_ref: Option<ObjectRef>,
}

impl StatusReport {
    pub fn from_operation(op: &Operation, estimated_time_remaining_ms: Option<u64>) -> Self {
        Self {
            operation_id: op.id,
            status: op.status,
            progress_percent: op.progress_percent,
            chunks: ChunkCounts {
                total: op.chunks.len(),
                completed: op.completed_chunks(),
                failed: op.failed_chunks(),
            },
            estimated_time_remaining_ms: if op.status.is_terminal() {
                Some(0)
            } else {
                estimated_time_remaining_ms
            },
            error_kind: op.error_kind,
            error_message: op.error_message.clone(),
            result_ref: op.result_ref.clone(),
        }
    }
}

/// What `get_queue_stats` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued_jobs: usize,
    pub active_jobs: usize,
    pub max_concurrency: usize,
    pub memory_band: MemoryBand,
    /// Highest `active_jobs` observed since the queue was created.
    pub peak_active_jobs: usize,
    /// Sum of resource estimates of the active jobs.
    pub reserved_memory_bytes: u64,
}

/// Answer to `cancel_operation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAck {
    /// The operation is now Cancelling or Cancelled.
    Accepted,
    /// The operation had already finished; nothing changed.
    AlreadyTerminal,
}
