//! Observer trait for per-operation scheduling events.
//!
//! Inject an [`Arc<dyn OperationObserver>`] via
//! [`crate::service::ServiceBuilder::with_observer`] to receive events as
//! operations are planned, as their chunks settle and when they finish.
//! Forward them to a channel, a database row or a progress bar; the
//! scheduler does not care.
//!
//! # Example
//!
//! ```rust
//! use edgequake_jobs::{OperationId, OperationObserver};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingObserver {
//!     chunks_done: AtomicUsize,
//! }
//!
//! impl OperationObserver for CountingObserver {
//!     fn on_chunk_complete(&self, operation: OperationId, index: u32, total_chunks: usize) {
//!         let done = self.chunks_done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{}: chunk {} done ({}/{})", operation, index, done, total_chunks);
//!     }
//! }
//! ```

use crate::error::ConversionError;
use crate::model::{OperationId, OperationStatus};
use std::sync::Arc;

/// Called by the chunk coordinator as operations move through the queue.
///
/// Chunks of one operation settle on different tasks, so `on_chunk_complete`
/// and `on_chunk_error` may run concurrently. All methods default to no-ops.
pub trait OperationObserver: Send + Sync {
    /// Called once the execution plan is known.
    ///
    /// # Arguments
    /// * `operation`: the operation being planned
    /// * `total_units`: number of chunks, or 1 for a whole-document run
    fn on_operation_start(&self, operation: OperationId, total_units: usize) {
        let _ = (operation, total_units);
    }

    /// Called when a chunk's output is durably stored.
    fn on_chunk_complete(&self, operation: OperationId, index: u32, total_chunks: usize) {
        let _ = (operation, index, total_chunks);
    }

    /// Called when a chunk fails terminally.
    fn on_chunk_error(&self, operation: OperationId, index: u32, error: &ConversionError) {
        let _ = (operation, index, error);
    }

    /// Called once with the terminal status.
    fn on_operation_finished(&self, operation: OperationId, status: OperationStatus) {
        let _ = (operation, status);
    }
}

/// Observer that ignores every event. The default.
pub struct NoopObserver;

impl OperationObserver for NoopObserver {}

pub type SharedObserver = Arc<dyn OperationObserver>;
