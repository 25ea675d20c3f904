//! Error types for the edgequake-jobs library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`JobError`]: **fatal** for the call that raised it: unknown operation,
//!   invalid configuration, an illegal state transition, or a storage
//!   failure that could not be absorbed. Returned as `Err(JobError)` from the
//!   service and component APIs.
//!
//! * [`ConversionError`]: **non-fatal**, a single job (one chunk or one
//!   whole document) failed inside the external [`crate::processor::JobProcessor`].
//!   It is classified, retried or requeued by the processing queue, and
//!   finally stored on the chunk or operation so callers can inspect it
//!   through [`crate::model::StatusReport`].
//!
//! Chunk-level conversion errors never fail the parent operation directly;
//! only the coordinator's aggregate policy can do that, reported with
//! [`ErrorKind::PartialChunkFailure`].

use crate::model::{OperationId, OperationStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All fatal errors returned by the edgequake-jobs library.
#[derive(Debug, Error)]
pub enum JobError {
    // ── Lookup errors ─────────────────────────────────────────────────────
    /// No operation with this id exists in the registry.
    #[error("Operation {0} not found")]
    OperationNotFound(OperationId),

    /// The operation exists but has no chunk with this index.
    #[error("Operation {operation} has no chunk {index}")]
    ChunkNotFound { operation: OperationId, index: u32 },

    // ── State errors ──────────────────────────────────────────────────────
    /// A status change that the operation state machine does not allow.
    #[error("Operation {operation}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        operation: OperationId,
        from: OperationStatus,
        to: OperationStatus,
    },

    /// `update_field` was called with expected/new values of different fields.
    #[error("Field mismatch: expected value is {expected}, new value is {new}")]
    FieldMismatch {
        expected: &'static str,
        new: &'static str,
    },

    /// `append_chunk` would break the contiguous 0-based index sequence.
    #[error("Operation {operation}: chunk index {got} appended, expected {expected}")]
    ChunkIndexGap {
        operation: OperationId,
        expected: u32,
        got: u32,
    },

    // ── Storage errors ────────────────────────────────────────────────────
    /// An object store rejected a put or get.
    #[error("Object store '{store}' failed: {detail}")]
    Store { store: String, detail: String },

    /// Both the durable store and the fallback store refused an upload.
    #[error("Upload of '{key}' failed after {attempts} attempts and fallback: {detail}")]
    UploadFailed {
        key: String,
        attempts: u32,
        detail: String,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or JSON validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Lifecycle errors ──────────────────────────────────────────────────
    /// `start` was called twice or outside a tokio runtime.
    #[error("Service lifecycle error: {0}")]
    Lifecycle(String),

    /// `wait_for_terminal` gave up before the operation settled.
    #[error("Operation {operation} did not settle within {waited_ms}ms")]
    WaitTimeout { operation: OperationId, waited_ms: u64 },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error raised by the job processor for one job.
///
/// The variant decides what the processing queue does next:
///
/// | Variant | Queue reaction |
/// |---------|----------------|
/// | `TransientIo` | requeue with exponential backoff, counts against `max_attempts` |
/// | `ResourceExhausted` | shrink concurrency, requeue without consuming an attempt |
/// | `UnrecoverableInput` | fail immediately |
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ConversionError {
    /// Network or storage hiccup.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The conversion ran out of memory or another bounded resource.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The input is malformed or corrupt; retrying cannot help.
    #[error("unrecoverable input: {0}")]
    UnrecoverableInput(String),
}

impl ConversionError {
    /// Category used for `errorKind` in status reports.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConversionError::TransientIo(_) => ErrorKind::TransientIoError,
            ConversionError::ResourceExhausted(_) => ErrorKind::ResourceExhaustedError,
            ConversionError::UnrecoverableInput(_) => ErrorKind::UnrecoverableInputError,
        }
    }

    /// Human-readable detail without the category prefix.
    pub fn detail(&self) -> &str {
        match self {
            ConversionError::TransientIo(d)
            | ConversionError::ResourceExhausted(d)
            | ConversionError::UnrecoverableInput(d) => d,
        }
    }
}

/// Categorised failure reported through `getStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientIoError,
    ResourceExhaustedError,
    UnrecoverableInputError,
    /// Too many chunks failed and the whole-document fallback failed too.
    PartialChunkFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::TransientIoError => "TransientIOError",
            ErrorKind::ResourceExhaustedError => "ResourceExhaustedError",
            ErrorKind::UnrecoverableInputError => "UnrecoverableInputError",
            ErrorKind::PartialChunkFailure => "PartialChunkFailure",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_error_kinds() {
        assert_eq!(
            ConversionError::TransientIo("reset".into()).kind(),
            ErrorKind::TransientIoError
        );
        assert_eq!(
            ConversionError::ResourceExhausted("oom".into()).kind(),
            ErrorKind::ResourceExhaustedError
        );
        assert_eq!(
            ConversionError::UnrecoverableInput("bad xref".into()).kind(),
            ErrorKind::UnrecoverableInputError
        );
    }

    #[test]
    fn conversion_error_display_and_detail() {
        let e = ConversionError::TransientIo("connection reset".into());
        assert!(e.to_string().contains("connection reset"), "got: {e}");
        assert_eq!(e.detail(), "connection reset");
    }

    #[test]
    fn error_kind_serialises_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PartialChunkFailure).unwrap();
        assert_eq!(json, "\"partial_chunk_failure\"");
        assert_eq!(ErrorKind::TransientIoError.to_string(), "TransientIOError");
    }

    #[test]
    fn chunk_index_gap_display() {
        let op = OperationId::new();
        let e = JobError::ChunkIndexGap {
            operation: op,
            expected: 3,
            got: 5,
        };
        let msg = e.to_string();
        assert!(msg.contains("chunk index 5"), "got: {msg}");
        assert!(msg.contains("expected 3"), "got: {msg}");
    }

    #[test]
    fn upload_failed_display() {
        let e = JobError::UploadFailed {
            key: "abc".into(),
            attempts: 4,
            detail: "disk full".into(),
        };
        assert!(e.to_string().contains("4 attempts"));
        assert!(e.to_string().contains("disk full"));
    }
}
