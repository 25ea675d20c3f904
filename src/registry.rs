//! Operation registry: the authoritative store of operation and chunk state.
//!
//! Each operation is held as an immutable `Arc<Operation>` snapshot. Readers
//! clone the `Arc` and never observe a half-applied update; writers build a
//! new snapshot and swap it in while holding the entry's shard lock, which
//! makes every update a compare-and-set against the value it was derived
//! from. This is the only structure that concurrent workers mutate.
//!
//! Invariants enforced here rather than by callers:
//! * status only moves forward along [`OperationStatus::can_transition_to`];
//! * `progress_percent` never decreases;
//! * chunk indices are appended contiguously from 0;
//! * a chunk in a terminal status is never mutated again.

use crate::error::{ErrorKind, JobError};
use crate::model::{Chunk, ChunkStatus, Operation, OperationId, OperationStatus};
use crate::store::ObjectRef;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// A single operation field together with its value, for [`OperationRegistry::update_field`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Status(OperationStatus),
    Progress(u8),
    ResultRef(Option<ObjectRef>),
    FallbackAttempted(bool),
    Error(Option<(ErrorKind, String)>),
}

impl FieldValue {
    fn name(&self) -> &'static str {
        match self {
            FieldValue::Status(_) => "status",
            FieldValue::Progress(_) => "progress",
            FieldValue::ResultRef(_) => "result_ref",
            FieldValue::FallbackAttempted(_) => "fallback_attempted",
            FieldValue::Error(_) => "error",
        }
    }

    /// Read the field `self` names from `op`.
    fn read_same_field(&self, op: &Operation) -> FieldValue {
        match self {
            FieldValue::Status(_) => FieldValue::Status(op.status),
            FieldValue::Progress(_) => FieldValue::Progress(op.progress_percent),
            FieldValue::ResultRef(_) => FieldValue::ResultRef(op.result_ref.clone()),
            FieldValue::FallbackAttempted(_) => FieldValue::FallbackAttempted(op.fallback_attempted),
            FieldValue::Error(_) => FieldValue::Error(
                op.error_kind
                    .map(|k| (k, op.error_message.clone().unwrap_or_default())),
            ),
        }
    }

    fn apply(self, op: &mut Operation) {
        match self {
            FieldValue::Status(s) => op.status = s,
            FieldValue::Progress(p) => op.progress_percent = p,
            FieldValue::ResultRef(r) => op.result_ref = r,
            FieldValue::FallbackAttempted(b) => op.fallback_attempted = b,
            FieldValue::Error(e) => {
                op.error_kind = e.as_ref().map(|(k, _)| *k);
                op.error_message = e.map(|(_, m)| m);
            }
        }
    }
}

#[derive(Default)]
pub struct OperationRegistry {
    operations: DashMap<OperationId, Arc<Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new operation and return its id.
    pub fn create(&self, op: Operation) -> OperationId {
        let id = op.id;
        self.operations.insert(id, Arc::new(op));
        id
    }

    /// Consistent snapshot of an operation.
    pub fn get(&self, id: OperationId) -> Option<Arc<Operation>> {
        self.operations.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn ids(&self) -> Vec<OperationId> {
        self.operations.iter().map(|e| *e.key()).collect()
    }

    /// Compare-and-set one field.
    ///
    /// Returns `Ok(false)` when the current value differs from `expected`,
    /// or when the update would lower progress. Returns
    /// `Err(InvalidTransition)` for a status change the state machine forbids.
    pub fn update_field(
        &self,
        id: OperationId,
        expected: FieldValue,
        new: FieldValue,
    ) -> Result<bool, JobError> {
        if expected.name() != new.name() {
            return Err(JobError::FieldMismatch {
                expected: expected.name(),
                new: new.name(),
            });
        }

        let mut entry = self
            .operations
            .get_mut(&id)
            .ok_or(JobError::OperationNotFound(id))?;
        let current = entry.value();

        if expected.read_same_field(current) != expected {
            return Ok(false);
        }
        if let FieldValue::Progress(p) = &new {
            if *p < current.progress_percent {
                return Ok(false);
            }
        }

        let mut next = Operation::clone(current);
        new.apply(&mut next);
        check_status_change(current, &mut next)?;
        *entry.value_mut() = Arc::new(next);
        Ok(true)
    }

    /// Apply `f` to a copy of the operation and swap it in atomically.
    ///
    /// Status and progress invariants are checked on the result: a forbidden
    /// status change aborts the update with `InvalidTransition`, a progress
    /// decrease is silently undone.
    pub fn update<T>(
        &self,
        id: OperationId,
        f: impl FnOnce(&mut Operation) -> T,
    ) -> Result<(Arc<Operation>, T), JobError> {
        let mut entry = self
            .operations
            .get_mut(&id)
            .ok_or(JobError::OperationNotFound(id))?;
        let current = entry.value();

        let mut next = Operation::clone(current);
        let out = f(&mut next);
        next.id = current.id;
        if next.progress_percent < current.progress_percent {
            next.progress_percent = current.progress_percent;
        }
        check_status_change(current, &mut next)?;

        let snapshot = Arc::new(next);
        *entry.value_mut() = Arc::clone(&snapshot);
        Ok((snapshot, out))
    }

    /// Add the next chunk; its index must equal the current chunk count.
    pub fn append_chunk(&self, id: OperationId, chunk: Chunk) -> Result<(), JobError> {
        self.update(id, |op| {
            let expected = op.chunks.len() as u32;
            if chunk.index != expected || chunk.operation_id != op.id {
                return Err(JobError::ChunkIndexGap {
                    operation: op.id,
                    expected,
                    got: chunk.index,
                });
            }
            op.chunks.push(chunk);
            Ok(())
        })?
        .1
    }

    /// Compare-and-set on one chunk's status.
    ///
    /// `f` runs only if the chunk is currently `expected` and not terminal.
    /// Returns the snapshot the change produced, or `None` if it did not run.
    pub fn update_chunk(
        &self,
        id: OperationId,
        index: u32,
        expected: ChunkStatus,
        f: impl FnOnce(&mut Chunk),
    ) -> Result<Option<Arc<Operation>>, JobError> {
        let (snapshot, applied) = self.update(id, |op| {
            let Some(chunk) = op.chunks.get_mut(index as usize) else {
                return Err(JobError::ChunkNotFound {
                    operation: op.id,
                    index,
                });
            };
            if chunk.status != expected || chunk.status.is_terminal() {
                return Ok(false);
            }
            f(chunk);
            chunk.index = index;
            Ok(true)
        })?;
        Ok(applied?.then_some(snapshot))
    }
}

/// Validate a status change between two snapshots and stamp timestamps.
fn check_status_change(current: &Operation, next: &mut Operation) -> Result<(), JobError> {
    if next.status == current.status {
        return Ok(());
    }
    if !current.status.can_transition_to(next.status) {
        return Err(JobError::InvalidTransition {
            operation: current.id,
            from: current.status,
            to: next.status,
        });
    }
    if next.status == OperationStatus::Processing && next.started_at.is_none() {
        next.started_at = Some(Utc::now());
    }
    if next.status.is_terminal() {
        next.completed_at = Some(Utc::now());
    }
    debug!(
        "operation {}: {:?} -> {:?}",
        current.id, current.status, next.status
    );
    Ok(())
}
