//! The conversion seam.
//!
//! A [`JobProcessor`] does the actual format conversion. It reads its input
//! from the source store, writes the converted bytes into the scratch store
//! it was constructed with, and returns a reference into that scratch store.
//! The worker then reads the output back and persists it durably.

use crate::error::ConversionError;
use crate::model::{Operation, OperationId, Segment};
use crate::store::ObjectRef;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Everything a processor needs to know about one unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertTask {
    pub operation_id: OperationId,
    pub correlation_id: String,
    pub source_format: String,
    pub target_format: String,
    pub options: BTreeMap<String, String>,
    /// Part of the source to convert; `None` means the whole document.
    pub segment: Option<Segment>,
    /// 1-based attempt number of this job.
    pub attempt: u32,
}

impl ConvertTask {
    pub fn for_operation(op: &Operation, segment: Option<Segment>, attempt: u32) -> Self {
        Self {
            operation_id: op.id,
            correlation_id: op.correlation_id.clone(),
            source_format: op.source_format.clone(),
            target_format: op.target_format.clone(),
            options: op.options.clone(),
            segment,
            attempt,
        }
    }
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Convert `input` as described by `task` and return the scratch
    /// reference of the output.
    async fn convert(&self, input: &ObjectRef, task: &ConvertTask)
        -> Result<ObjectRef, ConversionError>;
}
