//! Jobs and their explicit state machine.
//!
//! A [`Job`] is a transient queue entry for either a whole document
//! (`chunk_index == None`) or a single chunk. Every event goes through
//! [`Job::apply`], which follows this table:
//!
//! | State  | Event                         | Next      | Effect |
//! |--------|-------------------------------|-----------|--------|
//! | Queued | `Admitted`                    | Active    | |
//! | Queued | `Cancelled`                   | Cancelled | |
//! | Active | `Succeeded`                   | Completed | |
//! | Active | `Failed(TransientIo)`         | Queued    | `attempts += 1`, retry after `min(base*2^attempts, max)` |
//! |        |   ...when `attempts >= max`     | Failed    | terminal |
//! | Active | `Failed(ResourceExhausted)`   | Queued    | `resource_requeues += 1`, shrink concurrency, no attempt used |
//! |        |   ...when requeues exhausted    | Failed    | terminal |
//! | Active | `Failed(UnrecoverableInput)`  | Failed    | `attempts += 1`, terminal |
//! | Active | `Cancelled`                   | Cancelled | result not committed |
//!
//! Any other pair is an [`InvalidJobTransition`].

use crate::error::ConversionError;
use crate::model::{OperationId, Priority};
use crate::retry::Backoff;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Whether a whole-document job is the first attempt or the fallback after
/// too many chunks failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPurpose {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Admitted,
    Succeeded,
    Failed(ConversionError),
    Cancelled,
}

impl JobEvent {
    fn label(&self) -> &'static str {
        match self {
            JobEvent::Admitted => "admitted",
            JobEvent::Succeeded => "succeeded",
            JobEvent::Failed(_) => "failed",
            JobEvent::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{job}: event '{event}' is not valid in state {state:?}")]
pub struct InvalidJobTransition {
    pub job: JobId,
    pub state: JobState,
    pub event: &'static str,
}

/// Limits the state machine needs to decide between retry and failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryLimits {
    pub max_attempts: u32,
    pub max_resource_requeues: u32,
    pub backoff: Backoff,
}

/// What the queue must do after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Queued to Active.
    Started,
    /// Back to the backlog after `delay`.
    Retry { delay: Duration },
    /// Back to the backlog at once, with less concurrency.
    Requeue,
    /// Terminal: Completed, Failed or Cancelled.
    Settled(Resolution),
}

/// Final outcome of a job, handed to the executor exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Completed,
    Failed(ConversionError),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub operation_id: OperationId,
    /// `None` for a whole-document job.
    pub chunk_index: Option<u32>,
    pub purpose: JobPurpose,
    pub priority: Priority,
    /// Estimated peak memory in bytes.
    pub resource_estimate: u64,
    pub enqueued_at: Instant,
    pub attempts: u32,
    pub max_attempts: u32,
    pub resource_requeues: u32,
    pub state: JobState,
    /// Not admitted before this instant (retry backoff).
    pub not_before: Option<Instant>,
    pub last_error: Option<ConversionError>,
}

impl Job {
    /// Describe the work; id, timestamps and limits are filled in by the queue.
    pub fn whole_document(operation_id: OperationId, priority: Priority, resource_estimate: u64) -> Self {
        Self::describe(operation_id, None, priority, resource_estimate)
    }

    pub fn chunk(
        operation_id: OperationId,
        index: u32,
        priority: Priority,
        resource_estimate: u64,
    ) -> Self {
        Self::describe(operation_id, Some(index), priority, resource_estimate)
    }

    fn describe(
        operation_id: OperationId,
        chunk_index: Option<u32>,
        priority: Priority,
        resource_estimate: u64,
    ) -> Self {
        Self {
            id: JobId(0),
            operation_id,
            chunk_index,
            purpose: JobPurpose::Primary,
            priority,
            resource_estimate,
            enqueued_at: Instant::now(),
            attempts: 0,
            max_attempts: 1,
            resource_requeues: 0,
            state: JobState::Queued,
            not_before: None,
            last_error: None,
        }
    }

    pub fn with_purpose(mut self, purpose: JobPurpose) -> Self {
        self.purpose = purpose;
        self
    }

    pub fn is_whole_document(&self) -> bool {
        self.chunk_index.is_none()
    }

    /// Drive the state machine with `event`.
    pub fn apply(
        &mut self,
        event: JobEvent,
        limits: &RetryLimits,
        now: Instant,
    ) -> Result<Transition, InvalidJobTransition> {
        let invalid = InvalidJobTransition {
            job: self.id,
            state: self.state,
            event: event.label(),
        };

        let transition = match (self.state, event) {
            (JobState::Queued, JobEvent::Admitted) => {
                self.state = JobState::Active;
                self.not_before = None;
                Transition::Started
            }
            (JobState::Queued | JobState::Active, JobEvent::Cancelled) => {
                self.state = JobState::Cancelled;
                Transition::Settled(Resolution::Cancelled)
            }
            (JobState::Active, JobEvent::Succeeded) => {
                self.state = JobState::Completed;
                Transition::Settled(Resolution::Completed)
            }
            (JobState::Active, JobEvent::Failed(err)) => {
                let transition = match &err {
                    ConversionError::TransientIo(_) => {
                        self.attempts += 1;
                        if self.attempts >= self.max_attempts {
                            self.state = JobState::Failed;
                            Transition::Settled(Resolution::Failed(err.clone()))
                        } else {
                            let delay = limits.backoff.delay(self.attempts);
                            self.state = JobState::Queued;
                            self.not_before = Some(now + delay);
                            Transition::Retry { delay }
                        }
                    }
                    ConversionError::ResourceExhausted(_) => {
                        self.resource_requeues += 1;
                        if self.resource_requeues > limits.max_resource_requeues {
                            self.state = JobState::Failed;
                            Transition::Settled(Resolution::Failed(err.clone()))
                        } else {
                            self.state = JobState::Queued;
                            Transition::Requeue
                        }
                    }
                    ConversionError::UnrecoverableInput(_) => {
                        self.attempts += 1;
                        self.state = JobState::Failed;
                        Transition::Settled(Resolution::Failed(err.clone()))
                    }
                };
                self.last_error = Some(err);
                transition
            }
            _ => return Err(invalid),
        };
        Ok(transition)
    }
}
