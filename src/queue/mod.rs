//! Admission-controlled, priority-ordered job scheduler.
//!
//! The backlog is ordered by priority (descending), then enqueue time
//! (ascending), then a sequence number. [`ProcessingQueue::tick`] first
//! adapts `max_concurrency` to the memory band and then runs
//! [`ProcessingQueue::admit`], which scans the backlog once and admits
//! every job that fits both the free slots and the aggregate memory budget.
//! Event wakeups (enqueue, a freed slot) call `admit` alone, so concurrency
//! only moves once per periodic tick.
//!
//! The scan skips a job that does not fit instead of stopping at it, so a
//! large high-priority job cannot hold back small jobs behind it (see
//! `tick_skips_unfit_job_instead_of_blocking` below).
//!
//! Admitted jobs run on their own tokio task. When a job finishes, its
//! [`JobOutcome`] is fed through the job state machine ([`job`]) and the
//! queue either requeues it or hands the terminal [`Resolution`] to the
//! [`JobExecutor`].

pub mod job;

pub use job::{
    InvalidJobTransition, Job, JobEvent, JobId, JobPurpose, JobState, Resolution, RetryLimits,
    Transition,
};

use crate::config::SchedulerConfig;
use crate::error::ConversionError;
use crate::memory::MemoryBand;
use crate::model::{OperationId, Priority, QueueStats};
use crate::retry::Backoff;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// ── Executor seam ───────────────────────────────────────────────────────────

/// What running a job produced.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded,
    Failed(ConversionError),
    /// The owning operation was cancelled; nothing was committed.
    Cancelled,
}

impl From<JobOutcome> for JobEvent {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Succeeded => JobEvent::Succeeded,
            JobOutcome::Failed(e) => JobEvent::Failed(e),
            JobOutcome::Cancelled => JobEvent::Cancelled,
        }
    }
}

/// Runs admitted jobs and receives their final resolution.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run one attempt of `job`.
    async fn execute(&self, job: &Job) -> JobOutcome;

    /// Called exactly once per job, after it reached a terminal state.
    async fn settle(&self, job: &Job, resolution: Resolution);

    /// Called when a failed attempt sends `job` back to the backlog.
    fn requeued(&self, _job: &Job) {}
}

// ── Queue ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BacklogKey {
    priority: Reverse<Priority>,
    enqueued_at: Instant,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct ActiveJob {
    operation_id: OperationId,
    resource_estimate: u64,
}

struct QueueState {
    backlog: BTreeMap<BacklogKey, Job>,
    active: HashMap<JobId, ActiveJob>,
    max_concurrency: usize,
    reserved_bytes: u64,
    peak_active: usize,
    next_seq: u64,
    /// Jobs that left `active` but whose outcome is still being handled.
    finishing: usize,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.active.is_empty() && self.finishing == 0
    }

    /// Free the slot and memory reservation held by `id`.
    fn release(&mut self, id: JobId) {
        if let Some(slot) = self.active.remove(&id) {
            self.reserved_bytes = self.reserved_bytes.saturating_sub(slot.resource_estimate);
        }
    }
}

/// Result of one admission pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub admitted: Vec<JobId>,
    pub max_concurrency: usize,
    /// Ready jobs left in the backlog because they did not fit.
    pub skipped: usize,
}

pub struct ProcessingQueue {
    baseline_concurrency: usize,
    max_concurrency_cap: usize,
    memory_budget_bytes: u64,
    limits: RetryLimits,
    state: Mutex<QueueState>,
    notify: Arc<Notify>,
    idle: Notify,
}

impl ProcessingQueue {
    pub fn new(config: &SchedulerConfig) -> Self {
        let baseline = config.baseline_concurrency.max(1);
        Self {
            baseline_concurrency: baseline,
            max_concurrency_cap: config.max_concurrency_cap.max(baseline),
            memory_budget_bytes: config.memory_budget_bytes,
            limits: RetryLimits {
                max_attempts: config.max_attempts.max(1),
                max_resource_requeues: config.max_resource_requeues,
                backoff: Backoff::from_millis(config.retry_base_delay_ms, config.retry_max_delay_ms),
            },
            state: Mutex::new(QueueState {
                backlog: BTreeMap::new(),
                active: HashMap::new(),
                max_concurrency: baseline,
                reserved_bytes: 0,
                peak_active: 0,
                next_seq: 0,
                finishing: 0,
            }),
            notify: Arc::new(Notify::new()),
            idle: Notify::new(),
        }
    }

    /// Fires whenever the backlog gains a job or a slot frees up.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Put a new job on the backlog and return its id.
    pub fn enqueue(&self, mut job: Job) -> JobId {
        let id = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;

            job.id = JobId(seq);
            job.enqueued_at = Instant::now();
            job.max_attempts = self.limits.max_attempts;
            job.state = JobState::Queued;
            debug!(
                "enqueue {} for operation {} (chunk {:?}, priority {}, estimate {} B)",
                job.id, job.operation_id, job.chunk_index, job.priority, job.resource_estimate
            );
            let key = BacklogKey {
                priority: Reverse(job.priority),
                enqueued_at: job.enqueued_at,
                seq,
            };
            state.backlog.insert(key, job);
            JobId(seq)
        };
        self.notify.notify_one();
        id
    }

    /// Adapt `max_concurrency` to `band` and return the new value.
    ///
    /// Normal grows by one when the backlog exceeds the active count;
    /// Warning and Critical shrink by one; Emergency drops to the floor.
    pub fn adjust_concurrency(&self, band: MemoryBand) -> usize {
        let mut state = self.state.lock();
        let before = state.max_concurrency;
        let after = match band {
            MemoryBand::Normal if state.backlog.len() > state.active.len() => {
                (before + 1).min(self.max_concurrency_cap)
            }
            MemoryBand::Normal => before,
            MemoryBand::Warning | MemoryBand::Critical => before.saturating_sub(1).max(1),
            MemoryBand::Emergency => 1,
        };
        if after != before {
            info!("max concurrency {} -> {} (band {:?})", before, after, band);
            state.max_concurrency = after;
        }
        after
    }

    /// One periodic tick: adapt concurrency, then admit what fits.
    pub fn tick(self: &Arc<Self>, band: MemoryBand, executor: &Arc<dyn JobExecutor>) -> TickReport {
        self.adjust_concurrency(band);
        self.admit(executor)
    }

    /// Admit what fits under the current `max_concurrency`, leaving it as is.
    pub fn admit(self: &Arc<Self>, executor: &Arc<dyn JobExecutor>) -> TickReport {
        let now = Instant::now();

        let (admitted, skipped, max_concurrency) = {
            let mut state = self.state.lock();
            let max_concurrency = state.max_concurrency;
            let mut active = state.active.len();
            let mut reserved = state.reserved_bytes;
            let mut picked = Vec::new();
            let mut skipped = 0usize;

            for (key, job) in state.backlog.iter() {
                if active >= max_concurrency {
                    break;
                }
                if job.not_before.is_some_and(|t| t > now) {
                    continue;
                }
                let fits = reserved.saturating_add(job.resource_estimate) <= self.memory_budget_bytes;
                // Larger than the whole budget: run it alone rather than never.
                let alone = active == 0 && job.resource_estimate > self.memory_budget_bytes;
                if fits || alone {
                    picked.push(*key);
                    active += 1;
                    reserved = reserved.saturating_add(job.resource_estimate);
                } else {
                    debug!(
                        "skip {} ({} B does not fit, {} B reserved of {} B)",
                        job.id, job.resource_estimate, reserved, self.memory_budget_bytes
                    );
                    skipped += 1;
                }
            }

            let mut admitted = Vec::with_capacity(picked.len());
            for key in picked {
                let Some(mut job) = state.backlog.remove(&key) else {
                    continue;
                };
                if let Err(e) = job.apply(JobEvent::Admitted, &self.limits, now) {
                    error!("admission rejected: {}", e);
                    continue;
                }
                state.active.insert(
                    job.id,
                    ActiveJob {
                        operation_id: job.operation_id,
                        resource_estimate: job.resource_estimate,
                    },
                );
                state.reserved_bytes = state.reserved_bytes.saturating_add(job.resource_estimate);
                state.peak_active = state.peak_active.max(state.active.len());
                admitted.push(job);
            }
            (admitted, skipped, max_concurrency)
        };

        let ids = admitted.iter().map(|j| j.id).collect();
        for job in admitted {
            debug!(
                "admit {} for operation {} (attempt {})",
                job.id,
                job.operation_id,
                job.attempts + 1
            );
            let queue = Arc::clone(self);
            let executor = Arc::clone(executor);
            tokio::spawn(async move {
                let outcome = executor.execute(&job).await;
                queue.finish(job, outcome, executor).await;
            });
        }

        TickReport {
            admitted: ids,
            max_concurrency,
            skipped,
        }
    }

    /// Release the job's slot and run it through the state machine.
    ///
    /// A job going back to the backlog holds its slot until the executor's
    /// `requeued` hook has returned.
    async fn finish(self: Arc<Self>, mut job: Job, outcome: JobOutcome, executor: Arc<dyn JobExecutor>) {
        let now = Instant::now();
        let transition = {
            let mut state = self.state.lock();
            state.finishing += 1;
            let transition = job.apply(outcome.into(), &self.limits, now);
            match &transition {
                Ok(Transition::Retry { .. }) => {}
                Ok(Transition::Requeue) => {
                    let before = state.max_concurrency;
                    state.max_concurrency = before.saturating_sub(1).max(1);
                    if state.max_concurrency != before {
                        info!(
                            "max concurrency {} -> {} (resource exhausted in {})",
                            before, state.max_concurrency, job.id
                        );
                    }
                }
                _ => state.release(job.id),
            }
            transition
        };

        match transition {
            Ok(Transition::Retry { delay }) => {
                warn!(
                    "{} for operation {} failed (attempt {}/{}), retrying in {:?}: {}",
                    job.id,
                    job.operation_id,
                    job.attempts,
                    job.max_attempts,
                    delay,
                    job.last_error.as_ref().map(|e| e.to_string()).unwrap_or_default()
                );
                executor.requeued(&job);
                self.return_to_backlog(job);
                let notify = Arc::clone(&self.notify);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    notify.notify_one();
                });
            }
            Ok(Transition::Requeue) => {
                warn!(
                    "{} for operation {} exhausted resources, requeued ({}/{})",
                    job.id, job.operation_id, job.resource_requeues, self.limits.max_resource_requeues
                );
                executor.requeued(&job);
                self.return_to_backlog(job);
            }
            Ok(Transition::Settled(resolution)) => {
                executor.settle(&job, resolution).await;
            }
            Ok(Transition::Started) => {
                error!("{}: finished job reported as started", job.id);
            }
            Err(e) => {
                error!("{}", e);
            }
        }

        {
            let mut state = self.state.lock();
            state.finishing -= 1;
            if state.is_idle() {
                self.idle.notify_waiters();
            }
        }
        self.notify.notify_one();
    }

    /// Swap an active job for a backlog entry under its original key.
    fn return_to_backlog(&self, job: Job) {
        let key = BacklogKey {
            priority: Reverse(job.priority),
            enqueued_at: job.enqueued_at,
            seq: job.id.0,
        };
        let mut state = self.state.lock();
        state.release(job.id);
        state.backlog.insert(key, job);
    }

    /// Remove every queued job of `operation`; returns how many were removed.
    pub fn purge_operation(&self, operation: OperationId) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<BacklogKey> = state
            .backlog
            .iter()
            .filter(|(_, job)| job.operation_id == operation)
            .map(|(key, _)| *key)
            .collect();
        let now = Instant::now();
        for key in &keys {
            if let Some(mut job) = state.backlog.remove(key) {
                // Queued -> Cancelled is always valid.
                let _ = job.apply(JobEvent::Cancelled, &self.limits, now);
            }
        }
        if !keys.is_empty() {
            debug!("purged {} queued jobs of operation {}", keys.len(), operation);
        }
        keys.len()
    }

    /// Whether `operation` has a job queued or running.
    pub fn has_work_for(&self, operation: OperationId) -> bool {
        let state = self.state.lock();
        state.active.values().any(|a| a.operation_id == operation)
            || state.backlog.values().any(|j| j.operation_id == operation)
    }

    pub fn max_concurrency(&self) -> usize {
        self.state.lock().max_concurrency
    }

    pub fn active_len(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    /// Backlog job ids in admission order, ignoring readiness.
    pub fn backlog_order(&self) -> Vec<JobId> {
        self.state.lock().backlog.values().map(|j| j.id).collect()
    }

    pub fn retry_limits(&self) -> RetryLimits {
        self.limits
    }

    pub fn stats(&self, band: MemoryBand) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            queued_jobs: state.backlog.len(),
            active_jobs: state.active.len(),
            max_concurrency: state.max_concurrency,
            memory_band: band,
            peak_active_jobs: state.peak_active,
            reserved_memory_bytes: state.reserved_bytes,
        }
    }

    /// Wait until no job is running or settling.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.state.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn baseline_concurrency(&self) -> usize {
        self.baseline_concurrency
    }
}
