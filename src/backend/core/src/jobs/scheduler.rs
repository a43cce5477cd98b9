//! Priority job scheduling with bounded concurrency.
//!
//! The [`JobScheduler`] owns the job table, the pending list, the waiter
//! registry, and the processing count. All of that state sits behind one
//! lock; the dispatch loop, handler completions, cancellation, and the
//! retention sweep serialize through it. The lock is never held across an
//! await point.
//!
//! Dispatch runs on a fixed tick: each tick fills free slots
//! (`max_concurrent_jobs - processing`) from the pending list, highest
//! priority first, FIFO within a priority. A submitted job therefore waits
//! at most one tick before it is considered. Handler execution is spawned
//! and never blocks the loop; a handler panic is contained to its own task.
//!
//! No starvation prevention across priorities: a steady stream of
//! high-priority jobs can delay lower priorities indefinitely.

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LimnError, Result};

use super::handler::HandlerRegistry;
use super::job::{HandlerResult, JobError, JobId, JobPayload, JobRecord, JobStatus, QueueStats};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the job scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Hard upper bound on simultaneously processing jobs
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Interval of the dispatch tick
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// How long terminal jobs are kept before the retention sweep purges them
    #[serde(default = "default_retention_window", with = "humantime_serde")]
    pub retention_window: Duration,

    /// Interval of the retention sweep
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Retry budget applied to every submitted job
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            tick_interval: default_tick_interval(),
            retention_window: default_retention_window(),
            sweep_interval: default_sweep_interval(),
            default_max_retries: default_max_retries(),
        }
    }
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_retention_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_max_retries() -> u32 {
    3
}

// ═══════════════════════════════════════════════════════════════════════════════
// Internal State
// ═══════════════════════════════════════════════════════════════════════════════

/// Entry in the priority-ordered pending list.
#[derive(Debug, Clone)]
struct PendingEntry {
    job_id: JobId,
    priority: i32,
}

/// One-shot completion registration for `await_completion`.
struct Waiter {
    id: u64,
    tx: oneshot::Sender<JobRecord>,
}

/// Everything the scheduler mutates, behind one lock.
#[derive(Default)]
struct SchedulerState {
    /// Job table
    jobs: HashMap<JobId, JobRecord>,

    /// Pending jobs, sorted by priority descending; insertion keeps FIFO
    /// order within a priority
    pending: Vec<PendingEntry>,

    /// Jobs currently holding a processing slot
    processing: usize,

    /// Waiter registrations per job
    waiters: HashMap<JobId, Vec<Waiter>>,

    /// Cooperative cancellation tokens for in-flight jobs
    cancel_tokens: HashMap<JobId, CancellationToken>,

    /// Monotonic waiter id source
    next_waiter_id: u64,
}

/// Insert into the pending list at the priority position.
///
/// `partition_point` lands after every entry with priority >= the new one,
/// which preserves submission order among equals. A retry re-queue goes
/// through here too and counts as a fresh insertion.
fn insert_pending(state: &mut SchedulerState, job_id: JobId, priority: i32) {
    let position = state.pending.partition_point(|e| e.priority >= priority);
    state.pending.insert(position, PendingEntry { job_id, priority });
}

/// Deliver a terminal snapshot to every waiter of a job and drop the
/// registrations.
fn deliver_waiters(state: &mut SchedulerState, job_id: JobId, snapshot: &JobRecord) {
    if let Some(waiters) = state.waiters.remove(&job_id) {
        for waiter in waiters {
            // A receiver gone before delivery already timed out; nothing to do.
            let _ = waiter.tx.send(snapshot.clone());
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority queue with bounded concurrency, retries, waitable completion,
/// and retention-based garbage collection.
///
/// Constructed explicitly with its configuration and handler registry and
/// injected wherever requests are handled; there is no process-wide
/// instance.
pub struct JobScheduler {
    config: SchedulerConfig,
    handlers: Arc<HandlerRegistry>,
    state: Mutex<SchedulerState>,
}

impl JobScheduler {
    /// Create a new scheduler. Call [`JobScheduler::start`] to run it.
    pub fn new(config: SchedulerConfig, handlers: Arc<HandlerRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            handlers,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    /// Get the scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Public Contract
    // ─────────────────────────────────────────────────────────────────────────

    /// Enqueue a new job. Always succeeds synchronously and never executes
    /// inline; the dispatch loop picks the job up on a later tick.
    pub fn submit(&self, owner_id: impl Into<String>, payload: JobPayload, priority: i32) -> JobId {
        let record = JobRecord::new(
            owner_id.into(),
            payload,
            priority,
            self.config.default_max_retries,
        );
        let id = record.id;
        let kind = record.kind();

        {
            let mut state = self.state.lock();
            state.jobs.insert(id, record);
            insert_pending(&mut state, id, priority);
        }

        counter!("limn_jobs_submitted_total", "kind" => kind.to_string()).increment(1);
        debug!(job_id = %id, kind = %kind, priority, "job submitted");
        id
    }

    /// Get a snapshot of a job.
    pub fn get_status(&self, job_id: JobId) -> Result<JobRecord> {
        self.state
            .lock()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| LimnError::job_not_found(job_id))
    }

    /// Suspend until the job reaches a terminal state, or until `timeout`.
    ///
    /// Registers a one-shot waiter that is removed on delivery or on the
    /// waiter's own deadline; waiting has no effect on the job's execution
    /// or retries.
    pub async fn await_completion(&self, job_id: JobId, timeout: Duration) -> Result<JobRecord> {
        let (waiter_id, rx) = {
            let mut state = self.state.lock();

            if let Some(job) = state.jobs.get(&job_id) {
                if job.is_terminal() {
                    return Ok(job.clone());
                }
            } else {
                return Err(LimnError::job_not_found(job_id));
            }

            let (tx, rx) = oneshot::channel();
            let waiter_id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state
                .waiters
                .entry(job_id)
                .or_default()
                .push(Waiter { id: waiter_id, tx });
            (waiter_id, rx)
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(job)) => Ok(job),
            Ok(Err(_closed)) => Err(LimnError::internal(format!(
                "completion channel closed for job {}",
                job_id
            ))),
            Err(_elapsed) => {
                self.remove_waiter(job_id, waiter_id);
                Err(LimnError::wait_timeout(job_id, timeout.as_millis()))
            }
        }
    }

    /// Cancel a job.
    ///
    /// A queued job leaves the pending list and goes terminal immediately.
    /// A processing job goes terminal immediately too, and its cooperative
    /// cancellation token fires; the in-flight handler is not forcibly
    /// interrupted, but any late outcome it produces is discarded. Returns
    /// `false` for unknown or already-terminal jobs.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let mut state = self.state.lock();

        let previous_status = match state.jobs.get(&job_id) {
            Some(job) if !job.is_terminal() => job.status,
            _ => return false,
        };

        let snapshot = {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return false;
            };
            job.mark_failed(JobError::cancelled().message);
            job.clone()
        };

        match previous_status {
            JobStatus::Queued => {
                state.pending.retain(|e| e.job_id != job_id);
            }
            JobStatus::Processing => {
                // Slot stays held until the handler actually returns.
                if let Some(token) = state.cancel_tokens.get(&job_id) {
                    token.cancel();
                }
            }
            JobStatus::Completed | JobStatus::Failed => {}
        }

        deliver_waiters(&mut state, job_id, &snapshot);
        drop(state);

        counter!("limn_jobs_cancelled_total").increment(1);
        info!(job_id = %job_id, previous_status = %previous_status, "job cancelled");
        true
    }

    /// Compute queue statistics over the current job table.
    pub fn get_queue_stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats {
            total: state.jobs.len(),
            ..Default::default()
        };

        let mut duration_sum_ms = 0.0;
        let mut duration_count = 0usize;
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    if let Some(duration) = job.duration() {
                        duration_sum_ms += duration.num_milliseconds() as f64;
                        duration_count += 1;
                    }
                }
                JobStatus::Failed => stats.failed += 1,
            }
        }
        if duration_count > 0 {
            stats.mean_duration_ms = Some(duration_sum_ms / duration_count as f64);
        }
        stats
    }

    /// List an owner's jobs, newest first.
    pub fn get_jobs_for_owner(&self, owner_id: &str) -> Vec<JobRecord> {
        let state = self.state.lock();
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| job.owner_id == owner_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Number of waiters registered for a job (observable for tests and
    /// stats; delivery and waiter timeouts both deregister).
    pub fn waiter_count(&self, job_id: JobId) -> usize {
        self.state
            .lock()
            .waiters
            .get(&job_id)
            .map(|w| w.len())
            .unwrap_or(0)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    /// Fill free processing slots from the pending list.
    fn dispatch_ready(self: Arc<Self>) {
        enum Dispatch {
            Run(JobId, JobPayload, CancellationToken),
            Skip,
            Idle,
        }

        loop {
            let next = {
                let mut state = self.state.lock();
                if state.processing >= self.config.max_concurrent_jobs
                    || state.pending.is_empty()
                {
                    Dispatch::Idle
                } else {
                    let entry = state.pending.remove(0);
                    let payload = match state.jobs.get_mut(&entry.job_id) {
                        Some(job) if job.status == JobStatus::Queued => {
                            job.mark_processing();
                            Some(job.payload.clone())
                        }
                        // Stale entry: the job was cancelled or purged after
                        // the entry was queued.
                        _ => None,
                    };
                    match payload {
                        Some(payload) => {
                            state.processing += 1;
                            let token = CancellationToken::new();
                            state.cancel_tokens.insert(entry.job_id, token.clone());
                            gauge!("limn_jobs_processing").set(state.processing as f64);
                            Dispatch::Run(entry.job_id, payload, token)
                        }
                        None => Dispatch::Skip,
                    }
                }
            };

            match next {
                Dispatch::Run(job_id, payload, token) => {
                    debug!(job_id = %job_id, "job dispatched");
                    Arc::clone(&self).spawn_execution(job_id, payload, token);
                }
                Dispatch::Skip => continue,
                Dispatch::Idle => break,
            }
        }
    }

    /// Run one handler invocation in its own task tree.
    ///
    /// The inner spawn isolates handler panics: a panic surfaces as a
    /// `JoinError` here instead of tearing anything else down, and the
    /// bookkeeping below still runs.
    fn spawn_execution(self: Arc<Self>, job_id: JobId, payload: JobPayload, cancel: CancellationToken) {
        tokio::spawn(async move {
            let handlers = Arc::clone(&self.handlers);
            let handler_cancel = cancel.clone();
            let joined = tokio::spawn(async move {
                handlers.dispatch(&payload, &handler_cancel).await
            })
            .await;

            let outcome: HandlerResult = match joined {
                Ok(result) => result,
                Err(join_error) => {
                    warn!(job_id = %job_id, error = %join_error, "handler task failed");
                    Err(JobError::fatal(format!("handler panicked: {}", join_error)))
                }
            };

            self.complete_execution(job_id, outcome);
        });
    }

    /// Record the outcome of a handler invocation: complete, re-queue for
    /// retry, or fail terminally, then notify waiters.
    fn complete_execution(&self, job_id: JobId, outcome: HandlerResult) {
        enum Next {
            Deliver(JobRecord),
            Requeue { priority: i32 },
            Discard,
        }

        let mut state = self.state.lock();
        state.processing = state.processing.saturating_sub(1);
        gauge!("limn_jobs_processing").set(state.processing as f64);
        state.cancel_tokens.remove(&job_id);

        let next = match state.jobs.get_mut(&job_id) {
            None => Next::Discard,
            Some(job) if job.is_terminal() => {
                // Cancelled while in flight; the terminal record stands.
                debug!(job_id = %job_id, "late outcome for terminal job discarded");
                Next::Discard
            }
            Some(job) => match outcome {
                Ok(result) => {
                    job.mark_completed(result);
                    counter!("limn_jobs_completed_total", "kind" => job.kind().to_string())
                        .increment(1);
                    debug!(job_id = %job_id, "job completed");
                    Next::Deliver(job.clone())
                }
                Err(error) if error.retryable && job.retry_count < job.max_retries => {
                    job.retry_count += 1;
                    job.mark_requeued();
                    counter!("limn_job_retries_total", "kind" => job.kind().to_string())
                        .increment(1);
                    warn!(
                        job_id = %job_id,
                        retry_count = job.retry_count,
                        max_retries = job.max_retries,
                        error = %error,
                        "job failed, re-queued"
                    );
                    Next::Requeue {
                        priority: job.priority,
                    }
                }
                Err(error) => {
                    job.mark_failed(error.message.clone());
                    counter!("limn_jobs_failed_total", "kind" => job.kind().to_string())
                        .increment(1);
                    warn!(
                        job_id = %job_id,
                        retry_count = job.retry_count,
                        error = %error,
                        "job failed terminally"
                    );
                    Next::Deliver(job.clone())
                }
            },
        };

        match next {
            Next::Deliver(snapshot) => deliver_waiters(&mut state, job_id, &snapshot),
            Next::Requeue { priority } => insert_pending(&mut state, job_id, priority),
            Next::Discard => {}
        }
    }

    /// Drop a single waiter registration after its deadline fired.
    fn remove_waiter(&self, job_id: JobId, waiter_id: u64) {
        let mut state = self.state.lock();
        let mut now_empty = false;
        if let Some(list) = state.waiters.get_mut(&job_id) {
            list.retain(|w| w.id != waiter_id);
            now_empty = list.is_empty();
        }
        if now_empty {
            state.waiters.remove(&job_id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Garbage Collection
    // ─────────────────────────────────────────────────────────────────────────

    /// Purge terminal jobs older than the retention window that have no
    /// registered waiter. Returns the number of jobs removed.
    pub fn sweep_expired(&self) -> usize {
        let now = chrono::Utc::now();
        let retention = chrono::Duration::from_std(self.config.retention_window)
            .unwrap_or_else(|_| chrono::Duration::days(3650));

        let mut state = self.state.lock();
        let watched: std::collections::HashSet<JobId> = state.waiters.keys().copied().collect();
        let before = state.jobs.len();
        state.jobs.retain(|id, job| {
            let expired = job.is_terminal()
                && job
                    .completed_at
                    .map(|at| now - at >= retention)
                    .unwrap_or(false);
            !(expired && !watched.contains(id))
        });
        let removed = before - state.jobs.len();
        if removed > 0 {
            info!(removed, "purged expired terminal jobs");
        }
        removed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loops
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the dispatch and retention loops, returning a handle that
    /// stops both.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Arc::clone(&self);
        let mut dispatch_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(dispatcher.config.tick_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                max_concurrent_jobs = dispatcher.config.max_concurrent_jobs,
                tick_interval_ms = dispatcher.config.tick_interval.as_millis() as u64,
                "job dispatch loop started"
            );

            loop {
                tokio::select! {
                    changed = dispatch_shutdown.changed() => {
                        // A dropped handle counts as shutdown
                        if changed.is_err() || *dispatch_shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        Arc::clone(&dispatcher).dispatch_ready();
                    }
                }
            }

            info!("job dispatch loop stopped");
        });

        let sweeper = self;
        let mut sweep_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweeper.config.sweep_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick; there is nothing to purge yet.
            tick.tick().await;

            loop {
                tokio::select! {
                    changed = sweep_shutdown.changed() => {
                        if changed.is_err() || *sweep_shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        sweeper.sweep_expired();
                    }
                }
            }

            info!("job retention sweep stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
        }
    }
}

/// Handle for stopping a running scheduler's loops.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
}

impl SchedulerHandle {
    /// Signal the dispatch and retention loops to stop. In-flight handler
    /// invocations are left to finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_ids(state: &SchedulerState) -> Vec<JobId> {
        state.pending.iter().map(|e| e.job_id).collect()
    }

    #[test]
    fn test_insert_pending_orders_by_priority_then_fifo() {
        let mut state = SchedulerState::default();
        let a = JobId::new();
        let b = JobId::new();
        let c = JobId::new();
        let d = JobId::new();

        insert_pending(&mut state, a, 0);
        insert_pending(&mut state, b, 5);
        insert_pending(&mut state, c, 5);
        insert_pending(&mut state, d, 1);

        // b before c (FIFO within priority 5), then d (1), then a (0)
        assert_eq!(entry_ids(&state), vec![b, c, d, a]);
    }

    #[test]
    fn test_requeue_insertion_is_a_new_scheduling_opportunity() {
        let mut state = SchedulerState::default();
        let first = JobId::new();
        let retried = JobId::new();

        insert_pending(&mut state, first, 2);
        // Retry re-insertion at the same priority lands behind the earlier entry
        insert_pending(&mut state, retried, 2);

        assert_eq!(entry_ids(&state), vec![first, retried]);
    }

    #[test]
    fn test_scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.default_max_retries, 3);
    }
}
