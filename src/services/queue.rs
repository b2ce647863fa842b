//! Admission control: bounded FIFO queue in front of the orchestrator.
//!
//! A job starts only when both a concurrency slot and a rate-limit permit
//! are available. Pending jobs are drained on submit, whenever a running job
//! finishes, and on a periodic scheduler tick (for rate-limit windows that
//! free up on their own).

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ProcessingConfig;
use crate::error::{ErrorKind, ProcessingError};
use crate::models::job::{JobId, ProcessingJob};
use crate::models::progress::{ProcessingProgress, ProcessingStage};
use crate::services::orchestrator::{ProcessingOrchestrator, ProcessingResult};
use crate::services::progress::ProgressReporter;
use crate::services::rate_limiter::SlidingWindowLimiter;

/// Completed results kept for pickup.
const RESULT_RETENTION: usize = 64;

struct QueueEntry {
    seq: u64,
    job: ProcessingJob,
}

struct RunningJob {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct AdmissionState {
    pending: VecDeque<QueueEntry>,
    running: HashMap<JobId, RunningJob>,
    limiter: SlidingWindowLimiter,
    results: HashMap<JobId, ProcessingResult>,
    result_order: VecDeque<JobId>,
    next_seq: u64,
    shut_down: bool,
}

struct Shared {
    config: Arc<ProcessingConfig>,
    orchestrator: Arc<ProcessingOrchestrator>,
    reporter: Arc<ProgressReporter>,
    state: Mutex<AdmissionState>,
    shutdown: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

/// Queue depth and slot usage, for health checks.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub max_concurrent: usize,
    pub max_queue_length: usize,
    pub rate_limit_available: usize,
}

/// Bounds how many jobs run at once and how fast new ones start.
#[derive(Clone)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    pub fn new(
        config: Arc<ProcessingConfig>,
        orchestrator: Arc<ProcessingOrchestrator>,
        reporter: Arc<ProgressReporter>,
    ) -> Self {
        let limiter =
            SlidingWindowLimiter::new(config.rate_limit_max_requests, config.rate_limit_window());
        Self {
            shared: Arc::new(Shared {
                config,
                orchestrator,
                reporter,
                state: Mutex::new(AdmissionState {
                    pending: VecDeque::new(),
                    running: HashMap::new(),
                    limiter,
                    results: HashMap::new(),
                    result_order: VecDeque::new(),
                    next_seq: 0,
                    shut_down: false,
                }),
                shutdown: CancellationToken::new(),
                scheduler: Mutex::new(None),
            }),
        }
    }

    /// Spawn the periodic drain task. Idempotent.
    pub fn start(&self) {
        let mut scheduler = self
            .shared
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if scheduler.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        *scheduler = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.scheduler_tick());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = ticker.tick() => shared.drain_now(),
                }
            }
            tracing::debug!("Admission scheduler stopped");
        }));
        tracing::info!(
            max_concurrent = self.shared.config.max_concurrent_requests,
            rate_limit = self.shared.config.rate_limit_max_requests,
            rate_window_secs = self.shared.config.rate_limit_window_seconds,
            "Admission scheduler started"
        );
    }

    /// Accept a job without blocking. It starts immediately when a slot and
    /// quota are free, otherwise it waits in FIFO order.
    pub fn submit(&self, job: ProcessingJob) -> Result<JobId, QueueError> {
        let job_id = job.id;
        let mut state = self.shared.lock();

        if state.shut_down {
            return Err(QueueError::ShutDown);
        }
        // Start whatever a freed rate-limit window allows before judging capacity.
        self.shared.drain(&mut state);
        let limit = self.shared.config.max_queue_length;
        if state.pending.len() >= limit {
            metrics::counter!("processing_jobs_rejected_total").increment(1);
            tracing::warn!(job_id = %job_id, pending = state.pending.len(), "Queue full, rejecting job");
            return Err(QueueError::Full { limit });
        }

        let position = state.pending.len();
        self.shared
            .reporter
            .publish(ProcessingProgress::queued(job_id, position));

        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push_back(QueueEntry { seq, job });
        metrics::counter!("processing_jobs_submitted_total").increment(1);
        tracing::info!(job_id = %job_id, seq, position, "Job submitted");

        self.shared.drain(&mut state);
        Ok(job_id)
    }

    /// Cancel a job. Queued jobs are dropped on the spot; running jobs are
    /// signalled and stop at their next stage boundary.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let mut state = self.shared.lock();

        if let Some(index) = state.pending.iter().position(|e| e.job.id == job_id) {
            if let Some(entry) = state.pending.remove(index) {
                entry.job.cancel.cancel();
                drop(entry);
                self.shared.publish_cancelled(job_id, "Cancelled before processing started");
                metrics::counter!("processing_jobs_cancelled_total").increment(1);
                tracing::info!(job_id = %job_id, "Queued job cancelled");
                self.shared.republish_positions(&state);
                return true;
            }
        }

        match state.running.get(&job_id) {
            Some(_) if !self.shared.config.enable_cancellation => false,
            Some(running) => {
                running.cancel.cancel();
                tracing::info!(job_id = %job_id, "Cancellation requested for running job");
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> QueueStats {
        let mut state = self.shared.lock();
        let rate_limit_available = state.limiter.available(Instant::now());
        QueueStats {
            pending: state.pending.len(),
            running: state.running.len(),
            max_concurrent: self.shared.config.max_concurrent_requests,
            max_queue_length: self.shared.config.max_queue_length,
            rate_limit_available,
        }
    }

    /// Result of a recently completed job.
    pub fn result(&self, job_id: JobId) -> Option<ProcessingResult> {
        self.shared.lock().results.get(&job_id).cloned()
    }

    /// Stop scheduling, cancel everything and wait for running jobs to wind down.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let scheduler = self
            .shared
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = scheduler {
            let _ = handle.await;
        }

        let (pending, handles) = {
            let mut state = self.shared.lock();
            state.shut_down = true;
            let pending: Vec<QueueEntry> = state.pending.drain(..).collect();
            let handles: Vec<JoinHandle<()>> = state
                .running
                .values_mut()
                .filter_map(|running| {
                    running.cancel.cancel();
                    running.handle.take()
                })
                .collect();
            (pending, handles)
        };

        tracing::info!(
            pending = pending.len(),
            running = handles.len(),
            "Shutting down admission controller"
        );
        for entry in pending {
            entry.job.cancel.cancel();
            self.shared
                .publish_cancelled(entry.job.id, "Cancelled by shutdown");
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain_now(self: &Arc<Self>) {
        let mut state = self.lock();
        self.drain(&mut state);
    }

    /// Start queued jobs while a slot and a rate-limit permit are free.
    fn drain(self: &Arc<Self>, state: &mut AdmissionState) {
        if state.shut_down {
            return;
        }
        let now = Instant::now();
        let mut launched = 0;
        while state.running.len() < self.config.max_concurrent_requests && !state.pending.is_empty() {
            if !state.limiter.try_acquire(now) {
                tracing::debug!(
                    pending = state.pending.len(),
                    retry_after_ms = state
                        .limiter
                        .retry_after(now)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0),
                    "Rate limit reached, holding queued jobs"
                );
                break;
            }
            let Some(entry) = state.pending.pop_front() else {
                break;
            };
            self.launch(state, entry);
            launched += 1;
        }

        if launched > 0 {
            self.republish_positions(state);
        }
        metrics::gauge!("processing_queue_depth").set(state.pending.len() as f64);
        metrics::gauge!("processing_running_jobs").set(state.running.len() as f64);
    }

    fn launch(self: &Arc<Self>, state: &mut AdmissionState, entry: QueueEntry) {
        let QueueEntry { seq, job } = entry;
        let job_id = job.id;
        let cancel = job.cancel.clone();
        let waited_ms = (Utc::now() - job.submitted_at).num_milliseconds().max(0);
        tracing::debug!(job_id = %job_id, seq, waited_ms, "Starting job");

        let slot = SlotGuard {
            shared: Arc::clone(self),
            job_id,
            released: false,
        };
        let orchestrator = Arc::clone(&self.orchestrator);
        let handle = tokio::spawn(async move {
            let outcome = orchestrator.run(job).await;
            slot.complete(outcome);
        });

        state.running.insert(
            job_id,
            RunningJob {
                cancel,
                handle: Some(handle),
            },
        );
    }

    fn finish(self: &Arc<Self>, job_id: JobId, outcome: Result<ProcessingResult, ProcessingError>) {
        let mut state = self.lock();
        state.running.remove(&job_id);
        if let Ok(result) = outcome {
            state.results.insert(job_id, result);
            state.result_order.push_back(job_id);
            while state.result_order.len() > RESULT_RETENTION {
                if let Some(expired) = state.result_order.pop_front() {
                    state.results.remove(&expired);
                }
            }
        }
        self.drain(&mut state);
    }

    fn publish_cancelled(&self, job_id: JobId, message: &str) {
        self.reporter.publish(ProcessingProgress::new(
            job_id,
            ProcessingStage::Cancelled,
            0.0,
            message,
        ));
    }

    fn republish_positions(&self, state: &AdmissionState) {
        for (position, entry) in state.pending.iter().enumerate() {
            self.reporter
                .publish(ProcessingProgress::queued(entry.job.id, position));
        }
    }
}

/// Owns a concurrency slot for the lifetime of one job task.
struct SlotGuard {
    shared: Arc<Shared>,
    job_id: JobId,
    released: bool,
}

impl SlotGuard {
    fn complete(mut self, outcome: Result<ProcessingResult, ProcessingError>) {
        self.released = true;
        self.shared.finish(self.job_id, outcome);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // The job task panicked or was aborted: free the slot and end the stream.
        tracing::error!(job_id = %self.job_id, "Job task ended without completing");
        self.shared.reporter.publish(ProcessingProgress::new(
            self.job_id,
            ProcessingStage::Error {
                kind: ErrorKind::Permanent,
                detail: "processing task ended unexpectedly".into(),
            },
            0.0,
            "The edit could not be produced",
        ));
        let mut state = self.shared.lock();
        state.running.remove(&self.job_id);
        if tokio::runtime::Handle::try_current().is_ok() {
            self.shared.drain(&mut state);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full ({limit} jobs pending)")]
    Full { limit: usize },

    #[error("Admission controller is shut down")]
    ShutDown,
}
