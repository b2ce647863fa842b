//! Per-job progress channels with replay-last semantics.

use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use crate::models::job::JobId;
use crate::models::progress::ProcessingProgress;

/// Buffered live events per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 64;

/// Finished jobs kept around for late subscribers.
const FINISHED_RETENTION: usize = 1024;

pub type ProgressStream = Pin<Box<dyn Stream<Item = ProcessingProgress> + Send>>;

struct JobChannel {
    last: ProcessingProgress,
    // Dropped after the terminal emission, which ends every live stream.
    sender: Option<broadcast::Sender<ProcessingProgress>>,
}

#[derive(Default)]
struct Channels {
    jobs: HashMap<JobId, JobChannel>,
    finished: VecDeque<JobId>,
}

/// Fan-out of [`ProcessingProgress`] snapshots to any number of observers.
///
/// Enforces the stream contract: progress never decreases before a terminal
/// stage, exactly one terminal value is emitted, nothing follows it.
#[derive(Default)]
pub struct ProgressReporter {
    channels: Mutex<Channels>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a snapshot. Returns `false` if the job already terminated.
    pub fn publish(&self, mut progress: ProcessingProgress) -> bool {
        let mut channels = self.lock();
        let job_id = progress.job_id;

        let Some(channel) = channels.jobs.get_mut(&job_id) else {
            let terminal = progress.is_terminal();
            let sender = (!terminal).then(|| broadcast::channel(CHANNEL_CAPACITY).0);
            channels.jobs.insert(
                job_id,
                JobChannel {
                    last: progress,
                    sender,
                },
            );
            if terminal {
                Self::retire(&mut channels, job_id);
            }
            return true;
        };

        if channel.last.is_terminal() {
            tracing::debug!(job_id = %job_id, stage = progress.stage.name(), "Dropping progress after terminal stage");
            return false;
        }

        if progress.progress < channel.last.progress {
            progress.progress = channel.last.progress;
        }
        let terminal = progress.is_terminal();
        channel.last = progress.clone();
        if let Some(sender) = &channel.sender {
            // No receivers is fine; late subscribers replay `last`.
            let _ = sender.send(progress);
        }
        if terminal {
            channel.sender = None;
            Self::retire(&mut channels, job_id);
        }
        true
    }

    /// Most recent snapshot for a job.
    pub fn latest(&self, job_id: JobId) -> Option<ProcessingProgress> {
        self.lock().jobs.get(&job_id).map(|c| c.last.clone())
    }

    /// Subscribe to a job: yields the latest snapshot first, then live
    /// updates, and ends after the terminal snapshot.
    pub fn watch(&self, job_id: JobId) -> Option<ProgressStream> {
        let (last, receiver) = {
            let channels = self.lock();
            let channel = channels.jobs.get(&job_id)?;
            (
                channel.last.clone(),
                channel.sender.as_ref().map(|s| s.subscribe()),
            )
        };

        let stream = async_stream::stream! {
            let done = last.is_terminal();
            yield last;
            if done {
                return;
            }
            let Some(mut receiver) = receiver else {
                return;
            };
            loop {
                match receiver.recv().await {
                    Ok(progress) => {
                        let terminal = progress.is_terminal();
                        yield progress;
                        if terminal {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(job_id = %job_id, skipped, "Progress subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Some(Box::pin(stream))
    }

    fn retire(channels: &mut Channels, job_id: JobId) {
        channels.finished.push_back(job_id);
        while channels.finished.len() > FINISHED_RETENTION {
            if let Some(expired) = channels.finished.pop_front() {
                channels.jobs.remove(&expired);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
