use std::sync::Arc;

use crate::config::ProcessingConfig;
use crate::models::job::{JobId, Marker, ProcessingContext, ProcessingJob};
use crate::models::progress::ProcessingProgress;
use crate::services::{
    backend::BackendClient,
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry},
    orchestrator::ProcessingOrchestrator,
    preprocess::ImagePreprocessor,
    progress::{ProgressReporter, ProgressStream},
    queue::{AdmissionController, QueueError},
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProcessingConfig>,
    pub admission: AdmissionController,
    pub reporter: Arc<ProgressReporter>,
    pub breakers: Arc<CircuitBreakerRegistry>,
}

impl AppState {
    /// Wire the processing core around a backend and an image preprocessor.
    ///
    /// The admission scheduler is not started; call `admission.start()` once
    /// a runtime is available.
    pub fn new(
        config: ProcessingConfig,
        backend: Arc<dyn BackendClient>,
        preprocessor: Arc<dyn ImagePreprocessor>,
    ) -> Self {
        let config = Arc::new(config);
        let reporter = Arc::new(ProgressReporter::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout(),
        }));
        let orchestrator = Arc::new(ProcessingOrchestrator::new(
            Arc::clone(&config),
            backend,
            preprocessor,
            Arc::clone(&breakers),
            Arc::clone(&reporter),
        ));
        let admission =
            AdmissionController::new(Arc::clone(&config), orchestrator, Arc::clone(&reporter));

        Self {
            config,
            admission,
            reporter,
            breakers,
        }
    }

    /// Queue an edit. Returns as soon as the job is registered.
    pub fn submit(
        &self,
        image: Vec<u8>,
        prompt: impl Into<String>,
        markers: Vec<Marker>,
        context: ProcessingContext,
    ) -> Result<JobId, QueueError> {
        let job = ProcessingJob::new(image, prompt, markers, context);
        self.admission.submit(job)
    }

    /// Replay-last stream of a job's progress, `None` for unknown jobs.
    pub fn watch_progress(&self, job_id: JobId) -> Option<ProgressStream> {
        self.reporter.watch(job_id)
    }

    pub fn latest_progress(&self, job_id: JobId) -> Option<ProcessingProgress> {
        self.reporter.latest(job_id)
    }

    pub fn cancel(&self, job_id: JobId) -> bool {
        self.admission.cancel(job_id)
    }
}
