//! Drives one job through the processing pipeline.
//!
//! `initializing -> validating -> preprocessing -> analyzing -> model_call ->
//! post_processing -> completed`, with `cancelled` and `error` reachable from
//! any working stage. Backend failures are retried in place at `model_call`.

use garde::Validate;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ProcessingConfig;
use crate::error::{ErrorKind, ProcessingError, ValidationError};
use crate::models::job::{EditRequest, ImageFormat, JobId, ProcessingJob};
use crate::models::progress::{ProcessingProgress, ProcessingStage};
use crate::services::backend::{BackendClient, BackendError, GenerationOutput, GenerationRequest};
use crate::services::circuit_breaker::{CircuitBreakerRegistry, CircuitError};
use crate::services::preprocess::{ImagePreprocessor, PreparedImage, PreprocessError};
use crate::services::progress::ProgressReporter;
use crate::services::retry::{RetryDecision, RetryPolicy};

/// Output of a completed job.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub job_id: JobId,
    #[serde(skip)]
    pub image: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub model: String,
    /// Backend attempts, including the successful one.
    pub attempts: u32,
    pub elapsed_ms: u64,
    /// The untouched upload, kept only when memory optimization is off.
    #[serde(skip)]
    pub original: Option<Vec<u8>>,
}

pub struct ProcessingOrchestrator {
    config: Arc<ProcessingConfig>,
    backend: Arc<dyn BackendClient>,
    preprocessor: Arc<dyn ImagePreprocessor>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    reporter: Arc<ProgressReporter>,
}

impl ProcessingOrchestrator {
    pub fn new(
        config: Arc<ProcessingConfig>,
        backend: Arc<dyn BackendClient>,
        preprocessor: Arc<dyn ImagePreprocessor>,
        breakers: Arc<CircuitBreakerRegistry>,
        reporter: Arc<ProgressReporter>,
    ) -> Self {
        Self {
            config,
            backend,
            preprocessor,
            breakers,
            retry: RetryPolicy::default(),
            reporter,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run a job to its terminal stage, publishing progress along the way.
    ///
    /// Exactly one terminal snapshot is published, after all job buffers
    /// have been released.
    pub async fn run(&self, job: ProcessingJob) -> Result<ProcessingResult, ProcessingError> {
        let job_id = job.id;
        let mut tracker = StageTracker::new(
            job_id,
            Arc::clone(&self.reporter),
            self.config.enable_cancellation,
        );

        tracing::info!(job_id = %job_id, "Processing job");
        let outcome = self.execute(job, &mut tracker).await;
        let elapsed = tracker.started.elapsed();

        match &outcome {
            Ok(result) => {
                tracker.finish(ProcessingStage::Completed, "Edit complete", 1.0);
                metrics::counter!("processing_jobs_completed_total").increment(1);
                tracing::info!(
                    job_id = %job_id,
                    attempts = result.attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
            }
            Err(ProcessingError::Cancelled) => {
                tracker.finish(ProcessingStage::Cancelled, "Processing cancelled", 0.0);
                metrics::counter!("processing_jobs_cancelled_total").increment(1);
                tracing::info!(job_id = %job_id, stage = tracker.stage.name(), "Job cancelled");
            }
            Err(err) => {
                let kind = err.kind();
                tracker.finish(
                    ProcessingStage::Error {
                        kind,
                        detail: err.to_string(),
                    },
                    failure_message(kind),
                    0.0,
                );
                metrics::counter!("processing_jobs_failed_total", "kind" => kind.to_string())
                    .increment(1);
                if kind == ErrorKind::Validation {
                    tracing::info!(job_id = %job_id, error = %err, "Job rejected by validation");
                } else if kind.is_transient() {
                    tracing::warn!(job_id = %job_id, kind = %kind, error = %err, "Job failed after retries");
                } else {
                    tracing::error!(job_id = %job_id, kind = %kind, error = %err, "Job failed");
                }
            }
        }
        metrics::histogram!("processing_duration_seconds").record(elapsed.as_secs_f64());

        outcome
    }

    async fn execute(
        &self,
        job: ProcessingJob,
        tracker: &mut StageTracker,
    ) -> Result<ProcessingResult, ProcessingError> {
        let ProcessingJob {
            id: job_id,
            image,
            request,
            cancel,
            ..
        } = job;

        tracker.enter(ProcessingStage::Initializing, "Preparing job");
        checkpoint(&cancel)?;

        // ── Validating ───────────────────────────────────────────────────
        tracker.enter(ProcessingStage::Validating, "Validating image and prompt");
        let format = self.validate_input(&image, &request)?;
        tracker.advance(1.0, "Input is valid");
        checkpoint(&cancel)?;

        // ── Preprocessing ────────────────────────────────────────────────
        tracker.enter(ProcessingStage::Preprocessing, "Optimizing image");
        let (prepared, original) = self.preprocess(image, format).await?;
        tracker.emit(
            tracker
                .snapshot(1.0, "Image optimized")
                .with_metadata("width", prepared.width)
                .with_metadata("height", prepared.height)
                .with_metadata("bytes", prepared.bytes.len()),
        );
        checkpoint(&cancel)?;

        // ── Analyzing ────────────────────────────────────────────────────
        tracker.enter(ProcessingStage::Analyzing, "Building edit instructions");
        let generation = GenerationRequest {
            prompt: build_prompt(&request),
            image: prepared.bytes,
            format: prepared.format,
            model: request.context.model.clone(),
            quality: request.context.quality,
            strength: request.context.strength,
        };
        tracker.advance(1.0, "Edit instructions ready");
        checkpoint(&cancel)?;

        // ── Model call ───────────────────────────────────────────────────
        let (output, attempts) = self
            .call_backend(job_id, &generation, &cancel, tracker)
            .await?;
        drop(generation);
        checkpoint(&cancel)?;

        // ── Post-processing ──────────────────────────────────────────────
        tracker.enter(ProcessingStage::PostProcessing, "Finalizing result");
        let result = self.post_process(job_id, output, attempts, original, tracker)?;
        tracker.advance(1.0, "Result ready");

        Ok(result)
    }

    fn validate_input(&self, image: &[u8], request: &EditRequest) -> Result<ImageFormat, ValidationError> {
        let size = image.len() as u64;
        if !self.config.is_image_size_valid(size) {
            return Err(ValidationError::ImageTooLarge {
                size,
                limit: self.config.max_image_size_bytes,
            });
        }
        if image.is_empty() {
            return Err(ValidationError::EmptyImage);
        }

        let format = ImageFormat::detect(image)
            .ok_or_else(|| ValidationError::UnsupportedFormat("unrecognised".into()))?;
        if !self.config.is_format_supported(format) {
            return Err(ValidationError::UnsupportedFormat(format.to_string()));
        }

        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        let length = prompt.chars().count();
        if length > self.config.max_prompt_length {
            return Err(ValidationError::PromptTooLong {
                length,
                limit: self.config.max_prompt_length,
            });
        }

        request
            .validate()
            .map_err(|report| ValidationError::InvalidRequest(report.to_string()))?;

        Ok(format)
    }

    /// Returns the prepared image and, when memory optimization is off, the original.
    async fn preprocess(
        &self,
        image: Vec<u8>,
        format: ImageFormat,
    ) -> Result<(PreparedImage, Option<Vec<u8>>), ProcessingError> {
        let preprocessor = Arc::clone(&self.preprocessor);
        let max_dimension = self.config.max_image_dimension;
        let quality = self.config.preprocessing_quality;
        let keep_original = !self.config.enable_memory_optimization;

        let (prepared, image) = tokio::task::spawn_blocking(move || {
            let prepared = preprocessor.prepare(&image, format, max_dimension, quality);
            (prepared, image)
        })
        .await
        .map_err(|e| PreprocessError::Task(e.to_string()))?;

        let original = if keep_original { Some(image) } else { None };
        Ok((prepared?, original))
    }

    /// The only stage that talks to the backend. Retries re-enter this stage.
    async fn call_backend(
        &self,
        job_id: JobId,
        request: &GenerationRequest,
        cancel: &CancellationToken,
        tracker: &mut StageTracker,
    ) -> Result<(GenerationOutput, u32), ProcessingError> {
        let model = request
            .model
            .as_deref()
            .unwrap_or_else(|| self.backend.default_model());
        let key = format!("{}/{}", self.backend.name(), model);
        let breaker = self.breakers.get(&key);
        let limit = self.config.max_processing_time();

        let mut attempt: u32 = 0;
        loop {
            checkpoint(cancel)?;
            tracker.enter(
                ProcessingStage::ModelCall { attempt },
                if attempt == 0 {
                    "Generating edit".to_string()
                } else {
                    format!("Generating edit (retry {attempt})")
                },
            );

            let started = Instant::now();
            let outcome = breaker
                .call(|| async {
                    match tokio::time::timeout(limit, self.backend.generate(request, limit)).await {
                        Ok(result) => result,
                        Err(_) => Err(BackendError::Timeout(limit)),
                    }
                })
                .await;

            let err = match outcome {
                Ok(output) => {
                    tracing::info!(
                        job_id = %job_id,
                        backend = %key,
                        attempt,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "Backend call succeeded"
                    );
                    tracker.advance(1.0, "Edit generated");
                    return Ok((output, attempt + 1));
                }
                Err(CircuitError::Open { backend }) => ProcessingError::CircuitOpen { backend },
                Err(CircuitError::Inner(err)) => ProcessingError::Backend(err),
            };

            let kind = err.kind();
            match self.retry.decide(kind, attempt) {
                RetryDecision::RetryAfter(delay) => {
                    metrics::counter!("processing_backend_retries_total", "kind" => kind.to_string())
                        .increment(1);
                    tracing::warn!(
                        job_id = %job_id,
                        backend = %key,
                        attempt,
                        kind = %kind,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Backend call failed, retrying"
                    );
                    tracker.emit(
                        tracker
                            .snapshot(0.0, retry_message(kind, delay))
                            .with_metadata("retry_kind", kind.to_string())
                            .with_metadata("retry_in_seconds", delay.as_secs_f64()),
                    );
                    wait_or_cancel(delay, cancel).await?;
                    attempt += 1;
                }
                RetryDecision::GiveUp(_) => return Err(err),
            }
        }
    }

    fn post_process(
        &self,
        job_id: JobId,
        output: GenerationOutput,
        attempts: u32,
        original: Option<Vec<u8>>,
        tracker: &StageTracker,
    ) -> Result<ProcessingResult, ProcessingError> {
        if output.image.is_empty() {
            return Err(ProcessingError::PostProcessing("backend returned no image".into()));
        }
        let info = self
            .preprocessor
            .inspect(&output.image)
            .map_err(|e| ProcessingError::PostProcessing(e.to_string()))?;

        Ok(ProcessingResult {
            job_id,
            image: output.image,
            format: info.format,
            width: info.width,
            height: info.height,
            model: output.model,
            attempts,
            elapsed_ms: tracker.started.elapsed().as_millis() as u64,
            original,
        })
    }
}

/// Honour a pending cancellation at a stage boundary.
fn checkpoint(cancel: &CancellationToken) -> Result<(), ProcessingError> {
    if cancel.is_cancelled() {
        Err(ProcessingError::Cancelled)
    } else {
        Ok(())
    }
}

async fn wait_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), ProcessingError> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(ProcessingError::Cancelled),
    }
}

/// User prompt plus marker regions and constraints.
fn build_prompt(request: &EditRequest) -> String {
    let mut prompt = request.prompt.trim().to_string();

    if !request.markers.is_empty() {
        let regions: Vec<String> = request
            .markers
            .iter()
            .map(|m| {
                let position = format!("({:.0}% from left, {:.0}% from top)", m.x * 100.0, m.y * 100.0);
                match &m.label {
                    Some(label) => format!("{label} at {position}"),
                    None => format!("region at {position}"),
                }
            })
            .collect();
        prompt.push_str("\nFocus the edit on: ");
        prompt.push_str(&regions.join("; "));
    }

    if !request.context.constraints.is_empty() {
        prompt.push_str("\nConstraints: ");
        prompt.push_str(&request.context.constraints.join("; "));
    }

    prompt
}

fn retry_message(kind: ErrorKind, delay: Duration) -> String {
    let reason = match kind {
        ErrorKind::RateLimited => "AI service rate limit reached",
        ErrorKind::ServiceOverloaded => "AI service is busy",
        ErrorKind::Timeout => "AI service timed out",
        ErrorKind::TransientNetwork => "Could not reach the AI service",
        _ => "AI service call failed",
    };
    format!("{reason}, retrying in {}s", delay.as_secs())
}

fn failure_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "The image or prompt was rejected",
        ErrorKind::RateLimited | ErrorKind::ServiceOverloaded => "The AI service is busy",
        ErrorKind::Timeout => "The AI service took too long to respond",
        ErrorKind::QuotaExceeded => "The AI usage quota is exhausted",
        ErrorKind::TransientNetwork => "Could not reach the AI service",
        ErrorKind::CircuitOpen => "The AI service is temporarily unavailable",
        ErrorKind::Permanent => "The edit could not be produced",
        ErrorKind::Cancelled => "Processing cancelled",
    }
}

/// Publishes snapshots for one job, tracking the current stage.
struct StageTracker {
    job_id: JobId,
    reporter: Arc<ProgressReporter>,
    cancellable: bool,
    started: Instant,
    stage: ProcessingStage,
}

impl StageTracker {
    fn new(job_id: JobId, reporter: Arc<ProgressReporter>, cancellable: bool) -> Self {
        Self {
            job_id,
            reporter,
            cancellable,
            started: Instant::now(),
            stage: ProcessingStage::Initializing,
        }
    }

    fn enter(&mut self, stage: ProcessingStage, message: impl Into<String>) {
        self.stage = stage;
        self.emit(self.snapshot(0.0, message));
    }

    fn advance(&self, fraction: f64, message: impl Into<String>) {
        self.emit(self.snapshot(fraction, message));
    }

    fn snapshot(&self, fraction: f64, message: impl Into<String>) -> ProcessingProgress {
        let progress = self.stage.overall(fraction);
        let mut snapshot = ProcessingProgress::new(self.job_id, self.stage.clone(), progress, message);
        snapshot.can_cancel = self.cancellable;
        snapshot.estimated_seconds_remaining = self.estimate_remaining(progress);
        snapshot
    }

    fn emit(&self, snapshot: ProcessingProgress) {
        self.reporter.publish(snapshot);
    }

    fn finish(&self, stage: ProcessingStage, message: &str, progress: f64) {
        let snapshot = ProcessingProgress::new(self.job_id, stage, progress, message)
            .with_metadata("elapsed_ms", self.started.elapsed().as_millis() as u64);
        self.reporter.publish(snapshot);
    }

    /// Linear extrapolation from elapsed time; too noisy below 10%.
    fn estimate_remaining(&self, progress: f64) -> Option<f64> {
        if progress < 0.10 || progress >= 1.0 {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        Some(elapsed / progress * (1.0 - progress))
    }
}
