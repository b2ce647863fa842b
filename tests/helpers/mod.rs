//! Test doubles for exercising the processing core without a network or codec.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use ai_edit_orchestrator::config::ProcessingConfig;
use ai_edit_orchestrator::models::job::{ImageFormat, JobId, ProcessingContext, ProcessingJob};
use ai_edit_orchestrator::models::progress::ProcessingProgress;
use ai_edit_orchestrator::services::backend::{
    BackendClient, BackendError, GenerationOutput, GenerationRequest,
};
use ai_edit_orchestrator::services::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use ai_edit_orchestrator::services::orchestrator::ProcessingOrchestrator;
use ai_edit_orchestrator::services::preprocess::{
    ImageInfo, ImagePreprocessor, PreparedImage, PreprocessError,
};
use ai_edit_orchestrator::services::progress::ProgressReporter;
use ai_edit_orchestrator::services::retry::RetryPolicy;

pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Bytes that sniff as PNG, padded to `size`.
pub fn png_bytes(size: usize) -> Vec<u8> {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.resize(size.max(PNG_MAGIC.len()), 0);
    bytes
}

/// Scripted backend. Responses are consumed in order; once the script runs
/// out every call succeeds.
#[derive(Default)]
pub struct FakeBackend {
    script: Mutex<VecDeque<Result<GenerationOutput, BackendError>>>,
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
    prompts: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
    panic_on: Option<String>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first calls with the given errors, in order.
    pub fn failing_with(errors: impl IntoIterator<Item = BackendError>) -> Self {
        let backend = Self::new();
        backend
            .script
            .lock()
            .unwrap()
            .extend(errors.into_iter().map(Err));
        backend
    }

    /// Every call waits for a permit on `gate` before answering.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    /// Panics mid-call for any prompt starting with `prefix`.
    pub fn panicking_on(prefix: &str) -> Self {
        Self {
            panic_on: Some(prefix.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn default_model(&self) -> &str {
        "fake-model"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _timeout: Duration,
    ) -> Result<GenerationOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        self.prompts.lock().unwrap().push(request.prompt.clone());

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if let Some(prefix) = &self.panic_on {
            if request.prompt.starts_with(prefix.as_str()) {
                panic!("backend blew up on {prefix:?}");
            }
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let scripted = self.script.lock().unwrap().pop_front();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        scripted.unwrap_or_else(|| {
            Ok(GenerationOutput {
                image: png_bytes(256),
                model: request
                    .model
                    .clone()
                    .unwrap_or_else(|| self.default_model().to_string()),
            })
        })
    }
}

/// Hands images through untouched and reports fixed dimensions.
pub struct PassthroughPreprocessor;

impl ImagePreprocessor for PassthroughPreprocessor {
    fn prepare(
        &self,
        image: &[u8],
        format: ImageFormat,
        _max_dimension: u32,
        _quality: f32,
    ) -> Result<PreparedImage, PreprocessError> {
        Ok(PreparedImage {
            bytes: image.to_vec(),
            format,
            width: 512,
            height: 512,
        })
    }

    fn inspect(&self, image: &[u8]) -> Result<ImageInfo, PreprocessError> {
        let format = ImageFormat::detect(image).ok_or(PreprocessError::UnknownFormat)?;
        Ok(ImageInfo {
            format,
            width: 512,
            height: 512,
        })
    }
}

/// Orchestrator wired to the given backend, plus the shared pieces tests inspect.
pub struct Harness {
    pub config: Arc<ProcessingConfig>,
    pub reporter: Arc<ProgressReporter>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub orchestrator: Arc<ProcessingOrchestrator>,
}

impl Harness {
    pub fn new(config: ProcessingConfig, backend: Arc<FakeBackend>) -> Self {
        Self::with_retry_policy(config, backend, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        config: ProcessingConfig,
        backend: Arc<FakeBackend>,
        retry: RetryPolicy,
    ) -> Self {
        let config = Arc::new(config);
        let reporter = Arc::new(ProgressReporter::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout(),
        }));
        let orchestrator = Arc::new(
            ProcessingOrchestrator::new(
                Arc::clone(&config),
                backend,
                Arc::new(PassthroughPreprocessor),
                Arc::clone(&breakers),
                Arc::clone(&reporter),
            )
            .with_retry_policy(retry),
        );
        Self {
            config,
            reporter,
            breakers,
            orchestrator,
        }
    }
}

pub fn job(image: Vec<u8>, prompt: &str) -> ProcessingJob {
    ProcessingJob::new(image, prompt, Vec::new(), ProcessingContext::default())
}

/// Register the job and subscribe before anything else is published, so the
/// returned task yields the complete progress history.
pub fn record(
    reporter: &ProgressReporter,
    job_id: JobId,
) -> tokio::task::JoinHandle<Vec<ProcessingProgress>> {
    reporter.publish(ProcessingProgress::queued(job_id, 0));
    let stream = reporter.watch(job_id).unwrap();
    tokio::spawn(stream.collect::<Vec<_>>())
}
