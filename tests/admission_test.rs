use std::sync::Arc;
use std::time::Duration;

use ai_edit_orchestrator::config::ProcessingConfig;
use ai_edit_orchestrator::error::ErrorKind;
use ai_edit_orchestrator::models::job::JobId;
use ai_edit_orchestrator::models::progress::{ProcessingProgress, ProcessingStage};
use ai_edit_orchestrator::services::progress::ProgressReporter;
use ai_edit_orchestrator::services::queue::{AdmissionController, QueueError};
use futures::StreamExt;
use tokio::sync::Semaphore;
use uuid::Uuid;

mod helpers;

use helpers::{job, png_bytes, FakeBackend, Harness};

fn controller(config: ProcessingConfig, backend: Arc<FakeBackend>) -> (AdmissionController, Harness) {
    let harness = Harness::new(config, backend);
    let admission = AdmissionController::new(
        Arc::clone(&harness.config),
        Arc::clone(&harness.orchestrator),
        Arc::clone(&harness.reporter),
    );
    (admission, harness)
}

async fn wait_for_calls(backend: &FakeBackend, calls: u32) {
    while backend.calls() < calls {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn terminal(reporter: &ProgressReporter, job_id: JobId) -> ProcessingProgress {
    let history: Vec<_> = reporter.watch(job_id).unwrap().collect().await;
    history.last().cloned().unwrap()
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(FakeBackend::gated(Arc::clone(&gate)));
    let config = ProcessingConfig {
        max_concurrent_requests: 2,
        rate_limit_max_requests: 100,
        ..ProcessingConfig::default()
    };
    let (admission, harness) = controller(config, Arc::clone(&backend));

    let ids: Vec<JobId> = (0..5)
        .map(|i| {
            admission
                .submit(job(png_bytes(256), &format!("edit {i}")))
                .unwrap()
        })
        .collect();

    wait_for_calls(&backend, 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.calls(), 2);
    let stats = admission.stats();
    assert_eq!((stats.running, stats.pending), (2, 3));
    assert_eq!(
        harness.reporter.latest(ids[4]).unwrap().stage,
        ProcessingStage::Queued { position: 2 }
    );

    gate.add_permits(5);
    for id in &ids {
        assert_eq!(terminal(&harness.reporter, *id).await.stage, ProcessingStage::Completed);
    }
    assert_eq!(backend.calls(), 5);
    assert_eq!(backend.max_in_flight(), 2);
}

#[tokio::test]
async fn test_jobs_start_in_submission_order() {
    let backend = Arc::new(FakeBackend::new());
    let config = ProcessingConfig {
        max_concurrent_requests: 1,
        ..ProcessingConfig::default()
    };
    let (admission, harness) = controller(config, Arc::clone(&backend));

    let ids: Vec<JobId> = (0..4)
        .map(|i| {
            admission
                .submit(job(png_bytes(256), &format!("job {i}")))
                .unwrap()
        })
        .collect();
    for id in &ids {
        terminal(&harness.reporter, *id).await;
    }

    assert_eq!(backend.prompts(), vec!["job 0", "job 1", "job 2", "job 3"]);
    for id in &ids {
        let result = admission.result(*id).unwrap();
        assert_eq!(result.job_id, *id);
    }
}

#[tokio::test]
async fn test_cancelling_queued_job_skips_backend() {
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(FakeBackend::gated(Arc::clone(&gate)));
    let config = ProcessingConfig {
        max_concurrent_requests: 1,
        ..ProcessingConfig::default()
    };
    let (admission, harness) = controller(config, Arc::clone(&backend));

    let first = admission.submit(job(png_bytes(256), "first")).unwrap();
    let second = admission.submit(job(png_bytes(256), "second")).unwrap();
    wait_for_calls(&backend, 1).await;

    assert!(admission.cancel(second));
    assert!(!admission.cancel(second));
    assert!(!admission.cancel(Uuid::new_v4()));
    assert_eq!(terminal(&harness.reporter, second).await.stage, ProcessingStage::Cancelled);

    gate.add_permits(1);
    assert_eq!(terminal(&harness.reporter, first).await.stage, ProcessingStage::Completed);
    assert_eq!(backend.calls(), 1);
    assert_eq!(backend.prompts(), vec!["first"]);
}

#[tokio::test]
async fn test_running_job_cancellation_can_be_disabled() {
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(FakeBackend::gated(Arc::clone(&gate)));
    let config = ProcessingConfig {
        enable_cancellation: false,
        ..ProcessingConfig::default()
    };
    let (admission, harness) = controller(config, Arc::clone(&backend));

    let id = admission.submit(job(png_bytes(256), "first")).unwrap();
    wait_for_calls(&backend, 1).await;

    assert!(!admission.cancel(id));
    assert!(!harness.reporter.latest(id).unwrap().can_cancel);

    gate.add_permits(1);
    assert_eq!(terminal(&harness.reporter, id).await.stage, ProcessingStage::Completed);
}

#[tokio::test]
async fn test_full_queue_rejects_submission() {
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(FakeBackend::gated(Arc::clone(&gate)));
    let config = ProcessingConfig {
        max_concurrent_requests: 1,
        max_queue_length: 2,
        ..ProcessingConfig::default()
    };
    let (admission, harness) = controller(config, Arc::clone(&backend));

    let running = admission.submit(job(png_bytes(256), "a")).unwrap();
    admission.submit(job(png_bytes(256), "b")).unwrap();
    admission.submit(job(png_bytes(256), "c")).unwrap();

    let rejected = admission.submit(job(png_bytes(256), "d"));
    assert!(matches!(rejected, Err(QueueError::Full { limit: 2 })));

    gate.add_permits(3);
    terminal(&harness.reporter, running).await;
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_defers_job_starts() {
    let backend = Arc::new(FakeBackend::new());
    let config = ProcessingConfig {
        max_concurrent_requests: 5,
        rate_limit_max_requests: 2,
        rate_limit_window_seconds: 60,
        ..ProcessingConfig::default()
    };
    let (admission, harness) = controller(config, Arc::clone(&backend));
    admission.start();

    let ids: Vec<JobId> = (0..3)
        .map(|i| {
            admission
                .submit(job(png_bytes(256), &format!("job {i}")))
                .unwrap()
        })
        .collect();
    for id in &ids {
        assert_eq!(terminal(&harness.reporter, *id).await.stage, ProcessingStage::Completed);
    }

    let times = backend.call_times();
    assert_eq!(times.len(), 3);
    assert!(times[1] - times[0] < Duration::from_secs(1));
    assert!(times[2] - times[0] >= Duration::from_secs(59));

    admission.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_pending_and_running_jobs() {
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(FakeBackend::gated(Arc::clone(&gate)));
    let config = ProcessingConfig {
        max_concurrent_requests: 1,
        ..ProcessingConfig::default()
    };
    let (admission, harness) = controller(config, Arc::clone(&backend));
    admission.start();

    let running = admission.submit(job(png_bytes(256), "running")).unwrap();
    let pending = admission.submit(job(png_bytes(256), "pending")).unwrap();
    wait_for_calls(&backend, 1).await;

    let shutdown = tokio::spawn({
        let admission = admission.clone();
        async move { admission.shutdown().await }
    });
    while !harness
        .reporter
        .latest(pending)
        .is_some_and(|p| p.is_terminal())
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The in-flight call finishes; the job stops at the next stage boundary.
    gate.add_permits(1);
    shutdown.await.unwrap();

    assert_eq!(terminal(&harness.reporter, pending).await.stage, ProcessingStage::Cancelled);
    assert_eq!(terminal(&harness.reporter, running).await.stage, ProcessingStage::Cancelled);
    assert_eq!(backend.calls(), 1);
    assert!(matches!(
        admission.submit(job(png_bytes(256), "late")),
        Err(QueueError::ShutDown)
    ));
}

#[tokio::test]
async fn test_panicking_job_frees_slot_for_next_job() {
    let backend = Arc::new(FakeBackend::panicking_on("boom"));
    let config = ProcessingConfig {
        max_concurrent_requests: 1,
        ..ProcessingConfig::default()
    };
    let (admission, harness) = controller(config, Arc::clone(&backend));

    let crashed = admission.submit(job(png_bytes(256), "boom")).unwrap();
    let next = admission.submit(job(png_bytes(256), "fine")).unwrap();

    assert!(matches!(
        terminal(&harness.reporter, crashed).await.stage,
        ProcessingStage::Error {
            kind: ErrorKind::Permanent,
            ..
        }
    ));
    let finished = tokio::time::timeout(Duration::from_secs(2), terminal(&harness.reporter, next))
        .await
        .expect("queued job never started after the running one panicked");
    assert_eq!(finished.stage, ProcessingStage::Completed);

    let stats = admission.stats();
    assert_eq!((stats.running, stats.pending), (0, 0));
    assert_eq!(backend.prompts(), vec!["boom", "fine"]);
}

#[tokio::test(start_paused = true)]
async fn test_submit_drains_freed_window_before_checking_capacity() {
    let backend = Arc::new(FakeBackend::new());
    let config = ProcessingConfig {
        rate_limit_max_requests: 1,
        rate_limit_window_seconds: 60,
        max_queue_length: 1,
        ..ProcessingConfig::default()
    };
    let (admission, harness) = controller(config, Arc::clone(&backend));

    let first = admission.submit(job(png_bytes(256), "first")).unwrap();
    let second = admission.submit(job(png_bytes(256), "second")).unwrap();
    terminal(&harness.reporter, first).await;
    assert_eq!(admission.stats().pending, 1);

    // No scheduler: only the next submit notices the window has passed.
    tokio::time::advance(Duration::from_secs(60)).await;
    let third = admission.submit(job(png_bytes(256), "third"));
    assert!(third.is_ok(), "{third:?}");

    assert_eq!(terminal(&harness.reporter, second).await.stage, ProcessingStage::Completed);
    assert_eq!(admission.stats().pending, 1);
    assert_eq!(backend.prompts(), vec!["first", "second"]);
}
