use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use ai_edit_orchestrator::app_state::AppState;
use ai_edit_orchestrator::config::{AppConfig, ProcessingConfig};
use ai_edit_orchestrator::routes;
use ai_edit_orchestrator::services::{preprocess::ImageCratePreprocessor, workers_ai::WorkersAiClient};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    let processing =
        ProcessingConfig::from_env().expect("Failed to load processing configuration");

    tracing::info!(
        max_concurrent = processing.max_concurrent_requests,
        max_image_size_bytes = processing.max_image_size_bytes,
        "Initializing ai-edit-orchestrator server"
    );

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("processing_jobs_submitted_total", "Total edit jobs accepted");
    metrics::describe_counter!(
        "processing_jobs_rejected_total",
        "Total edit jobs rejected because the queue was full"
    );
    metrics::describe_counter!("processing_jobs_completed_total", "Total edit jobs completed");
    metrics::describe_counter!(
        "processing_jobs_failed_total",
        "Total edit jobs that failed, by error kind"
    );
    metrics::describe_counter!("processing_jobs_cancelled_total", "Total edit jobs cancelled");
    metrics::describe_counter!(
        "processing_backend_retries_total",
        "Backend retries, by error kind"
    );
    metrics::describe_histogram!(
        "processing_duration_seconds",
        "Time from job start to its terminal stage"
    );
    metrics::describe_gauge!("processing_queue_depth", "Jobs waiting for admission");
    metrics::describe_gauge!("processing_running_jobs", "Jobs currently being processed");

    // Initialize Workers AI client
    tracing::info!("Initializing Cloudflare Workers AI client");
    let mut backend = WorkersAiClient::new(&config.cf_account_id, &config.cf_api_token)
        .expect("Failed to initialize Workers AI client");
    if let Some(model) = &config.cf_model {
        backend = backend.with_default_model(model.clone());
    }

    let body_limit = processing.upload_body_limit();

    // Create shared application state and start admitting jobs
    let state = AppState::new(
        processing,
        Arc::new(backend),
        Arc::new(ImageCratePreprocessor),
    );
    state.admission.start();
    let admission = state.admission.clone();

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/jobs", post(routes::jobs::submit_job))
        .route(
            "/api/v1/jobs/{job_id}",
            get(routes::jobs::get_job_status).delete(routes::jobs::cancel_job),
        )
        .route("/api/v1/jobs/{job_id}/events", get(routes::jobs::job_events))
        .route("/api/v1/jobs/{job_id}/result", get(routes::jobs::get_job_result))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit));

    tracing::info!("Starting ai-edit-orchestrator on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");

    admission.shutdown().await;
    tracing::info!("Server stopped");
}
