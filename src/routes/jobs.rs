use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{Stream, StreamExt};

use crate::app_state::AppState;
use crate::models::api::{CancelResponse, ErrorBody, JobStatusResponse, SubmitResponse};
use crate::models::job::{JobId, Marker, ProcessingContext};
use crate::services::queue::QueueError;

/// Error response for the jobs API.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                kind: None,
            },
            retry_after: None,
        }
    }

    fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    fn not_found(job_id: JobId) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("Unknown job {job_id}"))
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let mut api = Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string());
        if matches!(err, QueueError::Full { .. }) {
            api.body.kind = Some("queue_full".into());
            api.retry_after = Some(5);
        }
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(seconds) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

/// POST /api/v1/jobs: Upload an image with an edit prompt.
///
/// Multipart fields: `image` (file), `prompt` (text), optional `markers`
/// (JSON array) and `context` (JSON object). Input is validated by the
/// pipeline; failures arrive as a terminal `error` progress event.
pub async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut image: Option<Vec<u8>> = None;
    let mut prompt: Option<String> = None;
    let mut markers: Vec<Marker> = Vec::new();
    let mut context = ProcessingContext::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                image = Some(data.to_vec());
            }
            "prompt" => {
                prompt = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(e.body_text()))?,
                );
            }
            "markers" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                markers = serde_json::from_str(&text)
                    .map_err(|e| ApiError::bad_request(format!("Invalid markers: {e}")))?;
            }
            "context" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                context = serde_json::from_str(&text)
                    .map_err(|e| ApiError::bad_request(format!("Invalid context: {e}")))?;
            }
            other => tracing::debug!(field = other, "Ignoring unknown multipart field"),
        }
    }

    let image = image.ok_or_else(|| ApiError::bad_request("Missing image field"))?;
    let prompt = prompt.ok_or_else(|| ApiError::bad_request("Missing prompt field"))?;

    let job_id = state.submit(image, prompt, markers, context)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: "queued".to_string(),
            message: "Image submitted for editing".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}: Latest progress snapshot.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let progress = state
        .latest_progress(job_id)
        .ok_or_else(|| ApiError::not_found(job_id))?;
    Ok(Json(JobStatusResponse {
        job_id,
        status: progress.stage.name().to_string(),
        progress,
    }))
}

/// GET /api/v1/jobs/{job_id}/events: Server-sent progress events.
///
/// The latest snapshot is sent first; the stream closes after the terminal one.
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let progress = state
        .watch_progress(job_id)
        .ok_or_else(|| ApiError::not_found(job_id))?;
    let events = progress.map(|snapshot| {
        Event::default()
            .event(snapshot.stage.name())
            .json_data(&snapshot)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// DELETE /api/v1/jobs/{job_id}: Cancel a queued or running job.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<CancelResponse>, ApiError> {
    if state.cancel(job_id) {
        return Ok(Json(CancelResponse {
            job_id,
            acknowledged: true,
        }));
    }
    let progress = state
        .latest_progress(job_id)
        .ok_or_else(|| ApiError::not_found(job_id))?;
    tracing::debug!(job_id = %job_id, stage = progress.stage.name(), "Cancellation refused");
    Ok(Json(CancelResponse {
        job_id,
        acknowledged: false,
    }))
}

/// GET /api/v1/jobs/{job_id}/result: Edited image bytes.
pub async fn get_job_result(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Response, ApiError> {
    let result = state.admission.result(job_id).ok_or_else(|| {
        ApiError::new(StatusCode::NOT_FOUND, format!("No result for job {job_id}"))
    })?;
    Ok((
        [(header::CONTENT_TYPE, result.format.mime_type())],
        result.image,
    )
        .into_response())
}
