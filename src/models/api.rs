use serde::Serialize;

use crate::models::job::JobId;
use crate::models::progress::ProcessingProgress;

/// Response after submitting an image for editing.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: String,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: String,
    pub progress: ProcessingProgress,
}

/// `acknowledged` is false when the job exists but can no longer be cancelled.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub acknowledged: bool,
}

/// JSON body for every non-2xx API response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}
