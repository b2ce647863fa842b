use async_trait::async_trait;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::models::job::{ImageFormat, QualityLevel};

/// Everything the generative backend needs for one edit.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Prompt enriched with marker regions and constraints.
    pub prompt: String,
    pub image: Vec<u8>,
    pub format: ImageFormat,
    pub model: Option<String>,
    pub quality: QualityLevel,
    pub strength: f32,
}

/// Raw backend output, validated later during post-processing.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub image: Vec<u8>,
    pub model: String,
}

/// Narrow contract for the remote image-generation call.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Stable identifier used to key the circuit breaker.
    fn name(&self) -> &str;

    /// Model used when a job does not select one.
    fn default_model(&self) -> &str;

    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<GenerationOutput, BackendError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("Backend rate limited the request: {0}")]
    RateLimited(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend overloaded: {0}")]
    Overloaded(String),

    #[error("Backend quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Backend rejected credentials: {0}")]
    AuthFailed(String),

    #[error("Network error talking to backend: {0}")]
    Network(String),

    #[error("Backend rejected the request: {0}")]
    InvalidRequest(String),

    #[error("Backend returned an unusable response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Overloaded(_) => ErrorKind::ServiceOverloaded,
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::Network(_) => ErrorKind::TransientNetwork,
            Self::AuthFailed(_) | Self::InvalidRequest(_) | Self::InvalidResponse(_) => {
                ErrorKind::Permanent
            }
        }
    }
}
