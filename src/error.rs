//! Error taxonomy shared by the processing core.
//!
//! Every failure a job can end with maps to exactly one [`ErrorKind`], which
//! is what the retry policy and observers reason about.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::services::backend::BackendError;
use crate::services::preprocess::PreprocessError;

/// Machine-readable classification of a failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Timeout,
    ServiceOverloaded,
    QuotaExceeded,
    TransientNetwork,
    Validation,
    Permanent,
    CircuitOpen,
    Cancelled,
}

impl ErrorKind {
    /// Kinds the backend may recover from on its own.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::ServiceOverloaded | Self::TransientNetwork
        )
    }
}

/// Input rejected before any backend contact.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Image is {size} bytes, limit is {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    #[error("Image is empty")]
    EmptyImage,

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("Prompt is {length} characters, limit is {limit}")]
    PromptTooLong { length: usize, limit: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Why a job did not complete.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Preprocessing failed: {0}")]
    Preprocessing(#[from] PreprocessError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Circuit open for backend {backend}, failing fast")]
    CircuitOpen { backend: String },

    #[error("Processing cancelled")]
    Cancelled,

    #[error("Backend result rejected: {0}")]
    PostProcessing(String),
}

impl ProcessingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Preprocessing(_) | Self::PostProcessing(_) => ErrorKind::Permanent,
            Self::Backend(err) => err.kind(),
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}
