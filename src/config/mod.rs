use serde::Deserialize;
use std::time::Duration;

use crate::models::job::ImageFormat;

/// Headroom above the image limit for the prompt and JSON fields.
const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Server-level settings for the HTTP binary.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// Workers AI model used when a job does not select one.
    #[serde(default)]
    pub cf_model: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}

/// Limits and policy knobs for the processing core.
///
/// Loaded once at startup from `PROCESSING_*` environment variables and
/// shared read-only afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_max_image_size_bytes")]
    pub max_image_size_bytes: u64,

    #[serde(default = "default_max_processing_time_seconds")]
    pub max_processing_time_seconds: u64,

    /// Comma-separated in the environment, e.g. `jpeg,png,webp`.
    #[serde(default = "default_supported_image_formats")]
    pub supported_image_formats: Vec<ImageFormat>,

    /// Re-encode quality in `(0, 1]`.
    #[serde(default = "default_preprocessing_quality")]
    pub preprocessing_quality: f32,

    /// Longest edge in pixels after preprocessing.
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,

    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: u32,

    #[serde(default = "default_rate_limit_window_seconds")]
    pub rate_limit_window_seconds: u64,

    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_true")]
    pub enable_cancellation: bool,

    /// Drop the original upload as soon as the preprocessed copy exists.
    #[serde(default = "default_true")]
    pub enable_memory_optimization: bool,

    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,

    /// Hard cap on pending (not yet started) jobs.
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: usize,

    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,

    /// Consecutive backend failures before a circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_recovery_timeout_seconds")]
    pub recovery_timeout_seconds: u64,
}

fn default_max_image_size_bytes() -> u64 {
    15 * 1024 * 1024
}

fn default_max_processing_time_seconds() -> u64 {
    120
}

fn default_supported_image_formats() -> Vec<ImageFormat> {
    vec![ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::Webp]
}

fn default_preprocessing_quality() -> f32 {
    0.8
}

fn default_max_image_dimension() -> u32 {
    2048
}

fn default_rate_limit_max_requests() -> u32 {
    10
}

fn default_rate_limit_window_seconds() -> u64 {
    60
}

fn default_max_concurrent_requests() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_prompt_length() -> usize {
    1000
}

fn default_max_queue_length() -> usize {
    100
}

fn default_scheduler_tick_ms() -> u64 {
    250
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_seconds() -> u64 {
    30
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_image_size_bytes: default_max_image_size_bytes(),
            max_processing_time_seconds: default_max_processing_time_seconds(),
            supported_image_formats: default_supported_image_formats(),
            preprocessing_quality: default_preprocessing_quality(),
            max_image_dimension: default_max_image_dimension(),
            rate_limit_max_requests: default_rate_limit_max_requests(),
            rate_limit_window_seconds: default_rate_limit_window_seconds(),
            max_concurrent_requests: default_max_concurrent_requests(),
            enable_cancellation: true,
            enable_memory_optimization: true,
            max_prompt_length: default_max_prompt_length(),
            max_queue_length: default_max_queue_length(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout_seconds(),
        }
    }
}

impl ProcessingConfig {
    /// Load from `PROCESSING_*` variables (after `.env`) and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::prefixed("PROCESSING_").from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the core cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_image_size_bytes == 0 {
            return Err(ConfigError::Invalid("max_image_size_bytes must be > 0".into()));
        }
        if self.max_processing_time_seconds == 0 {
            return Err(ConfigError::Invalid(
                "max_processing_time_seconds must be > 0".into(),
            ));
        }
        if self.supported_image_formats.is_empty() {
            return Err(ConfigError::Invalid(
                "supported_image_formats must not be empty".into(),
            ));
        }
        if !(self.preprocessing_quality > 0.0 && self.preprocessing_quality <= 1.0) {
            return Err(ConfigError::Invalid(
                "preprocessing_quality must be in (0, 1]".into(),
            ));
        }
        if self.max_image_dimension == 0 {
            return Err(ConfigError::Invalid("max_image_dimension must be > 0".into()));
        }
        if self.rate_limit_max_requests == 0 || self.rate_limit_window_seconds == 0 {
            return Err(ConfigError::Invalid(
                "rate limit requests and window must be > 0".into(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_requests must be > 0".into(),
            ));
        }
        if self.max_prompt_length == 0 || self.max_queue_length == 0 {
            return Err(ConfigError::Invalid(
                "max_prompt_length and max_queue_length must be > 0".into(),
            ));
        }
        if self.scheduler_tick_ms == 0 || self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "scheduler_tick_ms and failure_threshold must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Exactly at the limit is valid; one byte over is not.
    pub fn is_image_size_valid(&self, size: u64) -> bool {
        size <= self.max_image_size_bytes
    }

    pub fn is_format_supported(&self, format: ImageFormat) -> bool {
        self.supported_image_formats.contains(&format)
    }

    /// Request body cap for uploads: the image limit plus multipart headroom.
    pub fn upload_body_limit(&self) -> usize {
        let limit = self
            .max_image_size_bytes
            .saturating_add(MULTIPART_OVERHEAD_BYTES);
        usize::try_from(limit).unwrap_or(usize::MAX)
    }

    pub fn max_processing_time(&self) -> Duration {
        Duration::from_secs(self.max_processing_time_seconds)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_seconds)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
