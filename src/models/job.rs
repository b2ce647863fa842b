use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type JobId = Uuid;

/// Image container formats the service can recognise from magic bytes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
    Gif,
    Heic,
}

impl ImageFormat {
    /// Sniff the format from the leading bytes of an encoded image.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        // HEIF brands live in the ISO-BMFF `ftyp` box, which `image` does not know.
        if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
            return match &bytes[8..12] {
                b"heic" | b"heix" | b"hevc" | b"heim" | b"heis" | b"mif1" | b"msf1" => {
                    Some(Self::Heic)
                }
                _ => None,
            };
        }

        match image::guess_format(bytes).ok()? {
            image::ImageFormat::Jpeg => Some(Self::Jpeg),
            image::ImageFormat::Png => Some(Self::Png),
            image::ImageFormat::WebP => Some(Self::Webp),
            image::ImageFormat::Gif => Some(Self::Gif),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Gif => "image/gif",
            Self::Heic => "image/heic",
        }
    }
}

/// A point of interest on the image, in normalized coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Marker {
    #[garde(range(min = 0.0, max = 1.0))]
    pub x: f64,

    #[garde(range(min = 0.0, max = 1.0))]
    pub y: f64,

    #[garde(length(min = 1, max = 64))]
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QualityLevel {
    Draft,
    #[default]
    Standard,
    High,
}

impl QualityLevel {
    /// Diffusion steps requested from the backend.
    pub fn num_steps(self) -> u32 {
        match self {
            Self::Draft => 8,
            Self::Standard => 14,
            Self::High => 20,
        }
    }
}

/// Per-job knobs chosen by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProcessingContext {
    #[garde(skip)]
    #[serde(default)]
    pub quality: QualityLevel,

    /// Backend model selector; the client's default model when absent.
    #[garde(length(min = 1, max = 128))]
    #[serde(default)]
    pub model: Option<String>,

    #[garde(length(max = 16), inner(length(min = 1, max = 200)))]
    #[serde(default)]
    pub constraints: Vec<String>,

    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_strength")]
    pub strength: f32,
}

fn default_strength() -> f32 {
    0.75
}

impl Default for ProcessingContext {
    fn default() -> Self {
        Self {
            quality: QualityLevel::default(),
            model: None,
            constraints: Vec::new(),
            strength: default_strength(),
        }
    }
}

/// What the caller asked for, independent of the image payload.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EditRequest {
    /// Checked against the configured length bound during validation.
    #[garde(skip)]
    pub prompt: String,

    #[garde(length(max = 32), dive)]
    #[serde(default)]
    pub markers: Vec<Marker>,

    #[garde(dive)]
    #[serde(default)]
    pub context: ProcessingContext,
}

/// An image-edit job as it moves from the queue into the orchestrator.
#[derive(Debug)]
pub struct ProcessingJob {
    pub id: JobId,
    pub image: Vec<u8>,
    pub request: EditRequest,
    pub submitted_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl ProcessingJob {
    pub fn new(
        image: Vec<u8>,
        prompt: impl Into<String>,
        markers: Vec<Marker>,
        context: ProcessingContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            image,
            request: EditRequest {
                prompt: prompt.into(),
                markers,
                context,
            },
            submitted_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }
}
