use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use std::io::Cursor;

use crate::models::job::ImageFormat;

/// Encoded image plus what we know about it.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Local image transforms used before and after the backend call.
///
/// Implementations are CPU-bound; the orchestrator runs them on the
/// blocking pool.
pub trait ImagePreprocessor: Send + Sync {
    /// Downscale so neither edge exceeds `max_dimension`, then re-encode.
    fn prepare(
        &self,
        image: &[u8],
        format: ImageFormat,
        max_dimension: u32,
        quality: f32,
    ) -> Result<PreparedImage, PreprocessError>;

    /// Read format and dimensions without a full decode.
    fn inspect(&self, image: &[u8]) -> Result<ImageInfo, PreprocessError>;
}

/// [`ImagePreprocessor`] backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCratePreprocessor;

impl ImagePreprocessor for ImageCratePreprocessor {
    fn prepare(
        &self,
        image: &[u8],
        format: ImageFormat,
        max_dimension: u32,
        quality: f32,
    ) -> Result<PreparedImage, PreprocessError> {
        if format == ImageFormat::Heic {
            return Err(PreprocessError::Unsupported(format));
        }

        let decoded = ImageReader::new(Cursor::new(image))
            .with_guessed_format()
            .map_err(|e| PreprocessError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| PreprocessError::Decode(e.to_string()))?;

        let resized = if decoded.width() > max_dimension || decoded.height() > max_dimension {
            decoded.resize(max_dimension, max_dimension, FilterType::Triangle)
        } else {
            decoded
        };

        let (width, height) = (resized.width(), resized.height());
        let (bytes, format) = encode(&resized, quality)?;

        Ok(PreparedImage {
            bytes,
            format,
            width,
            height,
        })
    }

    fn inspect(&self, image: &[u8]) -> Result<ImageInfo, PreprocessError> {
        let format = ImageFormat::detect(image).ok_or(PreprocessError::UnknownFormat)?;
        let (width, height) = ImageReader::new(Cursor::new(image))
            .with_guessed_format()
            .map_err(|e| PreprocessError::Decode(e.to_string()))?
            .into_dimensions()
            .map_err(|e| PreprocessError::Decode(e.to_string()))?;
        Ok(ImageInfo {
            format,
            width,
            height,
        })
    }
}

/// Opaque images become JPEG at the configured quality; images with alpha stay PNG.
fn encode(image: &DynamicImage, quality: f32) -> Result<(Vec<u8>, ImageFormat), PreprocessError> {
    let mut out = Cursor::new(Vec::new());
    if image.color().has_alpha() {
        image
            .write_to(&mut out, image::ImageFormat::Png)
            .map_err(|e| PreprocessError::Encode(e.to_string()))?;
        return Ok((out.into_inner(), ImageFormat::Png));
    }

    let jpeg_quality = (quality.clamp(0.01, 1.0) * 100.0).round() as u8;
    let encoder = JpegEncoder::new_with_quality(&mut out, jpeg_quality);
    image
        .to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;
    Ok((out.into_inner(), ImageFormat::Jpeg))
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PreprocessError {
    #[error("Cannot preprocess {0} images")]
    Unsupported(ImageFormat),

    #[error("Unrecognised image data")]
    UnknownFormat,

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),

    #[error("Preprocessing task failed: {0}")]
    Task(String),
}
