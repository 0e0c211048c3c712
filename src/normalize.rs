//! Canonical image form: JPEG, long edge at most `max_dimension`, no alpha.
//!
//! A JPEG that already satisfies the bounds is returned byte-for-byte after
//! a full decode check, so normalizing the normalizer's own output is a
//! no-op.

use crate::config::PipelineConfig;
use bytes::Bytes;
use image::{
    DynamicImage, GenericImageView, ImageFormat, ImageReader, Limits, Rgb, RgbImage,
    codecs::jpeg::JpegEncoder, imageops::FilterType,
};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

pub const CANONICAL_FORMAT: ImageFormat = ImageFormat::Jpeg;
pub const CANONICAL_CONTENT_TYPE: &str = "image/jpeg";

const MAX_DECODE_SIDE: u32 = 16_384;
const MAX_DECODE_ALLOC: u64 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("empty payload")]
    Empty,
    #[error("unrecognised image format: {0}")]
    Format(#[from] std::io::Error),
    #[error("undecodable image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("normalizer task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

impl NormalizedImage {
    pub fn content_type(&self) -> &'static str {
        self.format.to_mime_type()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    max_dimension: u32,
    quality: u8,
}

impl Normalizer {
    pub fn new(max_dimension: u32, quality: u8) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_dimension, config.jpeg_quality)
    }

    pub fn normalize(&self, input: &[u8]) -> Result<NormalizedImage, NormalizeError> {
        if input.is_empty() {
            return Err(NormalizeError::Empty);
        }
        let mut reader = ImageReader::new(Cursor::new(input)).with_guessed_format()?;
        reader.limits(decode_limits());
        let format = reader.format();
        let decoded = reader.decode()?;
        let (width, height) = decoded.dimensions();

        if format == Some(CANONICAL_FORMAT)
            && width.max(height) <= self.max_dimension
            && !decoded.color().has_alpha()
        {
            return Ok(NormalizedImage {
                bytes: Bytes::copy_from_slice(input),
                width,
                height,
                format: CANONICAL_FORMAT,
            });
        }

        let resized = if width.max(height) > self.max_dimension {
            decoded.resize(self.max_dimension, self.max_dimension, FilterType::Lanczos3)
        } else {
            decoded
        };
        let rgb = flatten(&resized);
        let mut out = Vec::with_capacity(input.len().min(4 * 1024 * 1024));
        JpegEncoder::new_with_quality(&mut out, self.quality).encode_image(&rgb)?;
        debug!(
            target = "valuer.normalize",
            from_format = format
                .and_then(|f| f.extensions_str().first().copied())
                .unwrap_or("unknown"),
            from_width = width,
            from_height = height,
            width = rgb.width(),
            height = rgb.height(),
            bytes = out.len(),
            "image_reencoded"
        );
        Ok(NormalizedImage {
            width: rgb.width(),
            height: rgb.height(),
            bytes: Bytes::from(out),
            format: CANONICAL_FORMAT,
        })
    }

    /// Runs [`Normalizer::normalize`] on the blocking pool.
    pub async fn normalize_blocking(&self, input: Bytes) -> Result<NormalizedImage, NormalizeError> {
        let normalizer = *self;
        tokio::task::spawn_blocking(move || normalizer.normalize(&input))
            .await
            .map_err(|err| NormalizeError::Task(err.to_string()))?
    }
}

fn decode_limits() -> Limits {
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_DECODE_SIDE);
    limits.max_image_height = Some(MAX_DECODE_SIDE);
    limits.max_alloc = Some(MAX_DECODE_ALLOC);
    limits
}

/// Composites any alpha channel onto white.
fn flatten(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, px) in rgba.enumerate_pixels() {
        let alpha = px[3] as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(px[0]), blend(px[1]), blend(px[2])]));
    }
    out
}
