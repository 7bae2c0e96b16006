//! Decoding transport-encoded image payloads into canonical in-memory images

use base64::{engine::general_purpose, Engine as _};
use image::RgbImage;
use thiserror::Error;

/// Any failure between the base64 text and a usable raster image. The reason
/// string carries the underlying cause; callers only branch on the kind.
#[derive(Debug, Error)]
#[error("image decode failed: {reason}")]
pub struct DecodeError {
    reason: String,
}

impl From<base64::DecodeError> for DecodeError {
    fn from(err: base64::DecodeError) -> Self {
        DecodeError {
            reason: err.to_string(),
        }
    }
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        DecodeError {
            reason: err.to_string(),
        }
    }
}

/// Decode a base64 payload into an RGB image. The raster format is sniffed
/// from the bytes; the result is always 3-channel RGB whatever the input
/// mode was (gray, palette, alpha).
pub fn decode(payload: &str) -> Result<RgbImage, DecodeError> {
    let bytes = general_purpose::STANDARD.decode(payload)?;
    let image = image::load_from_memory(&bytes)?;
    Ok(image.to_rgb8())
}
