//! JPEG encode/decode for thumbnails persisted on disk

use crate::buffer::ThumbnailBuffer;
use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ImageFormat;

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Encode a thumbnail as JPEG at the given quality (1-100)
pub fn encode_jpeg(buffer: &ThumbnailBuffer, quality: u8) -> Result<Vec<u8>> {
    if buffer.is_empty() {
        bail!(
            "cannot encode empty {}x{} thumbnail",
            buffer.width(),
            buffer.height()
        );
    }

    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    encoder
        .encode_image(&buffer.to_rgb_image())
        .context("Failed to encode JPEG")?;

    Ok(bytes)
}

/// Decode JPEG bytes into an RGB thumbnail; greyscale input is expanded to RGB
pub fn decode_jpeg(bytes: &[u8]) -> Result<ThumbnailBuffer> {
    let img = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
        .context("Failed to decode JPEG")?;

    Ok(ThumbnailBuffer::from_rgb_image(img.to_rgb8()))
}
