//! External thumbnail source
//!
//! The coordinator only knows the [`ThumbnailReader`] trait. [`ImageFileReader`]
//! is the stock implementation for still images on the local filesystem.

use crate::buffer::ThumbnailBuffer;
use crate::key::FrameId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use std::path::Path;

/// Produces a fresh thumbnail for one frame of a media source
#[async_trait]
pub trait ThumbnailReader: Send + Sync {
    async fn generate_thumbnail(&self, frame: &FrameId, size: u32) -> Result<ThumbnailBuffer>;
}

/// Decodes `frame.source` as an image file and downsizes it
///
/// Still images have a single frame, so the frame number is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFileReader;

#[async_trait]
impl ThumbnailReader for ImageFileReader {
    async fn generate_thumbnail(&self, frame: &FrameId, size: u32) -> Result<ThumbnailBuffer> {
        let source = frame.source.clone();
        tokio::task::spawn_blocking(move || load_thumbnail(Path::new(&source), size))
            .await
            .context("thumbnail decode task failed")?
    }
}

fn load_thumbnail(path: &Path, size: u32) -> Result<ThumbnailBuffer> {
    let img = ImageReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("Failed to detect image format of {}", path.display()))?
        .decode()
        .with_context(|| format!("Failed to decode {}", path.display()))?;

    Ok(ThumbnailBuffer::from_rgb_image(
        resize_image(img, size).to_rgb8(),
    ))
}

/// Fit the long edge within `max_dim`, preserving aspect ratio; never upscales
fn resize_image(img: DynamicImage, max_dim: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    let max_existing = width.max(height);

    if max_dim == 0 || max_existing <= max_dim {
        return img;
    }

    let ratio = max_dim as f64 / max_existing as f64;
    let new_width = ((width as f64 * ratio).round() as u32).max(1);
    let new_height = ((height as f64 * ratio).round() as u32).max(1);

    img.resize(new_width, new_height, FilterType::Lanczos3)
}
