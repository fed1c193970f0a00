//! Packed RGB pixel buffers

use crate::error::{Result, ThumbnailError};
use image::RgbImage;
use std::fmt;

/// Anything with a byte footprint the caches can budget against
pub trait ByteSize {
    fn size(&self) -> usize;
}

/// Immutable 8-bit RGB thumbnail, `width * height * 3` bytes, row-major
#[derive(Clone, PartialEq, Eq)]
pub struct ThumbnailBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl ThumbnailBuffer {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(ThumbnailError::InvalidBuffer {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Black buffer of the given dimensions
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 3],
        }
    }

    pub fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.into_raw(),
        }
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        // Length is checked on construction so from_raw cannot fail here.
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ByteSize for ThumbnailBuffer {
    fn size(&self) -> usize {
        self.data.len()
    }
}

impl ByteSize for Vec<u8> {
    fn size(&self) -> usize {
        self.len()
    }
}

impl fmt::Debug for ThumbnailBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_is_packed_rgb() {
        let buffer = ThumbnailBuffer::blank(4, 3);
        assert_eq!(buffer.size(), 36);
        assert_eq!(buffer.data().len(), 36);
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_rejects_wrong_length() {
        let err = ThumbnailBuffer::new(2, 2, vec![0; 11]).unwrap_err();
        assert!(matches!(
            err,
            ThumbnailError::InvalidBuffer {
                expected: 12,
                actual: 11
            }
        ));
    }

    #[test]
    fn test_rgb_image_conversion() {
        let mut image = RgbImage::new(3, 2);
        image.put_pixel(2, 1, image::Rgb([10, 20, 30]));

        let buffer = ThumbnailBuffer::from_rgb_image(image.clone());
        assert_eq!((buffer.width(), buffer.height()), (3, 2));
        assert_eq!(&buffer.data()[15..18], &[10, 20, 30]);
        assert_eq!(buffer.to_rgb_image(), image);
    }
}
