use bytes::Bytes;
use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Decoded live-view frame.
///
/// Pixel data is immutable shared bytes: cloning a frame is cheap and every
/// holder sees the same read-only raster.
#[derive(Clone)]
pub struct Frame {
    /// Row-major pixels, `height * width * channels` bytes
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Decode timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Position in decode order since the stream was started
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Size of the encoded JPEG the raster came from
    pub encoded_len: usize,
}

/// Pixel formats the JPEG decoder can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Luma8,
    Luma16,
    Rgb24,
    Cmyk32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Luma8 => 1,
            PixelFormat::Luma16 => 2,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Cmyk32 => 4,
        }
    }
}

impl From<jpeg_decoder::PixelFormat> for PixelFormat {
    fn from(format: jpeg_decoder::PixelFormat) -> Self {
        match format {
            jpeg_decoder::PixelFormat::L8 => PixelFormat::Luma8,
            jpeg_decoder::PixelFormat::L16 => PixelFormat::Luma16,
            jpeg_decoder::PixelFormat::RGB24 => PixelFormat::Rgb24,
            jpeg_decoder::PixelFormat::CMYK32 => PixelFormat::Cmyk32,
        }
    }
}

/// Raster produced by the decoder before it is numbered into a [`Frame`].
#[derive(Debug, Clone)]
pub struct Raster {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub encoded_len: usize,
}

impl Frame {
    pub fn new(raster: Raster, sequence: u64) -> Self {
        Self {
            data: Bytes::from(raster.pixels),
            meta: Arc::new(FrameMetadata {
                sequence,
                width: raster.width,
                height: raster.height,
                format: raster.format,
                encoded_len: raster.encoded_len,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn channels(&self) -> usize {
        self.meta.format.bytes_per_pixel()
    }

    /// `(height, width, channels)`, the shape analysis code expects.
    pub fn shape(&self) -> (usize, usize, usize) {
        (
            self.meta.height as usize,
            self.meta.width as usize,
            self.channels(),
        )
    }

    /// Copy the raster into an owned `image` buffer for analysis code.
    ///
    /// Returns `None` for formats `image` has no 8-bit equivalent for.
    pub fn to_image(&self) -> Option<DynamicImage> {
        let (width, height) = (self.meta.width, self.meta.height);
        match self.meta.format {
            PixelFormat::Rgb24 => {
                RgbImage::from_raw(width, height, self.data.to_vec()).map(DynamicImage::ImageRgb8)
            }
            PixelFormat::Luma8 => GrayImage::from_raw(width, height, self.data.to_vec())
                .map(DynamicImage::ImageLuma8),
            PixelFormat::Luma16 | PixelFormat::Cmyk32 => None,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_frame_converts_to_image() {
        let raster = Raster {
            pixels: vec![10; 4 * 2 * 3],
            width: 4,
            height: 2,
            format: PixelFormat::Rgb24,
            encoded_len: 0,
        };
        let frame = Frame::new(raster, 7);

        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.shape(), (2, 4, 3));
        let image = frame.to_image().expect("rgb converts");
        assert_eq!(image.width(), 4);
        assert_eq!(image.height(), 2);
    }

    #[test]
    fn clones_share_pixels() {
        let raster = Raster {
            pixels: vec![1, 2, 3],
            width: 1,
            height: 1,
            format: PixelFormat::Rgb24,
            encoded_len: 0,
        };
        let frame = Frame::new(raster, 0);
        let copy = frame.clone();
        assert_eq!(frame.data.as_ptr(), copy.data.as_ptr());
    }
}
