//! Toolkit-independent decoded bitmap value.
//!
//! The cache stores and returns `Bitmap` — width, height, and an RGBA8 pixel
//! buffer. Conversion to whatever pixel-surface type the UI toolkit wants
//! happens at the UI boundary, outside this crate.

use image::{DynamicImage, RgbaImage};
use std::fmt;

/// Multiplier applied to the raw pixel-buffer length when estimating how
/// much resident memory a decoded bitmap costs. Decoded buffers carry
/// allocator and bookkeeping overhead beyond the pixels themselves;
/// calibrate against the target allocator if memory budgets drift.
pub const RESIDENT_OVERHEAD_FACTOR: f64 = 1.2;

/// A decoded RGBA8 bitmap (row-major, 4 bytes per pixel).
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Bitmap {
    /// Create a bitmap from raw RGBA bytes.
    ///
    /// # Panics
    ///
    /// Panics if `pixels.len() != width * height * 4`.
    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        assert_eq!(
            pixels.len(),
            width as usize * height as usize * 4,
            "RGBA data length must match width * height * 4"
        );
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Convert a decoded image, normalizing whatever color mode the decoder
    /// produced (palette, grayscale, 16-bit) down to RGBA8.
    pub fn from_dynamic(img: DynamicImage) -> Self {
        let rgba = img.into_rgba8();
        let (width, height) = rgba.dimensions();
        Self {
            width,
            height,
            pixels: rgba.into_raw(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA8 pixel bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Estimated resident memory cost of holding this bitmap in cache.
    pub fn estimated_resident_bytes(&self) -> usize {
        (self.pixels.len() as f64 * RESIDENT_OVERHEAD_FACTOR) as usize
    }

    /// Whether any pixel is less than fully opaque.
    pub fn has_alpha(&self) -> bool {
        self.pixels.chunks_exact(4).any(|px| px[3] != u8::MAX)
    }

    /// Copy out as an `image` crate buffer, for encoding or saving.
    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
            .expect("bitmap buffer length invariant")
    }

    pub fn to_dynamic(&self) -> DynamicImage {
        DynamicImage::ImageRgba8(self.to_rgba_image())
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}
