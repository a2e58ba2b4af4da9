//! Multi-strategy decode pipeline.
//!
//! Turns `(path, target_height)` into a [`Bitmap`] under a wall-clock
//! budget. The fast path decodes via the format named by the file extension
//! and applies EXIF orientation. Formats that path rejects often enough
//! (exotic TIFF compressions, multi-frame/palette content) skip straight to
//! the fallback path: full-buffer content sniffing, resize, then color-mode
//! normalization.
//!
//! The timeout is checked between stages only. Decode libraries are not
//! preemptible mid-call, so a hung single decode cannot be aborted in
//! flight — the budget prevents escalation to further stages, nothing more.

use crate::bitmap::Bitmap;
use crate::error::DecodeFailure;
use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageReader};
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

/// Extensions handled by the video collaborator, never decoded here.
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "m4v", "avi", "mkv", "webm", "mpg", "mpeg", "wmv", "flv", "3gp", "mts", "m2ts",
];

/// Extensions where the extension-driven path rejects enough real-world
/// files (TIFF compression variants, animated/palette GIF) that sniffing
/// the content is attempted first.
const FALLBACK_PREFERRED_EXTENSIONS: &[&str] = &["tif", "tiff", "gif"];

/// Decode `path` into a bitmap no taller than `target_height`.
pub fn decode(path: &Path, target_height: u32, timeout: Duration) -> Result<Bitmap, DecodeFailure> {
    let started = Instant::now();

    let meta = std::fs::metadata(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => DecodeFailure::NotFound,
        _ => DecodeFailure::Unreadable,
    })?;
    if meta.len() == 0 {
        return Err(DecodeFailure::Empty);
    }

    let ext = extension_of(path);
    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        debug!(path = %path.display(), "video content, frame extraction handled elsewhere");
        return Err(DecodeFailure::Unsupported);
    }

    if !FALLBACK_PREFERRED_EXTENSIONS.contains(&ext.as_str()) {
        match fast_decode(path) {
            Ok(img) => return finish(img, target_height),
            Err(err) => {
                debug!(path = %path.display(), %err, "fast decode failed, trying fallback");
            }
        }
        if started.elapsed() > timeout {
            return Err(DecodeFailure::Timeout);
        }
    }

    match fallback_decode(path, target_height) {
        Ok(img) => finish(img, target_height),
        Err(err) => {
            debug!(path = %path.display(), %err, "fallback decode failed");
            Err(DecodeFailure::Unsupported)
        }
    }
}

/// Extension-driven decode with EXIF auto-orientation.
fn fast_decode(path: &Path) -> Result<DynamicImage> {
    let reader = ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut decoder = reader
        .into_decoder()
        .with_context(|| format!("no decoder for {}", path.display()))?;
    let orientation = decoder
        .orientation()
        .with_context(|| format!("failed to read orientation for {}", path.display()))?;
    let mut img = DynamicImage::from_decoder(decoder)
        .with_context(|| format!("failed to decode {}", path.display()))?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Content-sniffing decode for whatever the fast path could not handle.
/// Multi-frame assets yield their first frame. The resize happens before
/// color normalization — converting a full-resolution frame is the
/// expensive step.
fn fallback_decode(path: &Path, target_height: u32) -> Result<DynamicImage> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let img = image::load_from_memory(&bytes)
        .with_context(|| format!("unrecognized image content in {}", path.display()))?;
    let img = scale_to_height(img, target_height);
    Ok(normalize_color(img))
}

/// Palette, grayscale, and high-bit-depth content becomes plain RGBA8;
/// already-renderable images pass through untouched.
fn normalize_color(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => img,
        other => DynamicImage::ImageRgba8(other.to_rgba8()),
    }
}

fn finish(img: DynamicImage, target_height: u32) -> Result<Bitmap, DecodeFailure> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(DecodeFailure::DimensionInvalid);
    }
    Ok(Bitmap::from_dynamic(scale_to_height(img, target_height)))
}

/// Scale so the height fits `max_height`, preserving aspect ratio. Images
/// already small enough are never upscaled.
pub(crate) fn scale_to_height(img: DynamicImage, max_height: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    if max_height == 0 || height <= max_height {
        return img;
    }
    let ratio = max_height as f64 / height as f64;
    let new_width = ((width as f64 * ratio).round() as u32).max(1);
    img.resize(new_width, max_height, FilterType::Lanczos3)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    const BUDGET: Duration = Duration::from_secs(10);

    fn write_png(path: &Path, width: u32, height: u32) {
        DynamicImage::new_rgb8(width, height).save(path).unwrap();
    }

    #[test]
    fn test_decode_scales_to_target_height() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("img.png");
        write_png(&file, 100, 80);

        let bm = decode(&file, 40, BUDGET).unwrap();
        assert_eq!(bm.height(), 40);
        assert_eq!(bm.width(), 50);
    }

    #[test]
    fn test_decode_never_upscales() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("img.png");
        write_png(&file, 100, 80);

        let bm = decode(&file, 500, BUDGET).unwrap();
        assert_eq!((bm.width(), bm.height()), (100, 80));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let err = decode(&dir.path().join("gone.jpg"), 100, BUDGET).unwrap_err();
        assert_eq!(err, DecodeFailure::NotFound);
    }

    #[test]
    fn test_empty_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("zero.jpg");
        fs::write(&file, b"").unwrap();
        assert_eq!(decode(&file, 100, BUDGET).unwrap_err(), DecodeFailure::Empty);
    }

    #[test]
    fn test_video_extension_short_circuits() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("clip.mp4");
        fs::write(&file, b"not really a video").unwrap();
        assert_eq!(
            decode(&file, 100, BUDGET).unwrap_err(),
            DecodeFailure::Unsupported
        );
    }

    #[test]
    fn test_corrupt_content_is_unsupported() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("broken.jpg");
        fs::write(&file, b"\xff\xd8 definitely not a jpeg").unwrap();
        assert_eq!(
            decode(&file, 100, BUDGET).unwrap_err(),
            DecodeFailure::Unsupported
        );
    }

    #[test]
    fn test_zero_budget_times_out_before_fallback() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("broken.jpg");
        fs::write(&file, b"garbage bytes").unwrap();
        assert_eq!(
            decode(&file, 100, Duration::ZERO).unwrap_err(),
            DecodeFailure::Timeout
        );
    }

    #[test]
    fn test_misnamed_extension_recovered_by_sniffing() {
        // PNG bytes behind a .gif name: the extension routes to the
        // fallback path, which sniffs the real format.
        let dir = tempdir().unwrap();
        let file = dir.path().join("actually_png.gif");
        write_png(&file, 64, 32);

        let bm = decode(&file, 16, BUDGET).unwrap();
        assert_eq!(bm.height(), 16);
        assert_eq!(bm.width(), 32);
    }

    #[test]
    fn test_grayscale_normalized_to_rgba() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("gray.png");
        DynamicImage::new_luma8(40, 40).save(&file).unwrap();

        let bm = decode(&file, 40, BUDGET).unwrap();
        assert_eq!(bm.pixels().len(), 40 * 40 * 4);
    }

    #[test]
    fn test_scale_helper_aspect_ratio() {
        let img = DynamicImage::new_rgb8(300, 200);
        let scaled = scale_to_height(img, 100);
        assert_eq!(scaled.dimensions(), (150, 100));
    }
}
