//! Frame layer.
//!
//! - `Frame`: one decoded RGB image pulled from a camera, plus capture metadata.
//! - `FaceRect`: face location in `(top, right, bottom, left)` pixel coordinates.
//! - Image helpers shared by consumers: aspect-preserving downscale, crops,
//!   the burned-in label/timestamp overlay, and JPEG encoding.
//!
//! Frames are owned by the stream loop until pushed; every consumer receives its
//! own clone, so no pixel buffer is ever shared mutably between threads.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Instant;

/// Timestamp format burned into recorded and republished frames.
pub const OVERLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const OVERLAY_MARGIN: u32 = 5;
const GLYPH_SIZE: u32 = 8;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A decoded camera frame.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Position of this frame in its source's output, starting at 1.
    pub sequence: u64,
    pub captured_at: DateTime<Local>,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Local::now(),
        }
    }

    /// Build a frame from packed RGB24 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let image = RgbImage::from_raw(width, height, pixels).with_context(|| {
            format!("pixel buffer does not match {}x{} RGB frame", width, height)
        })?;
        Ok(Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

// ----------------------------------------------------------------------------
// FaceRect
// ----------------------------------------------------------------------------

/// Face bounding box. `right`/`bottom` are exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceRect {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl FaceRect {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    /// Rectangle covering a whole `width` x `height` image.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, width, height, 0)
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Multiply every coordinate by `factor`, clamped to a `width` x `height` image.
    pub fn scale(&self, factor: f64, width: u32, height: u32) -> Self {
        let scale = |v: u32, max: u32| ((v as f64 * factor).round() as u32).min(max);
        Self {
            top: scale(self.top, height),
            right: scale(self.right, width),
            bottom: scale(self.bottom, height),
            left: scale(self.left, width),
        }
    }

    /// Clamp to the bounds of a `width` x `height` image.
    pub fn clamp(&self, width: u32, height: u32) -> Self {
        Self {
            top: self.top.min(height),
            right: self.right.min(width),
            bottom: self.bottom.min(height),
            left: self.left.min(width),
        }
    }

    /// Copy the pixels under this rectangle.
    pub fn crop(&self, image: &RgbImage) -> RgbImage {
        let rect = self.clamp(image.width(), image.height());
        imageops::crop_imm(image, rect.left, rect.top, rect.width(), rect.height()).to_image()
    }

    /// Serialised form used by the store: `[top, right, bottom, left]`.
    pub fn to_array(&self) -> [u32; 4] {
        [self.top, self.right, self.bottom, self.left]
    }

    pub fn from_array(values: [u32; 4]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }
}

// ----------------------------------------------------------------------------
// Image helpers
// ----------------------------------------------------------------------------

/// Shrink `image` so it is at most `max_width` wide, keeping its aspect ratio.
///
/// Returns the (possibly borrowed) image and the ratio applied; `1.0` means untouched.
/// A `max_width` of zero disables resizing.
pub fn downscale(image: &RgbImage, max_width: u32) -> (Cow<'_, RgbImage>, f64) {
    if max_width == 0 || image.width() <= max_width {
        return (Cow::Borrowed(image), 1.0);
    }
    let ratio = max_width as f64 / image.width() as f64;
    let height = ((image.height() as f64 * ratio).round() as u32).max(1);
    let resized = imageops::resize(image, max_width, height, FilterType::Triangle);
    (Cow::Owned(resized), ratio)
}

/// Burn the camera label (top-left) and `when` (bottom-left) into `image`.
pub fn stamp_overlay(image: &mut RgbImage, label: &str, when: DateTime<Local>) {
    let scale = (image.width() / 320).max(1);
    let glyph_height = GLYPH_SIZE * scale;

    draw_text(image, label, OVERLAY_MARGIN, OVERLAY_MARGIN, scale);

    let date = when.format(OVERLAY_TIME_FORMAT).to_string();
    let y = image
        .height()
        .saturating_sub(OVERLAY_MARGIN + glyph_height);
    draw_text(image, &date, OVERLAY_MARGIN, y, scale);
}

/// Draw `text` with an 8x8 bitmap font, white on a one-step black shadow.
fn draw_text(image: &mut RgbImage, text: &str, x: u32, y: u32, scale: u32) {
    draw_glyphs(image, text, x + scale, y + scale, scale, Rgb([0, 0, 0]));
    draw_glyphs(image, text, x, y, scale, Rgb([255, 255, 255]));
}

fn draw_glyphs(image: &mut RgbImage, text: &str, x: u32, y: u32, scale: u32, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    let advance = GLYPH_SIZE * scale;

    for (index, ch) in text.chars().enumerate() {
        let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
            continue;
        };
        let origin_x = x + index as u32 * advance;
        if origin_x >= width {
            break;
        }
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_SIZE {
                // Bit 0 is the leftmost pixel.
                if bits & (1 << col) == 0 {
                    continue;
                }
                let px = origin_x + col * scale;
                let py = y + row as u32 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        let (tx, ty) = (px + dx, py + dy);
                        if tx < width && ty < height {
                            image.put_pixel(tx, ty, color);
                        }
                    }
                }
            }
        }
    }
}

/// Encode an RGB image as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity((image.width() * image.height() / 4) as usize);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(image)
        .context("encode jpeg")?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// StageTimer
// ----------------------------------------------------------------------------

/// Per-frame stage timings, reported inline at debug level.
pub struct StageTimer {
    start: Instant,
    last: Instant,
    stages: Vec<(&'static str, f64)>,
}

impl StageTimer {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last: now,
            stages: Vec::new(),
        }
    }

    /// Record the time spent since the previous mark.
    pub fn mark(&mut self, stage: &'static str) {
        let now = Instant::now();
        let ms = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.stages.push((stage, ms));
        self.last = now;
    }

    /// `resize: 1.20 ms - locate: 8.02 ms - total: 9.22 ms`
    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .stages
            .iter()
            .map(|(stage, ms)| format!("{}: {:.2} ms", stage, ms))
            .collect();
        parts.push(format!(
            "total: {:.2} ms",
            self.start.elapsed().as_secs_f64() * 1e3
        ));
        parts.join(" - ")
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([value, value, value]))
    }

    #[test]
    fn downscale_keeps_aspect_ratio() {
        let image = solid(640, 480, 10);
        let (small, ratio) = downscale(&image, 320);
        assert_eq!(small.dimensions(), (320, 240));
        assert!((ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn downscale_leaves_narrow_images_alone() {
        let image = solid(200, 100, 10);
        let (same, ratio) = downscale(&image, 320);
        assert!(matches!(same, Cow::Borrowed(_)));
        assert_eq!(ratio, 1.0);

        let (same, ratio) = downscale(&image, 0);
        assert_eq!(same.dimensions(), (200, 100));
        assert_eq!(ratio, 1.0);
    }

    #[test]
    fn rect_scales_back_to_full_resolution() {
        let rect = FaceRect::new(10, 60, 50, 20);
        let full = rect.scale(1.0 / 0.5, 640, 480);
        assert_eq!(full, FaceRect::new(20, 120, 100, 40));

        let clamped = FaceRect::new(200, 330, 250, 300).scale(2.0, 640, 480);
        assert_eq!(clamped.right, 640);
        assert_eq!(clamped.bottom, 480);
    }

    #[test]
    fn crop_copies_rect_pixels() {
        let mut image = solid(20, 20, 0);
        image.put_pixel(5, 6, Rgb([9, 9, 9]));
        let crop = FaceRect::new(6, 10, 12, 5).crop(&image);
        assert_eq!(crop.dimensions(), (5, 6));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([9, 9, 9]));
    }

    #[test]
    fn overlay_draws_inside_bounds() {
        let mut image = solid(64, 32, 0);
        stamp_overlay(&mut image, "a very long camera label that overflows", Local::now());
        assert!(image.pixels().any(|p| p == &Rgb([255, 255, 255])));
    }

    #[test]
    fn jpeg_encoding_produces_soi_marker() {
        let jpeg = encode_jpeg(&solid(16, 16, 128), 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[test]
    fn frame_rejects_short_pixel_buffer() {
        assert!(Frame::from_rgb(vec![0; 10], 4, 4, 1).is_err());
        let frame = Frame::from_rgb(vec![0; 48], 4, 4, 1).unwrap();
        assert_eq!(frame.dimensions(), (4, 4));
    }
}
