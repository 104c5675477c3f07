//! Frame buffer types shared by the render pipeline.
//!
//! A [`VideoFrame`] is the in-memory image the renderer mutates in
//! place: effects rewrite its pixels, the identifier strip is drawn
//! into its band rows, and the snapshot worker copies it out.
//! Rows are stored top to bottom; `(0, 0)` is the top-left pixel.

use std::time::Instant;

use serde::{Deserialize, Serialize};

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for frame buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha (camera default).
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }

    /// Byte offsets of the red, green and blue channels within a pixel.
    const fn rgb_offsets(self) -> (usize, usize, usize) {
        match self {
            PixelFormat::Bgra8 => (2, 1, 0),
            PixelFormat::Rgba8 | PixelFormat::Rgb8 => (0, 1, 2),
        }
    }

    const fn alpha_offset(self) -> Option<usize> {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => Some(3),
            PixelFormat::Rgb8 => None,
        }
    }
}

// ── Rgb ──────────────────────────────────────────────────────────

/// An 8-bit sRGB colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Relative luma in `0.0..=1.0` using BT.709 weights.
    pub fn luma(self) -> f32 {
        let r = self.r as f32 / 255.0;
        let g = self.g as f32 / 255.0;
        let b = self.b as f32 / 255.0;
        0.2126 * r + 0.7152 * g + 0.0722 * b
    }
}

// ── Rect ─────────────────────────────────────────────────────────

/// An axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Clip to a `width × height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Rect {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Rect {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
        }
    }
}

// ── VideoFrame ───────────────────────────────────────────────────

/// A raw, uncompressed video frame.
///
/// The `data` buffer holds `height` rows of `stride` bytes each.
/// `stride` may be larger than `width * bytes_per_pixel` when the
/// producer pads rows for alignment.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in **bytes** (may exceed `width * bpp`).
    pub stride: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Raw pixel data, `stride * height` bytes.
    pub data: Vec<u8>,
    /// Monotonic capture timestamp.
    pub timestamp: Instant,
}

impl VideoFrame {
    /// A tightly packed frame filled with a single colour.
    pub fn filled(width: u32, height: u32, format: PixelFormat, color: Rgb) -> Self {
        let stride = width * format.bytes_per_pixel() as u32;
        let mut frame = Self {
            width,
            height,
            stride,
            format,
            data: vec![0; stride as usize * height as usize],
            timestamp: Instant::now(),
        };
        frame.fill_rect(Rect::new(0, 0, width, height), color);
        frame
    }

    /// Wrap tightly packed RGB bytes (as produced by `image::RgbImage`).
    ///
    /// Returns `None` if `data` is not exactly `width * height * 3` bytes.
    pub fn from_rgb8(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != width as usize * height as usize * 3 {
            return None;
        }
        Some(Self {
            width,
            height,
            stride: width * 3,
            format: PixelFormat::Rgb8,
            data,
            timestamp: Instant::now(),
        })
    }

    /// Total byte size the raw bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// `true` when the frame is too small to carry or decode a strip.
    pub fn is_degenerate(&self) -> bool {
        self.width <= 1 || self.height <= 1
    }

    /// Returns a row slice (including possible padding bytes).
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        let end = start + self.stride as usize;
        &self.data[start..end]
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.stride as usize + x as usize * self.format.bytes_per_pixel()
    }

    /// Colour of the pixel at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is out of bounds.
    pub fn rgb_at(&self, x: u32, y: u32) -> Rgb {
        let base = self.offset(x, y);
        let (r, g, b) = self.format.rgb_offsets();
        Rgb::new(self.data[base + r], self.data[base + g], self.data[base + b])
    }

    /// Overwrite the pixel at `(x, y)`. Alpha, if present, becomes opaque.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is out of bounds.
    pub fn set_rgb(&mut self, x: u32, y: u32, color: Rgb) {
        let base = self.offset(x, y);
        let (r, g, b) = self.format.rgb_offsets();
        self.data[base + r] = color.r;
        self.data[base + g] = color.g;
        self.data[base + b] = color.b;
        if let Some(a) = self.format.alpha_offset() {
            self.data[base + a] = 255;
        }
    }

    /// Fill `rect` (clipped to the frame) with a solid colour.
    pub fn fill_rect(&mut self, rect: Rect, color: Rgb) {
        let rect = rect.clamp_to(self.width, self.height);
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                self.set_rgb(x, y, color);
            }
        }
    }

    /// Apply `f` to every pixel colour in place.
    pub fn map_pixels(&mut self, mut f: impl FnMut(Rgb) -> Rgb) {
        for y in 0..self.height {
            for x in 0..self.width {
                let mapped = f(self.rgb_at(x, y));
                self.set_rgb(x, y, mapped);
            }
        }
    }

    /// Average BT.709 luma over `rect`, or `None` if the clipped
    /// rectangle is empty.
    pub fn average_luma(&self, rect: Rect) -> Option<f32> {
        let rect = rect.clamp_to(self.width, self.height);
        if rect.is_empty() {
            return None;
        }
        let mut sum = 0.0f64;
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                sum += self.rgb_at(x, y).luma() as f64;
            }
        }
        let count = rect.width as f64 * rect.height as f64;
        Some((sum / count) as f32)
    }

    /// Tightly packed RGB copy of the frame (drops alpha and padding).
    pub fn to_rgb8(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                let px = self.rgb_at(x, y);
                out.extend_from_slice(&[px.r, px.g, px.b]);
            }
        }
        out
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgra_channel_order() {
        let mut frame = VideoFrame::filled(2, 2, PixelFormat::Bgra8, Rgb::BLACK);
        frame.set_rgb(1, 0, Rgb::new(10, 20, 30));
        assert_eq!(&frame.row(0)[4..8], &[30, 20, 10, 255]);
        assert_eq!(frame.rgb_at(1, 0), Rgb::new(10, 20, 30));
    }

    #[test]
    fn luma_extremes() {
        assert!((Rgb::WHITE.luma() - 1.0).abs() < 1e-6);
        assert_eq!(Rgb::BLACK.luma(), 0.0);
    }

    #[test]
    fn average_luma_over_half_white() {
        let mut frame = VideoFrame::filled(4, 2, PixelFormat::Rgba8, Rgb::BLACK);
        frame.fill_rect(Rect::new(0, 0, 2, 2), Rgb::WHITE);
        let avg = frame.average_luma(Rect::new(0, 0, 4, 2)).unwrap();
        assert!((avg - 0.5).abs() < 1e-4, "avg = {avg}");
        assert_eq!(frame.average_luma(Rect::new(4, 0, 2, 2)), None);
    }

    #[test]
    fn fill_rect_is_clipped() {
        let mut frame = VideoFrame::filled(3, 3, PixelFormat::Rgb8, Rgb::BLACK);
        frame.fill_rect(Rect::new(2, 2, 10, 10), Rgb::WHITE);
        assert_eq!(frame.rgb_at(2, 2), Rgb::WHITE);
        assert_eq!(frame.rgb_at(1, 1), Rgb::BLACK);
    }

    #[test]
    fn rgb8_roundtrip_through_packed_bytes() {
        let frame = VideoFrame::filled(3, 2, PixelFormat::Bgra8, Rgb::new(1, 2, 3));
        let packed = frame.to_rgb8();
        assert_eq!(packed.len(), 18);
        let back = VideoFrame::from_rgb8(3, 2, packed).unwrap();
        assert_eq!(back.rgb_at(2, 1), Rgb::new(1, 2, 3));
        assert!(VideoFrame::from_rgb8(3, 2, vec![0; 5]).is_none());
    }
}
